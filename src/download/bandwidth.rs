//! Global bandwidth cap as a token bucket.
//!
//! One [`BandwidthLimiter`] is shared by every transfer in the engine;
//! workers block on token acquisition before consuming each chunk, so the
//! aggregate throughput stays at or below `bandwidth_limit_kbps`. Waits are
//! cancellation-aware.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::cancel::CancelToken;

/// Errors produced while waiting for bandwidth tokens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BandwidthError {
    /// The waiting transfer was cancelled.
    #[error("cancelled while waiting for bandwidth tokens")]
    Cancelled,
}

#[derive(Debug)]
struct BucketState {
    /// Available tokens, in bytes.
    tokens: f64,
    /// Last refill instant.
    last_refill: Instant,
}

/// Token bucket sized from `bandwidth_limit_kbps`.
///
/// The bucket holds at most one second of budget, so a long idle period
/// cannot bank an arbitrarily large burst.
#[derive(Debug)]
pub struct BandwidthLimiter {
    /// Refill rate in bytes per second; 0 = unlimited.
    rate: u64,
    state: Mutex<BucketState>,
}

impl BandwidthLimiter {
    /// Creates a limiter from the options value (KiB per second).
    #[must_use]
    pub fn from_kbps(kbps: u64) -> Self {
        Self::from_bytes_per_sec(kbps.saturating_mul(1024))
    }

    /// Creates a limiter with an explicit byte rate; 0 disables limiting.
    #[must_use]
    pub fn from_bytes_per_sec(rate: u64) -> Self {
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate_f64(rate),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a disabled limiter that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::from_bytes_per_sec(0)
    }

    /// True when no cap is configured.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Blocks until `bytes` tokens are available, then consumes them.
    ///
    /// # Errors
    ///
    /// Returns [`BandwidthError::Cancelled`] when the token fires during
    /// the wait.
    #[instrument(skip(self, cancel), fields(rate = self.rate))]
    pub async fn throttle(&self, bytes: u64, cancel: &CancelToken) -> Result<(), BandwidthError> {
        if self.rate == 0 {
            return Ok(());
        }

        loop {
            let wait = {
                let mut state = lock_unpoisoned(&self.state);
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.last_refill = now;
                state.tokens = (state.tokens + elapsed * rate_f64(self.rate))
                    .min(rate_f64(self.rate));

                let needed = rate_f64(bytes.min(self.rate));
                if state.tokens >= needed {
                    state.tokens -= needed;
                    return Ok(());
                }
                Duration::from_secs_f64((needed - state.tokens) / rate_f64(self.rate))
            };

            debug!(wait_ms = wait.as_millis(), "throttling transfer");
            if cancel.sleep(wait).await {
                return Err(BandwidthError::Cancelled);
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate_f64(rate: u64) -> f64 {
    rate as f64
}

/// Locks a std mutex, recovering from poisoning; the bucket state cannot be
/// left logically inconsistent by a panicking holder.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        tokio::time::pause();
        let limiter = BandwidthLimiter::unlimited();
        let cancel = CancelToken::new();

        let start = Instant::now();
        for _ in 0..100 {
            limiter.throttle(1_000_000, &cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(10));
        assert!(limiter.is_unlimited());
    }

    #[tokio::test]
    async fn test_burst_within_budget_is_immediate() {
        tokio::time::pause();
        let limiter = BandwidthLimiter::from_bytes_per_sec(10_000);
        let cancel = CancelToken::new();

        let start = Instant::now();
        limiter.throttle(10_000, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_exhausted_bucket_waits_for_refill() {
        tokio::time::pause();
        let limiter = BandwidthLimiter::from_bytes_per_sec(1000);
        let cancel = CancelToken::new();

        limiter.throttle(1000, &cancel).await.unwrap();

        let start = Instant::now();
        limiter.throttle(500, &cancel).await.unwrap();
        // 500 bytes at 1000 B/s => about half a second.
        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_oversized_request_clamped_to_rate() {
        tokio::time::pause();
        let limiter = BandwidthLimiter::from_bytes_per_sec(1000);
        let cancel = CancelToken::new();

        // A request larger than one second of budget costs one full bucket,
        // not an unbounded wait.
        let start = Instant::now();
        limiter.throttle(50_000, &cancel).await.unwrap();
        limiter.throttle(50_000, &cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_throttle_cancellable() {
        let limiter = std::sync::Arc::new(BandwidthLimiter::from_bytes_per_sec(10));
        let cancel = CancelToken::new();

        limiter.throttle(10, &cancel).await.unwrap();

        let waiter_limiter = std::sync::Arc::clone(&limiter);
        let waiter_cancel = cancel.clone();
        let waiter =
            tokio::spawn(async move { waiter_limiter.throttle(10, &waiter_cancel).await });

        tokio::task::yield_now().await;
        cancel.cancel();

        // The timeout bounds cancellation wake-up latency.
        let result = tokio::time::timeout(Duration::from_millis(250), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(BandwidthError::Cancelled));
    }

    #[test]
    fn test_from_kbps_converts_to_bytes() {
        let limiter = BandwidthLimiter::from_kbps(2);
        assert_eq!(limiter.rate, 2048);
    }
}
