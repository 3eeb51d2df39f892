//! Per-domain politeness: concurrency caps and request spacing.
//!
//! This module provides the [`DomainLimiter`] which bounds how hard the
//! engine hits any single host. Each host gets a counting semaphore
//! (`max_concurrent`, default 2) and a timestamp-guarded gate that spaces
//! slot acquisitions by `min_interval` (default 1000 ms, overridable per
//! host).
//!
//! # Overview
//!
//! [`DomainLimiter::acquire`] returns a [`DomainPermit`] - an RAII guard
//! that releases its slot and refreshes the spacing gate on every exit path.
//! Acquisition is cancellable: a waiter parked on either the semaphore or
//! the gate wakes as soon as the job's [`CancelToken`] fires.
//!
//! Excessive server-side rate limiting (429s) is fed back through
//! [`DomainLimiter::cooldown`], which doubles the host's spacing interval.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::cancel::CancelToken;

/// Default concurrent transfer slots per host.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Default minimum spacing between requests to the same host.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Ceiling for cooldown-doubled intervals.
const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Errors produced while acquiring a slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    /// The waiting acquisition was cancelled.
    #[error("cancelled while waiting for a slot on {host}")]
    Cancelled {
        /// The host being waited on.
        host: String,
    },
}

/// Per-host policy override.
#[derive(Debug, Clone, Copy)]
pub struct HostPolicy {
    /// Concurrent transfer slots for this host.
    pub max_concurrent: usize,
    /// Minimum spacing between requests to this host.
    pub min_interval: Duration,
}

/// State tracked for each host.
#[derive(Debug)]
struct HostState {
    /// Counting semaphore bounding concurrent transfers.
    semaphore: Arc<Semaphore>,
    /// Earliest instant the next acquisition may return.
    /// `None` means the host has never been requested (no delay).
    gate: Mutex<Option<Instant>>,
    /// Current effective spacing in milliseconds (doubled by cooldowns).
    interval_ms: AtomicU64,
}

impl HostState {
    fn new(policy: HostPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(policy.max_concurrent.max(1))),
            gate: Mutex::new(None),
            interval_ms: AtomicU64::new(duration_to_ms(policy.min_interval)),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Pushes the gate to `now + interval`, keeping the later deadline if
    /// one is already pending.
    fn refresh_gate(&self) {
        let deadline = Instant::now() + self.interval();
        let mut gate = lock_unpoisoned(&self.gate);
        *gate = Some(gate.map_or(deadline, |existing| existing.max(deadline)));
    }
}

/// Scoped slot on one host. Dropping the permit releases the slot and
/// refreshes the spacing gate, so `min_interval` elapses before the next
/// acquisition on the same host returns.
#[derive(Debug)]
pub struct DomainPermit {
    _permit: OwnedSemaphorePermit,
    state: Arc<HostState>,
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        self.state.refresh_gate();
    }
}

/// Per-host concurrency cap and minimum inter-request spacing.
///
/// Designed to be wrapped in `Arc` and shared across the worker pool; host
/// state lives in a `DashMap` so different hosts never contend.
#[derive(Debug)]
pub struct DomainLimiter {
    /// Policy applied to hosts without an override.
    default_policy: HostPolicy,
    /// Per-host overrides, fixed at construction.
    overrides: DashMap<String, HostPolicy>,
    /// Live per-host state.
    hosts: DashMap<String, Arc<HostState>>,
}

impl Default for DomainLimiter {
    fn default() -> Self {
        Self::new(HostPolicy {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            min_interval: DEFAULT_MIN_INTERVAL,
        })
    }
}

impl DomainLimiter {
    /// Creates a limiter with the given default policy.
    #[must_use]
    pub fn new(default_policy: HostPolicy) -> Self {
        Self {
            default_policy,
            overrides: DashMap::new(),
            hosts: DashMap::new(),
        }
    }

    /// Installs a per-host policy override. Takes effect for hosts whose
    /// state has not been created yet.
    pub fn set_host_policy(&self, host: impl Into<String>, policy: HostPolicy) {
        self.overrides.insert(host.into().to_lowercase(), policy);
    }

    /// Acquires a transfer slot for `host`, waiting for both a free slot
    /// and the spacing gate. Cancellation wakes the waiter immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::Cancelled`] when the token fires while
    /// waiting.
    #[instrument(skip(self, cancel))]
    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancelToken,
    ) -> Result<DomainPermit, LimiterError> {
        let state = self.host_state(host);

        let semaphore = Arc::clone(&state.semaphore);
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                // The semaphore is never closed while the limiter lives.
                permit.map_err(|_| LimiterError::Cancelled { host: host.to_string() })?
            }
            () = cancel.cancelled() => {
                debug!(host, "slot wait cancelled");
                return Err(LimiterError::Cancelled { host: host.to_string() });
            }
        };

        // Spacing gate: wait out the pending deadline, then claim it so
        // concurrent waiters on the same host don't burst through together.
        loop {
            let wait = {
                let mut gate = lock_unpoisoned(&state.gate);
                let now = Instant::now();
                match *gate {
                    Some(deadline) if deadline > now => deadline - now,
                    _ => {
                        *gate = Some(now + state.interval());
                        Duration::ZERO
                    }
                }
            };
            if wait.is_zero() {
                break;
            }
            debug!(host, wait_ms = wait.as_millis(), "waiting on spacing gate");
            if cancel.sleep(wait).await {
                debug!(host, "gate wait cancelled");
                // The un-wrapped permit releases the slot without touching
                // the gate; no request was made.
                drop(permit);
                return Err(LimiterError::Cancelled { host: host.to_string() });
            }
        }

        Ok(DomainPermit {
            _permit: permit,
            state,
        })
    }

    /// Doubles the host's spacing interval after excessive rate limiting.
    /// Returns the new interval.
    #[instrument(skip(self))]
    pub fn cooldown(&self, host: &str) -> Duration {
        let state = self.host_state(host);
        let current = state.interval_ms.load(Ordering::SeqCst);
        let doubled = (current.saturating_mul(2)).min(duration_to_ms(MAX_INTERVAL));
        state.interval_ms.store(doubled, Ordering::SeqCst);
        warn!(host, interval_ms = doubled, "host cooldown: spacing interval doubled");
        Duration::from_millis(doubled)
    }

    /// Current spacing interval for a host (test/diagnostic hook).
    #[must_use]
    pub fn current_interval(&self, host: &str) -> Duration {
        self.host_state(host).interval()
    }

    fn host_state(&self, host: &str) -> Arc<HostState> {
        let key = host.to_lowercase();
        // Clone the Arc so the DashMap shard lock is not held across awaits.
        self.hosts
            .entry(key.clone())
            .or_insert_with(|| {
                let policy = self
                    .overrides
                    .get(&key)
                    .map_or(self.default_policy, |p| *p);
                Arc::new(HostState::new(policy))
            })
            .clone()
    }
}

/// Extracts the lowercase host from a URL.
///
/// Unparseable URLs all map to the shared "unknown" bucket, so even
/// garbage input stays subject to politeness limits.
///
/// # Examples
///
/// ```
/// use spool_core::download::limiter::extract_host;
///
/// assert_eq!(extract_host("https://example.com/path"), "example.com");
/// assert_eq!(extract_host("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Locks a std mutex, recovering from poisoning.
///
/// The guarded state is a plain timestamp; a panicking holder cannot leave
/// it logically inconsistent.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
