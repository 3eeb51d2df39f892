//! Retry policy with exponential backoff for transient transfer failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureKind`] types for
//! classifying transfer errors and determining retry behavior.
//!
//! # Overview
//!
//! When a transfer fails, the error is classified into a [`FailureKind`]:
//! - [`FailureKind::Transient`] - temporary failures worth retrying
//! - [`FailureKind::RateLimited`] - HTTP 429, retried honoring Retry-After
//! - [`FailureKind::NeedsAuth`] - 401/403, not retried (cookie refresh hint)
//! - [`FailureKind::Parse`] - unexpected response shape, one retry permitted
//! - [`FailureKind::Permanent`] - retry would not help
//! - [`FailureKind::Fatal`] - filesystem trouble, fatal to the whole job
//! - [`FailureKind::Cancelled`] - not an error; never retried
//!
//! [`RetryPolicy::decide`] is a pure function of `(kind, attempt)` apart
//! from jitter; the jittered delay always lands in
//! `[base_delay, max_delay * 1.2]`.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use crate::options::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_S, DEFAULT_RETRY_MAX_DELAY_S, DownloadOptions,
};

/// HTTP statuses worth retrying. Everything else gives up immediately.
const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Jitter multiplier bounds: `1 + U(-0.2, +0.2)`.
const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

/// Classification of transfer failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: timeout, connection reset, retryable 5xx.
    Transient,

    /// Server rate limiting (HTTP 429). Retried with backoff, honoring
    /// Retry-After when the server supplies one.
    RateLimited,

    /// Authentication or authorization required (401/403, expired cookies).
    /// Not retried; the failure message suggests a cookie refresh.
    NeedsAuth,

    /// Unexpected response shape. One retry is permitted in case the first
    /// read raced a server-side hiccup.
    Parse,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404, 410, invalid URL.
    Permanent,

    /// Filesystem trouble (disk full, permission denied). Never retried and
    /// fatal to the whole job, not just the item.
    Fatal,

    /// Cancellation marker. Not an error; never retried.
    Cancelled,
}

/// Decision on whether to retry a failed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed; first retry is 2).
        attempt: u32,
    },

    /// Do not retry.
    GiveUp {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `base_delay`: 1 second
/// - `max_delay`: 30 seconds
///
/// # Delay Calculation
///
/// ```text
/// delay = clamp(min(base * 2^(attempt-1), max_delay) * jitter, base, max_delay * 1.2)
/// ```
///
/// where `jitter` is uniform in `[0.8, 1.2]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Delay ceiling, also the ceiling applied to Retry-After.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(DEFAULT_RETRY_BASE_DELAY_S),
            max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_S),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit settings.
    ///
    /// `max_attempts` is floored at 1; `max_delay` is floored at
    /// `base_delay`.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Builds the effective policy for one job from its options.
    #[must_use]
    pub fn from_options(options: &DownloadOptions) -> Self {
        Self::new(
            options.max_retries,
            Duration::from_secs(options.retry_base_delay_s),
            Duration::from_secs(options.retry_max_delay_s),
        )
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay ceiling.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Determines whether to retry a failed transfer.
    ///
    /// # Arguments
    ///
    /// * `kind` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        match kind {
            FailureKind::Cancelled => {
                return RetryDecision::GiveUp {
                    reason: "cancelled".to_string(),
                };
            }
            FailureKind::Fatal => {
                return RetryDecision::GiveUp {
                    reason: "filesystem error - fatal to the job".to_string(),
                };
            }
            FailureKind::NeedsAuth => {
                return RetryDecision::GiveUp {
                    reason: "authentication required - refresh your cookies and retry".to_string(),
                };
            }
            FailureKind::Permanent => {
                return RetryDecision::GiveUp {
                    reason: "permanent failure; retrying would not change the answer"
                        .to_string(),
                };
            }
            FailureKind::Parse => {
                // One parse retry, then give up.
                if attempt >= 2 {
                    return RetryDecision::GiveUp {
                        reason: "response still unparseable after one retry".to_string(),
                    };
                }
            }
            FailureKind::Transient | FailureKind::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("retry budget exhausted after {} attempts", self.max_attempts),
            };
        }

        let delay = self.backoff_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the jittered exponential backoff delay for an attempt.
    ///
    /// The result is clamped to `[base_delay, max_delay * 1.2]` so downward
    /// jitter never undercuts the base spacing.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = duration_ms(self.base_delay);
        let max_ms = duration_ms(self.max_delay);

        // attempt is 1-indexed: attempt 1 failed => 2^0 * base before jitter
        let exponent = attempt.saturating_sub(1).min(31);
        let raw_ms = (base_ms * f64::from(2_u32.pow(exponent))).min(max_ms);

        let jitter = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        let jittered_ms = (raw_ms * jitter).clamp(base_ms, max_ms * JITTER_HIGH);

        Duration::from_millis(jittered_ms as u64)
    }

    /// The delay to honor for a server-mandated Retry-After, with the
    /// policy ceiling applied.
    #[must_use]
    pub fn cap_retry_after(&self, retry_after: Duration) -> Duration {
        retry_after.min(self.max_delay)
    }
}

#[allow(clippy::cast_precision_loss)]
fn duration_ms(d: Duration) -> f64 {
    d.as_millis() as f64
}

/// Classifies a transfer error into a failure kind for retry decisions.
///
/// # HTTP Status Classification
///
/// | Status | Kind | Rationale |
/// |--------|------|-----------|
/// | 401, 403 | NeedsAuth | Expired or missing credentials |
/// | 404, 410 | Permanent | Resource gone |
/// | 408, 425 | Transient | Server asked us to try again |
/// | 429 | RateLimited | Back off, honor Retry-After |
/// | 500, 502, 503, 504 | Transient | Temporary server trouble |
/// | other | Permanent | Outside the retryable set |
///
/// # Non-HTTP Errors
///
/// Timeouts and most network errors are transient; TLS failures, invalid
/// URLs, and parse-exhaustion are permanent; filesystem errors are fatal.
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. } => FailureKind::Transient,

        DownloadError::Network { source, .. } => {
            // TLS/certificate trouble won't clear up on retry.
            if is_tls_error(source) {
                FailureKind::Permanent
            } else {
                FailureKind::Transient
            }
        }

        DownloadError::Parse { .. } | DownloadError::Integrity { .. } => FailureKind::Parse,

        DownloadError::Io { .. } | DownloadError::DiskFull { .. } => FailureKind::Fatal,

        DownloadError::InvalidUrl { .. } => FailureKind::Permanent,

        DownloadError::Cancelled { .. } => FailureKind::Cancelled,
    }
}

/// Classifies an HTTP status code into a failure kind.
fn classify_http_status(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::NeedsAuth,
        429 => FailureKind::RateLimited,
        s if RETRYABLE_STATUSES.contains(&s) => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both formats from RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2026 07:28:00 GMT`
///
/// Returns `None` for unparseable or negative values. The policy ceiling
/// is applied by [`RetryPolicy::cap_retry_after`], not here.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Integer seconds is the common case.
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    // HTTP-date: delay is the span from now to the given instant.
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        match datetime.duration_since(now) {
            Ok(duration) => Some(duration),
            Err(_) => {
                debug!(header_value, "Retry-After date is in the past, returning zero");
                Some(Duration::ZERO)
            }
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

/// Best-effort TLS detection: reqwest exposes no dedicated error kind, so
/// sniff the rendered error chain.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let rendered = error.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|marker| rendered.contains(marker))
}
