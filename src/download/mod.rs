//! Transfer machinery shared by every adapter.
//!
//! This module provides the pieces each item transfer is assembled from:
//!
//! - Streaming HTTP with `.part` staging and ranged resume
//! - Per-domain politeness (concurrency cap + request spacing)
//! - Retry with exponential backoff and Retry-After support
//! - A global bandwidth token bucket
//! - Cooperative cancellation
//! - Progress throttling and pre-transfer filters

pub mod bandwidth;
pub mod cancel;
mod client;
mod error;
pub mod filters;
pub mod limiter;
mod retry;
pub mod throttle;

pub use bandwidth::{BandwidthError, BandwidthLimiter};
pub use cancel::CancelToken;
pub use client::{
    DEFAULT_USER_AGENT, FetchOutcome, HttpClient, ProbeResult, parse_content_disposition,
};
pub use error::DownloadError;
pub use filters::{FileKind, ItemCandidate, ItemFilter, SkipReason};
pub use limiter::{DomainLimiter, DomainPermit, HostPolicy, LimiterError, extract_host};
pub use retry::{FailureKind, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
pub use throttle::{ProgressFrame, ProgressThrottler};
