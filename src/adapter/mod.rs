//! The downloader contract and its implementations.
//!
//! Every site or engine integration implements [`Downloader`]: a cheap,
//! pure [`can_handle`](Downloader::can_handle) check used by the factory,
//! a [`site_name`](Downloader::site_name) for the `engine` classification,
//! and the [`download`](Downloader::download) entry point that runs the
//! whole job against a [`DownloadContext`].
//!
//! # Architecture
//!
//! - [`Downloader`] - async trait adapters implement
//! - [`DownloaderFactory`] - URL resolution with a 4-tier fallback
//! - [`GenericAdapter`] - last-resort HTML media scraper
//! - [`YtDlpAdapter`] - universal video engine wrapper (child process)
//! - [`GalleryDlAdapter`] - multi-gallery engine wrapper (child process)
//! - [`transfer`] - the shared per-item pipeline (filters, limiter, retry,
//!   streaming, atomic commit) native adapters build on

mod factory;
mod gallerydl;
mod generic;
mod process;
pub mod transfer;
mod ytdlp;

pub use factory::{DownloaderFactory, EngineTag};
pub use gallerydl::GalleryDlAdapter;
pub use generic::GenericAdapter;
pub use transfer::{MediaItem, download_enumerated};
pub use ytdlp::YtDlpAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::download::{BandwidthLimiter, CancelToken, DomainLimiter};
use crate::history::JobId;
use crate::options::DownloadOptions;
use crate::queue::JobReporter;
use crate::storage::FsAdapter;

/// Unrecoverable adapter failure: the job transitions to FAILED with this
/// message. Per-item trouble never surfaces here - it goes through
/// `report.item_fail` and the job continues.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter cannot continue this job.
    #[error("{0}")]
    Fatal(String),
}

impl AdapterError {
    /// Creates a fatal adapter error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// Everything an adapter receives for one job run.
///
/// Options are a snapshot taken at enqueue time; the cancellation token is
/// shared with the queue manager; the reporter is the only write path into
/// engine state.
#[derive(Debug, Clone)]
pub struct DownloadContext {
    /// The job being run.
    pub job_id: JobId,
    /// Source URL as submitted.
    pub url: String,
    /// Effective options snapshot.
    pub options: DownloadOptions,
    /// Cooperative cancellation handle. Adapters must observe it at every
    /// item boundary and at least once per chunk, stopping within 2 s.
    pub cancel: CancelToken,
    /// Progress reporter; keeps counters and events consistent.
    pub reporter: JobReporter,
    /// Filesystem adapter rooted at the job's output folder.
    pub fs: FsAdapter,
    /// Shared per-domain politeness layer.
    pub limiter: Arc<DomainLimiter>,
    /// Shared global bandwidth bucket.
    pub bandwidth: Arc<BandwidthLimiter>,
}

/// Outcome summary an adapter returns for one job.
///
/// Contract: `success == (failed_files empty && not cancelled)` and the
/// counts match the events the adapter reported.
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    /// Whether the job ran to completion with no failures.
    pub success: bool,
    /// Items enumerated.
    pub total_files: usize,
    /// Items accounted for (completed + skipped).
    pub completed_files: usize,
    /// Item keys that failed permanently.
    pub failed_files: Vec<String>,
    /// Item keys that were filtered out.
    pub skipped_files: Vec<String>,
    /// Set when the run ended with an error worth surfacing.
    pub error_message: Option<String>,
}

impl DownloadResult {
    /// Settles the `success` flag per the contract.
    #[must_use]
    pub fn settled(mut self, cancelled: bool) -> Self {
        self.success = self.failed_files.is_empty() && !cancelled;
        self
    }
}

/// Abstract capability a site adapter must provide.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Short name for logging and the `engine` classification
    /// (e.g. `"erome"`, `"ytdlp"`, `"generic"`).
    fn site_name(&self) -> &'static str;

    /// Cheap syntactic check: can this adapter handle the URL? Must be pure
    /// and fast - no I/O. Used by the factory's resolution tiers.
    fn can_handle(&self, url: &str) -> bool;

    /// Runs the whole job: enumerate items, download each obeying the
    /// limiter, retry policy, and cancellation, reporting through
    /// `ctx.reporter`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] only for unrecoverable job-level failures.
    async fn download(&self, ctx: &DownloadContext) -> Result<DownloadResult, AdapterError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_result_settled_contract() {
        let result = DownloadResult {
            total_files: 3,
            completed_files: 3,
            ..Default::default()
        };
        assert!(result.settled(false).success);

        let with_failure = DownloadResult {
            total_files: 3,
            completed_files: 2,
            failed_files: vec!["b.mp4".to_string()],
            ..Default::default()
        };
        assert!(!with_failure.settled(false).success);

        let clean_but_cancelled = DownloadResult {
            total_files: 3,
            completed_files: 1,
            ..Default::default()
        };
        assert!(!clean_but_cancelled.settled(true).success);
    }

    #[test]
    fn test_adapter_error_message_passthrough() {
        let error = AdapterError::fatal("disk full writing to /out");
        assert_eq!(error.to_string(), "disk full writing to /out");
    }
}
