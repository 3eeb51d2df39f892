//! Spool: a universal media download engine.
//!
//! Feed the engine URLs and it does the rest: resolves each one to an
//! adapter, enumerates the media behind it, transfers items concurrently
//! while staying polite to every host, and writes each step durably so a
//! crash or restart resumes instead of re-downloading. UIs sit entirely
//! outside: they push commands through [`queue::QueueManager`] and watch
//! the typed event stream from [`events::EventBus`].
//!
//! Module map, roughly bottom-up:
//! - [`db`] / [`history`] - the SQLite state file and the job/item/event
//!   store that is the source of truth across restarts
//! - [`options`] - the typed per-job option surface and its two parsing
//!   boundaries (strict API, forgiving persistence)
//! - [`events`] - event vocabulary and in-process fan-out
//! - [`download`] - transfer building blocks: streaming HTTP, retry,
//!   per-host politeness, bandwidth, cancellation, progress throttling
//! - [`storage`] - staging files, atomic commits, naming, path templates
//! - [`adapter`] - the downloader contract, the resolution factory, and
//!   the built-in engine wrappers
//! - [`queue`] - the state machine and worker pool tying it all together

// Panics are bugs in library code: unwrap/expect stay confined to tests.
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod db;
pub mod download;
pub mod events;
pub mod history;
pub mod options;
pub mod queue;
pub mod storage;

// Flat re-exports so embedders can name the common types without walking
// the module tree.
pub use adapter::{
    AdapterError, DownloadContext, DownloadResult, Downloader, DownloaderFactory, EngineTag,
};
pub use db::StateDb;
pub use download::{
    BandwidthLimiter, CancelToken, DomainLimiter, DownloadError, HttpClient, ProgressThrottler,
    RetryPolicy, classify_error,
};
pub use events::{EventBus, EventKind, EventStream, JobEvent, LogLevel};
pub use history::{
    HistoryError, HistoryStore, ItemRecord, ItemStatus, JobCounters, JobId, JobPriority,
    JobRecord, JobStatus, Reorder,
};
pub use options::{DownloadOptions, FileNamingMode};
pub use queue::{DEFAULT_WORKERS, EngineConfig, JobReporter, QueueError, QueueManager};
pub use storage::FsAdapter;
