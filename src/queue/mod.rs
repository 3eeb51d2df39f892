//! Job queue: lifecycle state machine, worker pool, and the command
//! surface consumed by UIs.
//!
//! The [`QueueManager`] owns all in-memory mutation of running jobs. A
//! fixed pool of workers claims PENDING jobs in `(priority, position)`
//! order, resolves each URL through the adapter factory, and drives the
//! adapter with a per-job cancellation handle. Every state transition is
//! persisted through the history store before the matching event reaches
//! the bus.
//!
//! # Overview
//!
//! - [`QueueManager`] - commands: enqueue, cancel, pause, resume, reorder,
//!   remove, `clear_completed`, `recover_on_startup`, subscribe
//! - [`JobReporter`] - the adapters' write path into engine state
//! - [`EngineConfig`] - worker count, output root, bandwidth cap

mod reporter;
mod worker;

pub use reporter::JobReporter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::adapter::DownloaderFactory;
use crate::download::{BandwidthLimiter, CancelToken, DomainLimiter};
use crate::events::{EventBus, EventKind, EventStream, JobEvent, LogLevel};
use crate::history::{
    EventRecord, HistoryError, HistoryStore, JobId, JobPriority, JobRecord, JobStatus, Reorder,
};
use crate::options::{DownloadOptions, OptionsError};

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 3;

/// How long a cancelled adapter gets to return before its task is aborted.
pub(crate) const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Errors surfaced by queue commands.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Durable state failure.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// Rejected options at the API boundary.
    #[error("invalid options: {0}")]
    Options(#[from] OptionsError),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Engine-level configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Output root for jobs that don't specify their own folder.
    pub output_folder: PathBuf,
    /// Engine-wide bandwidth cap in KiB/s; 0 = unlimited. Jobs with their
    /// own `bandwidth_limit_kbps` get a dedicated bucket instead.
    pub bandwidth_limit_kbps: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            output_folder: PathBuf::from("downloads"),
            bandwidth_limit_kbps: 0,
        }
    }
}

/// Tokens held for one running job.
#[derive(Debug, Clone)]
pub(crate) struct RunningJob {
    /// Fires on user cancellation.
    pub(crate) cancel: CancelToken,
    /// Fires on pause; in-flight items resolve as cancelled, then the job
    /// returns to PENDING.
    pub(crate) pause: CancelToken,
}

/// Shared engine state behind the manager handle.
pub(crate) struct Engine {
    pub(crate) history: HistoryStore,
    pub(crate) bus: EventBus,
    pub(crate) factory: DownloaderFactory,
    pub(crate) limiter: Arc<DomainLimiter>,
    pub(crate) global_bandwidth: Arc<BandwidthLimiter>,
    pub(crate) config: EngineConfig,
    pub(crate) work_available: Notify,
    pub(crate) running: Mutex<HashMap<JobId, RunningJob>>,
    pub(crate) shutdown: CancelToken,
}

impl Engine {
    pub(crate) fn publish(&self, job_id: JobId, kind: EventKind) {
        self.bus.publish(JobEvent::now(job_id, kind));
    }

    pub(crate) fn running_tokens(&self, job_id: JobId) -> Option<RunningJob> {
        lock_unpoisoned(&self.running).get(&job_id).cloned()
    }
}

/// The download engine's command surface. Cloning shares the engine.
#[derive(Clone)]
pub struct QueueManager {
    engine: Arc<Engine>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl QueueManager {
    /// Builds a queue manager over explicit collaborators.
    ///
    /// Call [`recover_on_startup`](Self::recover_on_startup) and then
    /// [`start`](Self::start) to begin processing.
    #[must_use]
    pub fn new(
        history: HistoryStore,
        bus: EventBus,
        factory: DownloaderFactory,
        config: EngineConfig,
    ) -> Self {
        let global_bandwidth = Arc::new(BandwidthLimiter::from_kbps(config.bandwidth_limit_kbps));
        Self {
            engine: Arc::new(Engine {
                history,
                bus,
                factory,
                limiter: Arc::new(DomainLimiter::default()),
                global_bandwidth,
                config,
                work_available: Notify::new(),
                running: Mutex::new(HashMap::new()),
                shutdown: CancelToken::new(),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The shared per-domain limiter (for per-host policy overrides).
    #[must_use]
    pub fn domain_limiter(&self) -> Arc<DomainLimiter> {
        Arc::clone(&self.engine.limiter)
    }

    /// Spawns the worker pool. Idempotent: extra calls are ignored once
    /// workers exist.
    #[instrument(skip(self))]
    pub fn start(&self) {
        let mut workers = lock_unpoisoned(&self.workers);
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.engine.config.workers.max(1) {
            let engine = Arc::clone(&self.engine);
            workers.push(tokio::spawn(worker::worker_loop(engine, worker_id)));
        }
        info!(workers = workers.len(), "worker pool started");
    }

    /// Stops the worker pool: cancels every running job, wakes idle
    /// workers, and waits for them to exit.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.engine.shutdown.cancel();
        for job in lock_unpoisoned(&self.engine.running).values() {
            job.cancel.cancel();
        }
        self.engine.work_available.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }

    // ==================== Commands ====================

    /// Enqueues a URL with default priority into the engine's output root.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Options`] for unknown option keys and
    /// [`QueueError::History`] for persistence failures.
    pub async fn enqueue(&self, url: &str, options: &Value) -> Result<JobId> {
        self.enqueue_with(url, options, JobPriority::Normal, None).await
    }

    /// Enqueues with explicit priority and/or output folder.
    ///
    /// Duplicate submissions of a URL that is already PENDING/RUNNING
    /// return the existing job id instead of queueing twice.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Options`] for unknown option keys and
    /// [`QueueError::History`] for persistence failures.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn enqueue_with(
        &self,
        url: &str,
        options: &Value,
        priority: JobPriority,
        output_folder: Option<PathBuf>,
    ) -> Result<JobId> {
        let (options, notes) = DownloadOptions::from_api_json(options)?;

        if let Some(existing) = self.engine.history.active_job_for_url(url).await? {
            debug!(job_id = existing, "duplicate enqueue; returning active job");
            return Ok(existing);
        }

        let folder = output_folder.unwrap_or_else(|| self.engine.config.output_folder.clone());
        let tentative = self.engine.factory.resolve(url).tag.label();

        let record = self
            .engine
            .history
            .insert_job(url, &tentative, priority, &folder.display().to_string(), &options)
            .await?;

        self.engine.publish(
            record.job_id,
            EventKind::JobAdded {
                url: url.to_string(),
                engine: tentative,
                output_folder: folder.display().to_string(),
            },
        );
        for note in notes {
            self.engine
                .publish(record.job_id, EventKind::Log {
                    message: format!("option adjusted: {note}"),
                    level: LogLevel::Warning,
                });
        }

        self.engine.work_available.notify_waiters();
        Ok(record.job_id)
    }

    /// Cancels a job. Idempotent: cancelling a terminal job is a no-op.
    ///
    /// A PENDING job transitions immediately; a RUNNING job's token is
    /// fired and the worker completes the transition within the grace
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        if let Some(tokens) = self.engine.running_tokens(job_id) {
            info!(job_id, "cancelling running job");
            tokens.cancel.cancel();
            return Ok(());
        }

        let Some(job) = self.engine.history.get_job(job_id).await? else {
            return Err(QueueError::History(HistoryError::JobNotFound(job_id)));
        };
        if job.status().is_terminal() {
            return Ok(());
        }

        let record = self
            .engine
            .history
            .finish_job(job_id, JobStatus::Cancelled, None)
            .await?;
        self.engine.publish(job_id, EventKind::JobCancelled);
        self.engine.publish(
            job_id,
            EventKind::JobDone {
                status: JobStatus::Cancelled,
                counters: record.counters(),
            },
        );
        Ok(())
    }

    /// Pauses a RUNNING job: in-flight items resolve to CANCELLED, the job
    /// returns to PENDING with its priority preserved, and the worker slot
    /// frees up. Pausing a PENDING job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] when the job is terminal or
    /// unknown.
    #[instrument(skip(self))]
    pub async fn pause(&self, job_id: JobId) -> Result<()> {
        if let Some(tokens) = self.engine.running_tokens(job_id) {
            info!(job_id, "pausing running job");
            tokens.pause.cancel();
            return Ok(());
        }

        let Some(job) = self.engine.history.get_job(job_id).await? else {
            return Err(QueueError::History(HistoryError::JobNotFound(job_id)));
        };
        match job.status() {
            JobStatus::Pending => Ok(()),
            status => Err(QueueError::History(HistoryError::InvalidState {
                job_id,
                current: status.as_str().to_string(),
                operation: "pause",
            })),
        }
    }

    /// Resumes a paused (PENDING) job by waking the worker pool. Resuming
    /// a RUNNING job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] when the job is terminal or
    /// unknown.
    #[instrument(skip(self))]
    pub async fn resume(&self, job_id: JobId) -> Result<()> {
        let Some(job) = self.engine.history.get_job(job_id).await? else {
            return Err(QueueError::History(HistoryError::JobNotFound(job_id)));
        };
        match job.status() {
            JobStatus::Pending => {
                self.engine.work_available.notify_waiters();
                Ok(())
            }
            JobStatus::Running => Ok(()),
            status => Err(QueueError::History(HistoryError::InvalidState {
                job_id,
                current: status.as_str().to_string(),
                operation: "resume",
            })),
        }
    }

    /// Moves a PENDING job within its priority band.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] when the job is not PENDING.
    pub async fn reorder(&self, job_id: JobId, target: Reorder) -> Result<()> {
        self.engine.history.reorder_pending(job_id, target).await?;
        Ok(())
    }

    /// Removes a PENDING or terminal job and its history.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for RUNNING jobs.
    pub async fn remove(&self, job_id: JobId) -> Result<()> {
        self.engine.history.remove_job(job_id).await?;
        Ok(())
    }

    /// Purges all COMPLETED jobs. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    pub async fn clear_completed(&self) -> Result<u64> {
        Ok(self.engine.history.clear_completed().await?)
    }

    // ==================== Views ====================

    /// Lists jobs, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        Ok(self.engine.history.list_jobs(status).await?)
    }

    /// Fetches one job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.engine.history.get_job(job_id).await?)
    }

    /// Persisted events for late subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    pub async fn recent_events(
        &self,
        job_id: JobId,
        since_event_id: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        Ok(self.engine.history.recent_events(job_id, since_event_id).await?)
    }

    /// Opens a live event subscription.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        self.engine.bus.subscribe()
    }

    // ==================== Recovery ====================

    /// Startup crash recovery: RUNNING jobs found in history are reset to
    /// PENDING (a persisted `JOB_ERROR` marks the crash), their in-flight
    /// items drop back to PENDING, and leftover `.part` files are swept.
    ///
    /// Call before [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    #[instrument(skip(self))]
    pub async fn recover_on_startup(&self) -> Result<Vec<JobId>> {
        let recovered = self.engine.history.recover_running_jobs().await?;
        let mut ids = Vec::with_capacity(recovered.len());

        for job in recovered {
            self.engine.publish(
                job.job_id,
                EventKind::JobError {
                    error: "crashed during run".to_string(),
                },
            );
            worker::sweep_part_files(&self.engine, job.job_id).await;
            ids.push(job.job_id);
        }

        if !ids.is_empty() {
            info!(count = ids.len(), "recovered crashed jobs");
            self.engine.work_available.notify_waiters();
        }
        Ok(ids)
    }

    /// Waits until no PENDING or RUNNING jobs remain. A CLI convenience,
    /// not part of the UI command surface.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::History`] for persistence failures.
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let counts = self.engine.history.counts_by_status().await?;
            let active: i64 = counts
                .iter()
                .filter(|(status, _)| !status.is_terminal())
                .map(|(_, count)| count)
                .sum();
            if active == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    }
}

/// Locks a std mutex, recovering from poisoning; the registries guarded
/// here stay consistent regardless of a panicking holder.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
