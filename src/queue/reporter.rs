//! Progress reporter handed to adapters.
//!
//! The reporter is the only path by which adapters touch engine state:
//! every call persists the change through the history store (same
//! transaction as its event row) and then publishes the event to the bus.
//! Adapters never mutate job rows directly.

use std::path::Path;

use tracing::{debug, instrument};

use crate::download::ProgressFrame;
use crate::events::{EventBus, EventKind, JobEvent, LogLevel};
use crate::history::{HistoryError, HistoryStore, ItemOutcome, JobCounters, JobId};

/// Reporter for one job, cloneable into adapter internals.
///
/// Lifecycle calls (`item_start`, `item_done`, `item_skip`, `item_fail`)
/// are persisted before they are published; `item_progress` and `log` are
/// transient bus-only traffic.
#[derive(Debug, Clone)]
pub struct JobReporter {
    job_id: JobId,
    history: HistoryStore,
    bus: EventBus,
}

impl JobReporter {
    /// Creates the reporter for one job.
    #[must_use]
    pub fn new(job_id: JobId, history: HistoryStore, bus: EventBus) -> Self {
        Self {
            job_id,
            history,
            bus,
        }
    }

    /// The job this reporter belongs to.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Records the enumerated item total.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    pub async fn set_total(&self, total: usize) -> Result<(), HistoryError> {
        self.history
            .set_total_items(self.job_id, i64::try_from(total).unwrap_or(i64::MAX))
            .await
    }

    /// True when the item completed in a previous run and should be skipped
    /// without recounting.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if the lookup fails.
    pub async fn is_already_completed(&self, item_key: &str) -> Result<bool, HistoryError> {
        self.history.is_item_completed(self.job_id, item_key).await
    }

    /// Marks an item DOWNLOADING and announces `ITEM_START`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    #[instrument(skip(self))]
    pub async fn item_start(
        &self,
        item_key: &str,
        url: &str,
        bytes_total: Option<u64>,
    ) -> Result<(), HistoryError> {
        self.history
            .record_item_start(self.job_id, item_key, url, bytes_total)
            .await?;
        self.publish(EventKind::ItemStart {
            item_key: item_key.to_string(),
            url: url.to_string(),
            bytes_total,
        });
        Ok(())
    }

    /// Publishes a throttled `ITEM_PROGRESS` frame. Bus-only and sync so
    /// the inner transfer loop can call it from a chunk callback.
    pub fn item_progress(&self, item_key: &str, frame: ProgressFrame) {
        self.publish(EventKind::ItemProgress {
            item_key: item_key.to_string(),
            bytes_done: frame.bytes_done,
            bytes_total: frame.bytes_total,
            speed_bps: frame.speed_bps,
            eta_s: frame.eta_s,
        });
    }

    /// Persists the item's byte counters after a transfer attempt. Row-only:
    /// progress events stay on the bus.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    pub async fn persist_progress(
        &self,
        item_key: &str,
        bytes_done: u64,
        bytes_total: Option<u64>,
    ) -> Result<(), HistoryError> {
        self.history
            .update_item_progress(self.job_id, item_key, bytes_done, bytes_total)
            .await
    }

    /// Records a completed item and announces `ITEM_DONE` + `JOB_PROGRESS`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    #[instrument(skip(self, file_path))]
    pub async fn item_done(
        &self,
        item_key: &str,
        file_path: &Path,
        bytes_total: u64,
    ) -> Result<JobCounters, HistoryError> {
        let path_text = file_path.display().to_string();
        let counters = self
            .history
            .finish_item(
                self.job_id,
                item_key,
                &ItemOutcome::Done {
                    file_path: path_text.clone(),
                    bytes_total,
                },
            )
            .await?;
        self.publish(EventKind::ItemDone {
            item_key: item_key.to_string(),
            file_path: path_text,
            bytes_total,
        });
        self.publish(EventKind::JobProgress { counters });
        Ok(counters)
    }

    /// Records a filtered item and announces `ITEM_SKIP` + `JOB_PROGRESS`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    #[instrument(skip(self))]
    pub async fn item_skip(
        &self,
        item_key: &str,
        reason: &str,
    ) -> Result<JobCounters, HistoryError> {
        let counters = self
            .history
            .finish_item(
                self.job_id,
                item_key,
                &ItemOutcome::Skip {
                    reason: reason.to_string(),
                },
            )
            .await?;
        self.publish(EventKind::ItemSkip {
            item_key: item_key.to_string(),
            reason: reason.to_string(),
        });
        self.publish(EventKind::JobProgress { counters });
        Ok(counters)
    }

    /// Records a failed item and announces `ITEM_FAIL` + `JOB_PROGRESS`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    #[instrument(skip(self, error))]
    pub async fn item_fail(
        &self,
        item_key: &str,
        error: &str,
    ) -> Result<JobCounters, HistoryError> {
        let counters = self
            .history
            .finish_item(
                self.job_id,
                item_key,
                &ItemOutcome::Fail {
                    error: error.to_string(),
                },
            )
            .await?;
        self.publish(EventKind::ItemFail {
            item_key: item_key.to_string(),
            error: error.to_string(),
        });
        self.publish(EventKind::JobProgress { counters });
        Ok(counters)
    }

    /// Records a cancelled item. Not counted and not evented; the job-level
    /// `JOB_CANCELLED` covers it.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if persistence fails.
    #[instrument(skip(self))]
    pub async fn item_cancelled(&self, item_key: &str) -> Result<(), HistoryError> {
        self.history
            .finish_item(self.job_id, item_key, &ItemOutcome::Cancelled)
            .await?;
        debug!(item_key, "item cancelled");
        Ok(())
    }

    /// Publishes a transient diagnostic `LOG` event.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.publish(EventKind::Log {
            message: message.into(),
            level,
        });
    }

    fn publish(&self, kind: EventKind) {
        self.bus.publish(JobEvent::now(self.job_id, kind));
    }
}
