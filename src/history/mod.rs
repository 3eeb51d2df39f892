//! Durable job/item/event history backed by SQLite.
//!
//! The history store is the sole source of truth across restarts. Every
//! observable state change (status transition, counter increment, item
//! terminal) is committed in the same transaction as the corresponding
//! event row, so the persisted per-job event stream always matches the
//! states on disk. Writes serialize through SQLite's WAL journal with a
//! busy timeout; reads proceed concurrently.
//!
//! # Overview
//!
//! - [`HistoryStore`] - narrow API the queue manager talks through
//! - [`JobRecord`] / [`JobStatus`] / [`JobPriority`] / [`JobCounters`]
//! - [`ItemRecord`] / [`ItemStatus`]
//! - [`EventRecord`] - one persisted event row
//! - [`HistoryError`] - operation error types

mod error;
mod item;
mod job;

pub use error::HistoryError;
pub use item::{ItemRecord, ItemStatus};
pub use job::{JobCounters, JobId, JobPriority, JobRecord, JobStatus};

use chrono::Utc;
use sqlx::{FromRow, Row, Sqlite, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::db::StateDb;
use crate::events::EventKind;
use crate::options::DownloadOptions;

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Terminal outcome of one item, as recorded by the progress reporter.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    /// Item fully on disk.
    Done {
        /// Final destination path.
        file_path: String,
        /// Size on disk.
        bytes_total: u64,
    },
    /// Item filtered out before (or instead of) transfer.
    Skip {
        /// Human-readable reason.
        reason: String,
    },
    /// Item failed permanently.
    Fail {
        /// Human-readable error.
        error: String,
    },
    /// Transfer aborted by cancellation. Not counted and not evented;
    /// the job-level `JOB_CANCELLED` covers it.
    Cancelled,
}

/// Where a reordered job should land within its priority band.
#[derive(Debug, Clone, Copy)]
pub enum Reorder {
    /// Move by a signed offset (negative = earlier).
    By(i64),
    /// Move to an absolute index within the band (clamped).
    To(usize),
}

/// One persisted event row.
#[derive(Debug, Clone, FromRow)]
pub struct EventRecord {
    /// Monotonic identifier; per-job event order follows this column.
    pub id: i64,
    /// The job this event belongs to.
    pub job_id: JobId,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Wire name (`JOB_ADDED`, `ITEM_DONE`, ...).
    #[sqlx(rename = "type")]
    pub type_str: String,
    /// Full payload as JSON (includes the `type` tag).
    pub payload_blob: String,
}

impl EventRecord {
    /// Deserializes the typed payload, if the blob is well-formed.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        serde_json::from_str(&self.payload_blob).ok()
    }
}

/// Durable, thread-safe persistence of jobs, items, and events.
///
/// Cloning shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: StateDb,
}

impl HistoryStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: StateDb) -> Self {
        Self { db }
    }

    // ==================== Job lifecycle ====================

    /// Inserts a new PENDING job and appends its `JOB_ADDED` event.
    ///
    /// The position counter is taken past the current maximum so FIFO order
    /// within a priority is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the insert fails.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn insert_job(
        &self,
        url: &str,
        engine_tentative: &str,
        priority: JobPriority,
        output_folder: &str,
        options: &DownloadOptions,
    ) -> Result<JobRecord> {
        let options_blob = serde_json::to_string(options)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.db.pool().begin().await?;

        let record = sqlx::query_as::<_, JobRecord>(
            r"INSERT INTO jobs (url, engine, status, priority, position, output_folder, options_blob, created_at)
              VALUES (?, ?, 'pending', ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM jobs), ?, ?, ?)
              RETURNING *",
        )
        .bind(url)
        .bind(engine_tentative)
        .bind(priority.as_i64())
        .bind(output_folder)
        .bind(&options_blob)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        append_event(
            &mut tx,
            record.job_id,
            &EventKind::JobAdded {
                url: url.to_string(),
                engine: engine_tentative.to_string(),
                output_folder: output_folder.to_string(),
            },
        )
        .await?;

        tx.commit().await?;

        info!(job_id = record.job_id, "job enqueued");
        Ok(record)
    }

    /// Atomically claims the highest-priority pending job for a worker.
    ///
    /// The winning job transitions to RUNNING with `started_at` set; ties
    /// within a priority resolve FIFO by position. Returns `None` when no
    /// pending job exists. No event is appended here - the worker appends
    /// `JOB_STARTED` via [`mark_started`](Self::mark_started) once the final
    /// engine classification is known, before any adapter call.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the claim fails.
    #[instrument(skip(self))]
    pub async fn claim_next_pending(&self) -> Result<Option<JobRecord>> {
        let now = Utc::now().to_rfc3339();
        let record = sqlx::query_as::<_, JobRecord>(
            r"UPDATE jobs
              SET status = 'running', started_at = ?
              WHERE job_id = (
                  SELECT job_id FROM jobs
                  WHERE status = 'pending'
                  ORDER BY priority ASC, position ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(&now)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(ref job) = record {
            debug!(job_id = job.job_id, "claimed pending job");
        }
        Ok(record)
    }

    /// Records the final engine classification and appends `JOB_STARTED`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::JobNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn mark_started(&self, job_id: JobId, engine: &str, url: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let affected = sqlx::query(r"UPDATE jobs SET engine = ? WHERE job_id = ?")
            .bind(engine)
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(HistoryError::JobNotFound(job_id));
        }

        append_event(
            &mut tx,
            job_id,
            &EventKind::JobStarted {
                url: url.to_string(),
                engine: engine.to_string(),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Transitions a job to a terminal state and appends `JOB_CANCELLED`
    /// (when cancelled) plus the final `JOB_DONE`.
    ///
    /// Only PENDING and RUNNING jobs can be finished; terminal states are
    /// absorbing. A job cancelled before pickup gets `started_at` backfilled
    /// alongside `finished_at` so terminal rows always carry both.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidState`] when the job is already
    /// terminal, or [`HistoryError::JobNotFound`] for an unknown id.
    #[instrument(skip(self, error_message))]
    pub async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<JobRecord> {
        debug_assert!(status.is_terminal());
        let now = Utc::now().to_rfc3339();

        let mut tx = self.db.pool().begin().await?;

        let record = sqlx::query_as::<_, JobRecord>(
            r"UPDATE jobs
              SET status = ?,
                  finished_at = ?,
                  started_at = COALESCE(started_at, ?),
                  error_message = ?
              WHERE job_id = ? AND status IN ('pending', 'running')
              RETURNING *",
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(&now)
        .bind(error_message)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            drop(tx);
            return Err(self.state_error(job_id, "finish").await);
        };

        if status == JobStatus::Cancelled {
            append_event(&mut tx, job_id, &EventKind::JobCancelled).await?;
        }
        append_event(
            &mut tx,
            job_id,
            &EventKind::JobDone {
                status,
                counters: record.counters(),
            },
        )
        .await?;

        tx.commit().await?;

        info!(job_id, status = %status, "job finished");
        Ok(record)
    }

    /// Returns a RUNNING job to PENDING (pause), preserving counters,
    /// priority, and position. `started_at` is cleared; the next pickup
    /// stamps a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidState`] when the job is not RUNNING.
    #[instrument(skip(self))]
    pub async fn pause_job(&self, job_id: JobId) -> Result<()> {
        let affected = sqlx::query(
            r"UPDATE jobs SET status = 'pending', started_at = NULL
              WHERE job_id = ? AND status = 'running'",
        )
        .bind(job_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(self.state_error(job_id, "pause").await);
        }
        Ok(())
    }

    /// Appends a persisted `JOB_ERROR` event.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the append fails.
    #[instrument(skip(self, error))]
    pub async fn append_job_error(&self, job_id: JobId, error: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        append_event(
            &mut tx,
            job_id,
            &EventKind::JobError {
                error: error.to_string(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ==================== Items ====================

    /// Records the enumerated item total for a job.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::JobNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn set_total_items(&self, job_id: JobId, total: i64) -> Result<()> {
        let affected = sqlx::query(r"UPDATE jobs SET total_items = ? WHERE job_id = ?")
            .bind(total)
            .bind(job_id)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(HistoryError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Upserts an item into DOWNLOADING and appends its `ITEM_START` event.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the upsert fails.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn record_item_start(
        &self,
        job_id: JobId,
        item_key: &str,
        url: &str,
        bytes_total: Option<u64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let total = bytes_total.and_then(|n| i64::try_from(n).ok());

        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r"INSERT INTO items (job_id, item_key, status, bytes_total, bytes_done, updated_at)
              VALUES (?, ?, 'downloading', ?, 0, ?)
              ON CONFLICT (job_id, item_key) DO UPDATE SET
                  status = 'downloading',
                  bytes_total = COALESCE(excluded.bytes_total, items.bytes_total),
                  updated_at = excluded.updated_at",
        )
        .bind(job_id)
        .bind(item_key)
        .bind(total)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        append_event(
            &mut tx,
            job_id,
            &EventKind::ItemStart {
                item_key: item_key.to_string(),
                url: url.to_string(),
                bytes_total,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Updates transfer progress for an item. No event row - progress is
    /// bus-only and this column only feeds the UI's job views.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the update fails.
    pub async fn update_item_progress(
        &self,
        job_id: JobId,
        item_key: &str,
        bytes_done: u64,
        bytes_total: Option<u64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"UPDATE items
              SET bytes_done = ?, bytes_total = COALESCE(?, bytes_total), updated_at = ?
              WHERE job_id = ? AND item_key = ?",
        )
        .bind(i64::try_from(bytes_done).unwrap_or(i64::MAX))
        .bind(bytes_total.and_then(|n| i64::try_from(n).ok()))
        .bind(&now)
        .bind(job_id)
        .bind(item_key)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Records one item's terminal state: upserts the item row, bumps the
    /// matching job counter, and appends the `ITEM_*` event plus the
    /// `JOB_PROGRESS` snapshot, all in one transaction.
    ///
    /// Cancelled items only update their row - they are neither counted nor
    /// evented, matching the CANCELLED-job counter inequality.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::JobNotFound`] for an unknown job.
    #[instrument(skip(self, outcome))]
    pub async fn finish_item(
        &self,
        job_id: JobId,
        item_key: &str,
        outcome: &ItemOutcome,
    ) -> Result<JobCounters> {
        let now = Utc::now().to_rfc3339();

        let (status, file_path, bytes_total) = match outcome {
            ItemOutcome::Done {
                file_path,
                bytes_total,
            } => (
                ItemStatus::Completed,
                Some(file_path.as_str()),
                Some(*bytes_total),
            ),
            ItemOutcome::Skip { .. } => (ItemStatus::Skipped, None, None),
            ItemOutcome::Fail { .. } => (ItemStatus::Failed, None, None),
            ItemOutcome::Cancelled => (ItemStatus::Cancelled, None, None),
        };
        let bytes_total_i64 = bytes_total.and_then(|n| i64::try_from(n).ok());
        let bytes_done_i64 = bytes_total_i64.unwrap_or(0);

        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r"INSERT INTO items (job_id, item_key, status, file_path, bytes_total, bytes_done, updated_at)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT (job_id, item_key) DO UPDATE SET
                  status = excluded.status,
                  file_path = COALESCE(excluded.file_path, items.file_path),
                  bytes_total = COALESCE(excluded.bytes_total, items.bytes_total),
                  bytes_done = MAX(excluded.bytes_done, items.bytes_done),
                  updated_at = excluded.updated_at",
        )
        .bind(job_id)
        .bind(item_key)
        .bind(status.as_str())
        .bind(file_path)
        .bind(bytes_total_i64)
        .bind(if status == ItemStatus::Completed {
            bytes_done_i64
        } else {
            0
        })
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let counter_column = match status {
            ItemStatus::Completed => Some("completed_items"),
            ItemStatus::Failed => Some("failed_items"),
            ItemStatus::Skipped => Some("skipped_items"),
            _ => None,
        };

        if let Some(column) = counter_column {
            let affected =
                sqlx::query(&format!("UPDATE jobs SET {column} = {column} + 1 WHERE job_id = ?"))
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            if affected == 0 {
                return Err(HistoryError::JobNotFound(job_id));
            }
        }

        let row = sqlx::query(
            r"SELECT total_items, completed_items, failed_items, skipped_items
              FROM jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(HistoryError::JobNotFound(job_id))?;
        let counters = JobCounters {
            total: row.get("total_items"),
            completed: row.get("completed_items"),
            failed: row.get("failed_items"),
            skipped: row.get("skipped_items"),
        };

        let item_event = match outcome {
            ItemOutcome::Done {
                file_path,
                bytes_total,
            } => Some(EventKind::ItemDone {
                item_key: item_key.to_string(),
                file_path: file_path.clone(),
                bytes_total: *bytes_total,
            }),
            ItemOutcome::Skip { reason } => Some(EventKind::ItemSkip {
                item_key: item_key.to_string(),
                reason: reason.clone(),
            }),
            ItemOutcome::Fail { error } => Some(EventKind::ItemFail {
                item_key: item_key.to_string(),
                error: error.clone(),
            }),
            ItemOutcome::Cancelled => None,
        };

        if let Some(kind) = item_event {
            append_event(&mut tx, job_id, &kind).await?;
            append_event(&mut tx, job_id, &EventKind::JobProgress { counters }).await?;
        }

        tx.commit().await?;
        Ok(counters)
    }

    /// True when `(job_id, item_key)` already completed in a previous run.
    /// Used for idempotent resume: completed items are skipped without
    /// recounting.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn is_item_completed(&self, job_id: JobId, item_key: &str) -> Result<bool> {
        let row = sqlx::query(
            r"SELECT COUNT(*) AS count FROM items
              WHERE job_id = ? AND item_key = ? AND status = 'completed'",
        )
        .bind(job_id)
        .bind(item_key)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Lists item rows for a job.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn items_for_job(&self, job_id: JobId) -> Result<Vec<ItemRecord>> {
        let items = sqlx::query_as::<_, ItemRecord>(
            r"SELECT * FROM items WHERE job_id = ? ORDER BY item_key ASC",
        )
        .bind(job_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(items)
    }

    /// Destination paths of items that never completed, used to sweep
    /// leftover `.part` files after cancellation or crash.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn incomplete_item_paths(&self, job_id: JobId) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"SELECT file_path FROM items
              WHERE job_id = ? AND status != 'completed' AND file_path IS NOT NULL",
        )
        .bind(job_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.get("file_path")).collect())
    }

    // ==================== Queries ====================

    /// Fetches one job.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(r"SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(record)
    }

    /// Lists jobs, optionally filtered by status, in scheduling order.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        let records = match status {
            Some(status) => {
                sqlx::query_as::<_, JobRecord>(
                    r"SELECT * FROM jobs WHERE status = ?
                      ORDER BY priority ASC, position ASC",
                )
                .bind(status.as_str())
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRecord>(
                    r"SELECT * FROM jobs ORDER BY priority ASC, position ASC",
                )
                .fetch_all(self.db.pool())
                .await?
            }
        };
        Ok(records)
    }

    /// Returns `(status, count)` pairs for the whole table.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn counts_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows = sqlx::query(r"SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let status: String = row.get("status");
                status
                    .parse::<JobStatus>()
                    .ok()
                    .map(|s| (s, row.get::<i64, _>("count")))
            })
            .collect())
    }

    /// Finds an existing PENDING/RUNNING job for the same URL, used to make
    /// enqueue idempotent for duplicate submissions.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn active_job_for_url(&self, url: &str) -> Result<Option<JobId>> {
        let row = sqlx::query(
            r"SELECT job_id FROM jobs
              WHERE url = ? AND status IN ('pending', 'running')
              ORDER BY job_id ASC LIMIT 1",
        )
        .bind(url)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|r| r.get("job_id")))
    }

    /// Persisted events for a job after `since_event_id`, in stream order.
    /// This is how late subscribers catch up.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn recent_events(
        &self,
        job_id: JobId,
        since_event_id: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let events = sqlx::query_as::<_, EventRecord>(
            r"SELECT * FROM events WHERE job_id = ? AND id > ? ORDER BY id ASC",
        )
        .bind(job_id)
        .bind(since_event_id.unwrap_or(0))
        .fetch_all(self.db.pool())
        .await?;
        Ok(events)
    }

    // ==================== Queue maintenance ====================

    /// Removes a job (cascading its items and events). Only PENDING and
    /// terminal jobs may be removed; a RUNNING job must be cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidState`] for a RUNNING job, or
    /// [`HistoryError::JobNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn remove_job(&self, job_id: JobId) -> Result<()> {
        let affected = sqlx::query(r"DELETE FROM jobs WHERE job_id = ? AND status != 'running'")
            .bind(job_id)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(self.state_error(job_id, "remove").await);
        }
        Ok(())
    }

    /// Removes all COMPLETED jobs. Returns how many were purged.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_completed(&self) -> Result<u64> {
        let result = sqlx::query(r"DELETE FROM jobs WHERE status = 'completed'")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Moves a PENDING job within its priority band.
    ///
    /// Position values are permuted among the band's jobs, so ordering
    /// relative to other priorities is untouched and global positions stay
    /// unique.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidState`] when the job is not PENDING.
    #[instrument(skip(self))]
    pub async fn reorder_pending(&self, job_id: JobId, target: Reorder) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let job = sqlx::query_as::<_, JobRecord>(r"SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(HistoryError::JobNotFound(job_id))?;
        if job.status() != JobStatus::Pending {
            return Err(HistoryError::InvalidState {
                job_id,
                current: job.status_str,
                operation: "reorder",
            });
        }

        let band = sqlx::query_as::<_, JobRecord>(
            r"SELECT * FROM jobs WHERE status = 'pending' AND priority = ?
              ORDER BY position ASC",
        )
        .bind(job.priority_raw)
        .fetch_all(&mut *tx)
        .await?;

        let positions: Vec<i64> = band.iter().map(|j| j.position).collect();
        let mut ids: Vec<JobId> = band.iter().map(|j| j.job_id).collect();
        let Some(current_index) = ids.iter().position(|id| *id == job_id) else {
            return Err(HistoryError::JobNotFound(job_id));
        };

        let new_index = match target {
            Reorder::By(delta) => {
                let raw = i64::try_from(current_index).unwrap_or(i64::MAX) + delta;
                usize::try_from(raw.max(0)).unwrap_or(0).min(ids.len() - 1)
            }
            Reorder::To(index) => index.min(ids.len() - 1),
        };

        let id = ids.remove(current_index);
        ids.insert(new_index, id);

        for (id, position) in ids.iter().zip(positions.iter()) {
            sqlx::query(r"UPDATE jobs SET position = ? WHERE job_id = ?")
                .bind(position)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== Crash recovery ====================

    /// Startup recovery: every job left RUNNING is treated as crashed.
    ///
    /// For each, a `JOB_ERROR("crashed during run")` event is appended, the
    /// job resets to PENDING with `started_at` cleared, counters and item
    /// rows preserved, and in-flight items drop back to PENDING. Returns the
    /// recovered records so the caller can emit bus events and re-queue.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if recovery fails.
    #[instrument(skip(self))]
    pub async fn recover_running_jobs(&self) -> Result<Vec<JobRecord>> {
        let crashed = sqlx::query_as::<_, JobRecord>(
            r"SELECT * FROM jobs WHERE status = 'running' ORDER BY priority ASC, position ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut recovered = Vec::with_capacity(crashed.len());
        for job in crashed {
            warn!(job_id = job.job_id, "job was running at startup; treating as crashed");

            let mut tx = self.db.pool().begin().await?;
            append_event(
                &mut tx,
                job.job_id,
                &EventKind::JobError {
                    error: "crashed during run".to_string(),
                },
            )
            .await?;
            sqlx::query(
                r"UPDATE jobs SET status = 'pending', started_at = NULL WHERE job_id = ?",
            )
            .bind(job.job_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r"UPDATE items SET status = 'pending', updated_at = ?
                  WHERE job_id = ? AND status = 'downloading'",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(job.job_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            if let Some(record) = self.get_job(job.job_id).await? {
                recovered.push(record);
            }
        }

        Ok(recovered)
    }

    // ==================== Helpers ====================

    /// Builds the precise error for a rejected state-dependent operation.
    async fn state_error(&self, job_id: JobId, operation: &'static str) -> HistoryError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => HistoryError::InvalidState {
                job_id,
                current: job.status_str,
                operation,
            },
            Ok(None) => HistoryError::JobNotFound(job_id),
            Err(err) => err,
        }
    }
}

/// Appends one event row inside an open transaction.
async fn append_event(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: JobId,
    kind: &EventKind,
) -> Result<i64> {
    let payload = serde_json::to_string(kind)?;
    let row = sqlx::query(
        r"INSERT INTO events (job_id, timestamp, type, payload_blob)
          VALUES (?, ?, ?, ?)
          RETURNING id",
    )
    .bind(job_id)
    .bind(Utc::now().to_rfc3339())
    .bind(kind.type_name())
    .bind(&payload)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}
