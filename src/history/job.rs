//! Job record types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Opaque job identifier, stable across restarts.
pub type JobId = i64;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Owned by a worker.
    Running,
    /// All items accounted for, none failed.
    Completed,
    /// Unrecoverable error or at least one failed item.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl JobStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states are absorbing: no transition ever leaves them.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Scheduling priority. Ordering matters: `High < Normal < Low` so that a
/// `(priority, position)` sort yields the pickup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    /// Picked before any waiting normal/low job.
    High = 0,
    /// Default.
    Normal = 1,
    /// Picked only when nothing else waits.
    Low = 2,
}

impl JobPriority {
    /// Integer stored in the `jobs.priority` column.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    /// Parses the stored integer, falling back to `Normal` for unknowns.
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::High,
            2 => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Item accounting for one job.
///
/// While the job is RUNNING, `completed + failed + skipped <= total`;
/// equality holds at COMPLETED/FAILED, and CANCELLED may stay short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    /// Items enumerated for this job.
    pub total: i64,
    /// Items downloaded successfully.
    pub completed: i64,
    /// Items that failed permanently.
    pub failed: i64,
    /// Items filtered out or already present.
    pub skipped: i64,
}

impl JobCounters {
    /// Items accounted for so far.
    #[must_use]
    pub fn settled(&self) -> i64 {
        self.completed + self.failed + self.skipped
    }
}

/// One persisted job row.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique identifier.
    pub job_id: JobId,
    /// Source URL as submitted.
    pub url: String,
    /// Engine classification (`native:<site>` | `gallery` | `ytdlp` | `generic`).
    pub engine: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Priority column (0 = high, 1 = normal, 2 = low).
    #[sqlx(rename = "priority")]
    pub priority_raw: i64,
    /// Insertion order used to break ties within a priority.
    pub position: i64,
    /// Destination root for the job.
    pub output_folder: String,
    /// Effective options as JSON.
    pub options_blob: String,
    /// Items enumerated.
    pub total_items: i64,
    /// Items downloaded successfully.
    pub completed_items: i64,
    /// Items that failed permanently.
    pub failed_items: i64,
    /// Items filtered out or already present.
    pub skipped_items: i64,
    /// Set iff the job FAILED.
    pub error_message: Option<String>,
    /// When the job was enqueued.
    pub created_at: String,
    /// When a worker picked the job up; cleared by crash recovery.
    pub started_at: Option<String>,
    /// When the job reached a terminal state.
    pub finished_at: Option<String>,
}

impl JobRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status_str.parse().unwrap_or(JobStatus::Pending)
    }

    /// Returns the parsed priority.
    #[must_use]
    pub fn priority(&self) -> JobPriority {
        JobPriority::from_i64(self.priority_raw)
    }

    /// Returns the counters snapshot.
    #[must_use]
    pub fn counters(&self) -> JobCounters {
        JobCounters {
            total: self.total_items,
            completed: self.completed_items,
            failed: self.failed_items,
            skipped: self.skipped_items,
        }
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job {{ id: {}, url: {}, status: {} }}",
            self.job_id,
            self.url,
            self.status()
        )
    }
}
