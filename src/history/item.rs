//! Item record types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::job::JobId;

/// Lifecycle status of one media item within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Enumerated but not yet transferred.
    Pending,
    /// Transfer in flight.
    Downloading,
    /// Fully on disk.
    Completed,
    /// Failed permanently after retries.
    Failed,
    /// Filtered out or already present.
    Skipped,
    /// Transfer aborted by cancellation.
    Cancelled,
}

impl ItemStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid item status: {s}")),
        }
    }
}

/// One persisted item row. The `(job_id, item_key)` pair is the identity
/// used for idempotent resume: a restart skips rows already COMPLETED.
#[derive(Debug, Clone, FromRow)]
pub struct ItemRecord {
    /// Owning job.
    pub job_id: JobId,
    /// Canonical identifier within the job (stable URL or post+index).
    pub item_key: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Destination path once known.
    pub file_path: Option<String>,
    /// Expected size when known.
    pub bytes_total: Option<i64>,
    /// Bytes written so far.
    pub bytes_done: i64,
    /// Last modification time.
    pub updated_at: String,
}

impl ItemRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        self.status_str.parse().unwrap_or(ItemStatus::Pending)
    }
}
