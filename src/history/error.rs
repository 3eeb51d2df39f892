//! Error types for the history store.

use thiserror::Error;

use super::job::JobId;

/// Errors produced by history store operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Underlying database failure.
    #[error("history database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No job exists with the given identifier.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The requested transition is not permitted from the job's current state.
    #[error("job {job_id} is {current}; {operation} is not permitted")]
    InvalidState {
        /// The job in question.
        job_id: JobId,
        /// Its current status string.
        current: String,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// An event payload failed to serialize.
    #[error("event serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
