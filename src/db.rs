//! SQLite storage underneath the history store.
//!
//! The whole durable surface of the engine lives in one database file per
//! state directory, `<state_dir>/downloads.db`: job rows, item rows, and
//! the append-only event log. [`StateDb::open`] owns that layout - it
//! creates the directory, opens (or creates) the file, applies the
//! connection pragmas, and brings the schema up to date.
//!
//! Concurrency model, matching how the queue uses it: WAL journaling so
//! worker reads proceed while a transition commits, a busy timeout so
//! writers queue up instead of failing with SQLITE_BUSY, and foreign keys
//! enforced because item and event rows must always point at a live job.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Name of the history database inside a state directory.
pub const HISTORY_DB_FILE: &str = "downloads.db";

/// Pool size. SQLite serializes writers at file granularity, so this only
/// needs to cover the worker pool's concurrent readers.
const POOL_CONNECTIONS: u32 = 5;

/// How long a connection queues behind a busy writer before giving up.
const BUSY_WAIT_MS: u32 = 5000;

/// Errors opening or migrating the state database.
#[derive(Error, Debug)]
pub enum DbError {
    /// The database file could not be opened or configured.
    #[error("cannot open history database at {path}: {source}")]
    Open {
        /// Where the file was expected.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: sqlx::Error,
    },

    /// The state directory could not be created.
    #[error("cannot create state directory {path}: {source}")]
    StateDir {
        /// The directory that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Bringing the schema up to date failed.
    #[error("history schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the engine's state database.
///
/// Cloning shares the pool; the history store is the only module that
/// issues queries through it.
#[derive(Debug, Clone)]
pub struct StateDb {
    pool: SqlitePool,
}

impl StateDb {
    /// Opens the history database for a state directory, creating the
    /// directory and the file on first use and migrating the schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::StateDir`] when the directory cannot be created,
    /// [`DbError::Open`] when the file cannot be opened or configured, and
    /// [`DbError::Migrate`] when the schema cannot be brought up to date.
    #[instrument(skip(state_dir), fields(state_dir = %state_dir.display()))]
    pub async fn open(state_dir: &Path) -> Result<Self, DbError> {
        tokio::fs::create_dir_all(state_dir)
            .await
            .map_err(|source| DbError::StateDir {
                path: state_dir.to_path_buf(),
                source,
            })?;

        let db_path = state_dir.join(HISTORY_DB_FILE);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_CONNECTIONS)
            .connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .await
            .map_err(|source| open_error(&db_path, source))?;

        for pragma in [
            "PRAGMA journal_mode=WAL",
            "PRAGMA synchronous=NORMAL",
            &format!("PRAGMA busy_timeout={BUSY_WAIT_MS}"),
            "PRAGMA foreign_keys=ON",
        ] {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(|source| open_error(&db_path, source))?;
        }

        sqlx::migrate!("./migrations").run(&pool).await?;

        debug!(path = %db_path.display(), "history database ready");
        Ok(Self { pool })
    }

    /// Opens a throwaway in-memory database with the full schema applied.
    ///
    /// Lives only as long as its single connection; meant for unit tests.
    /// WAL is pointless without a file, so only foreign keys are switched
    /// on.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] or [`DbError::Migrate`] as above.
    #[instrument]
    pub async fn in_memory() -> Result<Self, DbError> {
        let memory = Path::new(":memory:");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|source| open_error(memory, source))?;

        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&pool)
            .await
            .map_err(|source| open_error(memory, source))?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying connection pool, for the history store's queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drains and closes every connection. Call on shutdown; the handle is
    /// dead afterwards.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn open_error(path: &Path, source: sqlx::Error) -> DbError {
    DbError::Open {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_directory_and_file() {
        let temp = tempfile::tempdir().unwrap();
        let state_dir = temp.path().join("nested").join("state");

        let db = StateDb::open(&state_dir).await.unwrap();
        assert!(state_dir.join(HISTORY_DB_FILE).exists());
        db.close().await;
    }

    #[tokio::test]
    async fn test_open_is_reusable_across_sessions() {
        let temp = tempfile::tempdir().unwrap();

        let first = StateDb::open(temp.path()).await.unwrap();
        sqlx::query("INSERT INTO jobs (url, output_folder) VALUES ('https://example.site/u/a', '/tmp/out')")
            .execute(first.pool())
            .await
            .unwrap();
        first.close().await;

        let second = StateDb::open(temp.path()).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(second.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 1, "rows written in session one must survive");
    }

    #[tokio::test]
    async fn test_schema_has_all_three_tables() {
        let db = StateDb::in_memory().await.unwrap();

        sqlx::query("INSERT INTO jobs (url, output_folder) VALUES ('https://example.site/u/a', '/tmp/out')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO items (job_id, item_key) VALUES (1, 'post1/0')")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO events (job_id, timestamp, type) VALUES (1, '2026-01-01T00:00:00Z', 'JOB_ADDED')",
        )
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_status_vocabulary_is_enforced() {
        let db = StateDb::in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO jobs (url, output_folder, status) VALUES ('https://example.site', '/tmp', 'bogus')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_err(), "unknown status strings must be rejected");
    }

    #[tokio::test]
    async fn test_orphan_events_are_rejected() {
        let db = StateDb::in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO events (job_id, timestamp, type) VALUES (999, '2026-01-01T00:00:00Z', 'JOB_ADDED')",
        )
        .execute(db.pool())
        .await;

        assert!(
            result.is_err(),
            "an event without a job must trip the foreign key"
        );
    }
}
