//! Integration tests for the history store against a file-backed SQLite
//! database, including reopen-the-file scenarios a unit test can't cover.

use tempfile::TempDir;

use spool_core::history::ItemOutcome;
use spool_core::{
    DownloadOptions, HistoryStore, ItemStatus, JobPriority, JobStatus, StateDb,
};

async fn file_store() -> (HistoryStore, TempDir) {
    let temp = TempDir::new().expect("temp dir");
    let db = StateDb::open(temp.path()).await.expect("open db");
    (HistoryStore::new(db), temp)
}

// ==================== Durability across reopen ====================

#[tokio::test]
async fn test_jobs_survive_database_reopen() {
    let temp = TempDir::new().unwrap();

    let job_id = {
        let db = StateDb::open(temp.path()).await.unwrap();
        let store = HistoryStore::new(db.clone());
        let job = store
            .insert_job(
                "https://example.site/user/alice",
                "generic",
                JobPriority::High,
                "/tmp/out",
                &DownloadOptions::default(),
            )
            .await
            .unwrap();
        db.close().await;
        job.job_id
    };

    let db = StateDb::open(temp.path()).await.unwrap();
    let store = HistoryStore::new(db);
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.priority(), JobPriority::High);
    assert_eq!(job.url, "https://example.site/user/alice");
}

#[tokio::test]
async fn test_options_blob_roundtrips_through_reopen() {
    let temp = TempDir::new().unwrap();

    let mut options = DownloadOptions::default();
    options.include_videos = false;
    options.max_size_bytes = 5_000_000;
    options.folder_template = "{site}/{user}".to_string();

    let job_id = {
        let db = StateDb::open(temp.path()).await.unwrap();
        let store = HistoryStore::new(db.clone());
        let job = store
            .insert_job(
                "https://example.site/u/a",
                "generic",
                JobPriority::Normal,
                "/tmp/out",
                &options,
            )
            .await
            .unwrap();
        db.close().await;
        job.job_id
    };

    let db = StateDb::open(temp.path()).await.unwrap();
    let store = HistoryStore::new(db);
    let job = store.get_job(job_id).await.unwrap().unwrap();

    let raw: serde_json::Value = serde_json::from_str(&job.options_blob).unwrap();
    let (loaded, notes) = DownloadOptions::from_stored_json(&raw).unwrap();
    assert!(notes.is_empty());
    assert_eq!(loaded, options);
}

#[tokio::test]
async fn test_crash_recovery_round_trip_across_reopen() {
    let temp = TempDir::new().unwrap();

    // Session one: claim and partially process a job, then "crash".
    let job_id = {
        let db = StateDb::open(temp.path()).await.unwrap();
        let store = HistoryStore::new(db.clone());
        let job = store
            .insert_job(
                "https://example.site/u/a",
                "generic",
                JobPriority::Normal,
                "/tmp/out",
                &DownloadOptions::default(),
            )
            .await
            .unwrap();
        store.claim_next_pending().await.unwrap().unwrap();
        store.set_total_items(job.job_id, 2).await.unwrap();
        store
            .finish_item(
                job.job_id,
                "a.jpg",
                &ItemOutcome::Done {
                    file_path: "/tmp/out/a.jpg".to_string(),
                    bytes_total: 10,
                },
            )
            .await
            .unwrap();
        store
            .record_item_start(job.job_id, "b.mp4", "https://cdn.example.site/b.mp4", None)
            .await
            .unwrap();
        db.close().await;
        job.job_id
    };

    // Session two: recovery resets the job and its in-flight item.
    let db = StateDb::open(temp.path()).await.unwrap();
    let store = HistoryStore::new(db);
    let recovered = store.recover_running_jobs().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].job_id, job_id);
    assert_eq!(recovered[0].status(), JobStatus::Pending);
    assert_eq!(recovered[0].completed_items, 1);

    assert!(store.is_item_completed(job_id, "a.jpg").await.unwrap());
    let items = store.items_for_job(job_id).await.unwrap();
    let b = items.iter().find(|i| i.item_key == "b.mp4").unwrap();
    assert_eq!(b.status(), ItemStatus::Pending);
}

// ==================== Invariants at rest ====================

#[tokio::test]
async fn test_terminal_jobs_carry_both_timestamps() {
    let (store, _temp) = file_store().await;

    // Completed after running.
    let completed = store
        .insert_job(
            "https://example.site/1",
            "generic",
            JobPriority::Normal,
            "/tmp/out",
            &DownloadOptions::default(),
        )
        .await
        .unwrap();
    store.claim_next_pending().await.unwrap().unwrap();
    store
        .finish_job(completed.job_id, JobStatus::Completed, None)
        .await
        .unwrap();

    // Cancelled straight from pending.
    let cancelled = store
        .insert_job(
            "https://example.site/2",
            "generic",
            JobPriority::Normal,
            "/tmp/out",
            &DownloadOptions::default(),
        )
        .await
        .unwrap();
    store
        .finish_job(cancelled.job_id, JobStatus::Cancelled, None)
        .await
        .unwrap();

    for job in store.list_jobs(None).await.unwrap() {
        if job.status().is_terminal() {
            assert!(job.started_at.is_some(), "job {}", job.job_id);
            assert!(job.finished_at.is_some(), "job {}", job.job_id);
        } else {
            assert!(job.finished_at.is_none(), "job {}", job.job_id);
        }
    }
}

#[tokio::test]
async fn test_failed_requires_error_message_and_counters_settle() {
    let (store, _temp) = file_store().await;

    let job = store
        .insert_job(
            "https://example.site/u/a",
            "generic",
            JobPriority::Normal,
            "/tmp/out",
            &DownloadOptions::default(),
        )
        .await
        .unwrap();
    store.claim_next_pending().await.unwrap().unwrap();
    store.set_total_items(job.job_id, 2).await.unwrap();
    store
        .finish_item(
            job.job_id,
            "a.jpg",
            &ItemOutcome::Done {
                file_path: "/tmp/out/a.jpg".to_string(),
                bytes_total: 10,
            },
        )
        .await
        .unwrap();
    store
        .finish_item(
            job.job_id,
            "b.mp4",
            &ItemOutcome::Fail {
                error: "HTTP 404 downloading b.mp4".to_string(),
            },
        )
        .await
        .unwrap();

    let finished = store
        .finish_job(job.job_id, JobStatus::Failed, Some("1 of 2 items failed"))
        .await
        .unwrap();

    assert!(finished.error_message.is_some());
    let counters = finished.counters();
    assert_eq!(counters.settled(), counters.total);
}

#[tokio::test]
async fn test_event_stream_order_matches_id_order() {
    let (store, _temp) = file_store().await;

    let job = store
        .insert_job(
            "https://example.site/u/a",
            "generic",
            JobPriority::Normal,
            "/tmp/out",
            &DownloadOptions::default(),
        )
        .await
        .unwrap();
    store.claim_next_pending().await.unwrap().unwrap();
    store
        .mark_started(job.job_id, "generic", &job.url)
        .await
        .unwrap();
    store.set_total_items(job.job_id, 1).await.unwrap();
    store
        .record_item_start(job.job_id, "a.jpg", "https://cdn.example.site/a.jpg", Some(10))
        .await
        .unwrap();
    store
        .finish_item(
            job.job_id,
            "a.jpg",
            &ItemOutcome::Done {
                file_path: "/tmp/out/a.jpg".to_string(),
                bytes_total: 10,
            },
        )
        .await
        .unwrap();
    store
        .finish_job(job.job_id, JobStatus::Completed, None)
        .await
        .unwrap();

    let events = store.recent_events(job.job_id, None).await.unwrap();
    let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted, "stream order must match id order");

    let types: Vec<&str> = events.iter().map(|e| e.type_str.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "JOB_ADDED",
            "JOB_STARTED",
            "ITEM_START",
            "ITEM_DONE",
            "JOB_PROGRESS",
            "JOB_DONE",
        ]
    );

    // Every persisted payload deserializes into a typed event.
    assert!(events.iter().all(|e| e.kind().is_some()));
}

#[tokio::test]
async fn test_job_progress_counters_monotonic() {
    let (store, _temp) = file_store().await;

    let job = store
        .insert_job(
            "https://example.site/u/a",
            "generic",
            JobPriority::Normal,
            "/tmp/out",
            &DownloadOptions::default(),
        )
        .await
        .unwrap();
    store.set_total_items(job.job_id, 3).await.unwrap();

    for (key, outcome) in [
        (
            "a.jpg",
            ItemOutcome::Done {
                file_path: "/tmp/out/a.jpg".to_string(),
                bytes_total: 10,
            },
        ),
        (
            "b.mp4",
            ItemOutcome::Fail {
                error: "HTTP 404".to_string(),
            },
        ),
        (
            "c.zip",
            ItemOutcome::Skip {
                reason: "archives excluded".to_string(),
            },
        ),
    ] {
        store.finish_item(job.job_id, key, &outcome).await.unwrap();
    }

    let events = store.recent_events(job.job_id, None).await.unwrap();
    let mut last_settled = -1;
    for event in events {
        if let Some(spool_core::EventKind::JobProgress { counters }) = event.kind() {
            let settled = counters.settled();
            assert!(settled > last_settled, "counters must be monotonic");
            last_settled = settled;
        }
    }
    assert_eq!(last_settled, 3);
}

#[tokio::test]
async fn test_remove_cascades_items_and_events() {
    let (store, _temp) = file_store().await;

    let job = store
        .insert_job(
            "https://example.site/u/a",
            "generic",
            JobPriority::Normal,
            "/tmp/out",
            &DownloadOptions::default(),
        )
        .await
        .unwrap();
    store
        .finish_item(
            job.job_id,
            "a.jpg",
            &ItemOutcome::Done {
                file_path: "/tmp/out/a.jpg".to_string(),
                bytes_total: 10,
            },
        )
        .await
        .unwrap();
    store
        .finish_job(job.job_id, JobStatus::Completed, None)
        .await
        .unwrap();

    store.remove_job(job.job_id).await.unwrap();

    assert!(store.get_job(job.job_id).await.unwrap().is_none());
    assert!(store.items_for_job(job.job_id).await.unwrap().is_empty());
    assert!(store.recent_events(job.job_id, None).await.unwrap().is_empty());
}
