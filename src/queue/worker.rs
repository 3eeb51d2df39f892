//! Worker pool: claims jobs, drives adapters, settles terminal states.
//!
//! Each worker runs one job end to end. The adapter executes in its own
//! task so a panic is caught at the worker boundary (the worker must not
//! die); cancellation and pause give the adapter a bounded grace period
//! before the task is aborted and logged as a bug.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::{CANCEL_GRACE, Engine, JobReporter, RunningJob, lock_unpoisoned};
use crate::adapter::{AdapterError, DownloadContext, DownloadResult};
use crate::download::{BandwidthLimiter, CancelToken};
use crate::events::{EventKind, LogLevel};
use crate::history::{JobId, JobRecord, JobStatus};
use crate::options::DownloadOptions;
use crate::storage::FsAdapter;

/// How one adapter run ended.
enum AdapterFinish {
    /// The adapter returned.
    Returned(Result<DownloadResult, AdapterError>),
    /// The adapter task panicked.
    Panicked(String),
    /// The adapter ignored cancellation past the grace budget and its task
    /// was aborted. That is an adapter bug; the job settles regardless.
    Wedged,
}

/// Main loop for one worker.
pub(super) async fn worker_loop(engine: Arc<Engine>, worker_id: usize) {
    debug!(worker_id, "worker started");

    loop {
        if engine.shutdown.is_cancelled() {
            break;
        }

        match engine.history.claim_next_pending().await {
            Ok(Some(job)) => {
                run_job(&engine, job).await;
            }
            Ok(None) => {
                // Idle: park until new work arrives or shutdown.
                tokio::select! {
                    () = engine.work_available.notified() => {}
                    () = engine.shutdown.cancelled() => break,
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "failed to claim work; backing off");
                if engine.shutdown.sleep(std::time::Duration::from_secs(1)).await {
                    break;
                }
            }
        }
    }

    debug!(worker_id, "worker stopped");
}

/// Runs one claimed job to a settled state.
#[instrument(skip_all, fields(job_id = job.job_id, url = %job.url))]
async fn run_job(engine: &Arc<Engine>, job: JobRecord) {
    let job_id = job.job_id;

    let options = load_options(engine, &job);
    let resolution = engine.factory.resolve(&job.url);

    // Per-job tokens register before anything else so cancel/pause
    // commands land on the tokens rather than racing the transition. The
    // adapter sees a child that fires on either; which one fired decides
    // the transition.
    let cancel = CancelToken::new();
    let pause = CancelToken::new();
    let adapter_token = CancelToken::child_of(&[&cancel, &pause]);
    lock_unpoisoned(&engine.running).insert(
        job_id,
        RunningJob {
            cancel: cancel.clone(),
            pause: pause.clone(),
        },
    );

    // A cancel that slipped in between the claim and the registration
    // above has already finished the job; nothing to run.
    match engine.history.get_job(job_id).await {
        Ok(Some(current)) if current.status() == JobStatus::Running => {}
        _ => {
            debug!(job_id, "job no longer running after claim; skipping");
            lock_unpoisoned(&engine.running).remove(&job_id);
            return;
        }
    }

    // JOB_STARTED with the final engine classification, before any adapter
    // call.
    let engine_label = resolution.tag.label();
    if let Err(e) = engine
        .history
        .mark_started(job_id, &engine_label, &job.url)
        .await
    {
        error!(error = %e, "failed to mark job started");
        let _ = engine.history.pause_job(job_id).await;
        lock_unpoisoned(&engine.running).remove(&job_id);
        return;
    }
    engine.publish(
        job_id,
        EventKind::JobStarted {
            url: job.url.clone(),
            engine: engine_label,
        },
    );

    // A URL nothing can resolve fails immediately with an explanation.
    if !resolution.adapter.can_handle(&job.url) {
        let message = format!("no resolver accepts this URL: {}", job.url);
        engine.publish(job_id, EventKind::Log {
            message: message.clone(),
            level: LogLevel::Error,
        });
        settle_failed(engine, job_id, &message).await;
        lock_unpoisoned(&engine.running).remove(&job_id);
        return;
    }
    if resolution.fallback {
        engine.publish(job_id, EventKind::Log {
            message: format!(
                "no site adapter or engine matched {}; using the generic scraper",
                job.url
            ),
            level: LogLevel::Warning,
        });
    }

    let bandwidth = if options.bandwidth_limit_kbps > 0 {
        Arc::new(BandwidthLimiter::from_kbps(options.bandwidth_limit_kbps))
    } else {
        Arc::clone(&engine.global_bandwidth)
    };
    let ctx = DownloadContext {
        job_id,
        url: job.url.clone(),
        options,
        cancel: adapter_token,
        reporter: JobReporter::new(job_id, engine.history.clone(), engine.bus.clone()),
        fs: FsAdapter::new(&job.output_folder),
        limiter: Arc::clone(&engine.limiter),
        bandwidth,
    };

    let adapter = Arc::clone(&resolution.adapter);
    let mut handle = tokio::spawn(async move { adapter.download(&ctx).await });

    let finish = tokio::select! {
        joined = &mut handle => from_join(joined),
        () = cancel.cancelled() => await_with_grace(&mut handle).await,
        () = pause.cancelled() => await_with_grace(&mut handle).await,
    };

    lock_unpoisoned(&engine.running).remove(&job_id);

    if cancel.is_cancelled() {
        sweep_part_files(engine, job_id).await;
        settle_cancelled(engine, job_id).await;
        return;
    }
    if pause.is_cancelled() {
        // In-flight items were resolved to CANCELLED by the adapter; their
        // partials are already gone, but sweep defensively.
        sweep_part_files(engine, job_id).await;
        match engine.history.pause_job(job_id).await {
            Ok(()) => {
                info!(job_id, "job paused");
                engine.publish(job_id, EventKind::Log {
                    message: "job paused; it will resume from the queue".to_string(),
                    level: LogLevel::Info,
                });
            }
            Err(e) => error!(job_id, error = %e, "failed to pause job"),
        }
        return;
    }

    match finish {
        AdapterFinish::Returned(Ok(result)) => {
            settle_result(engine, job_id, result).await;
        }
        AdapterFinish::Returned(Err(AdapterError::Fatal(message))) => {
            engine.publish(job_id, EventKind::Log {
                message: message.clone(),
                level: LogLevel::Error,
            });
            settle_failed(engine, job_id, &message).await;
        }
        AdapterFinish::Panicked(message) => {
            let message = format!("adapter crashed: {message}");
            error!(job_id, %message, "adapter panicked");
            engine.publish(job_id, EventKind::Log {
                message: message.clone(),
                level: LogLevel::Error,
            });
            settle_failed(engine, job_id, &message).await;
        }
        AdapterFinish::Wedged => {
            // Only reachable from the cancel/pause arms, both handled
            // above; a wedge without either token is a scheduler bug.
            error!(job_id, "adapter finished wedged without cancellation");
            settle_failed(engine, job_id, "adapter stopped responding").await;
        }
    }
}

/// Maps a clean adapter return onto the terminal transition, preferring
/// persisted counters over the adapter's self-report.
async fn settle_result(engine: &Arc<Engine>, job_id: JobId, result: DownloadResult) {
    let persisted = engine.history.get_job(job_id).await.ok().flatten();
    let counters = persisted.as_ref().map(JobRecord::counters).unwrap_or_default();

    if counters.failed != result.failed_files.len() as i64 {
        warn!(
            job_id,
            persisted = counters.failed,
            reported = result.failed_files.len(),
            "adapter result disagrees with persisted counters"
        );
    }

    if counters.failed > 0 || !result.success {
        let message = result
            .error_message
            .unwrap_or_else(|| format!("{} of {} items failed", counters.failed, counters.total));
        settle_failed(engine, job_id, &message).await;
    } else {
        match engine
            .history
            .finish_job(job_id, JobStatus::Completed, None)
            .await
        {
            Ok(record) => {
                info!(job_id, "job completed");
                engine.publish(job_id, EventKind::JobDone {
                    status: JobStatus::Completed,
                    counters: record.counters(),
                });
            }
            Err(e) => error!(job_id, error = %e, "failed to finish job"),
        }
    }
}

/// Terminal FAILED transition: persists `JOB_ERROR` then `JOB_DONE` and
/// publishes both.
async fn settle_failed(engine: &Arc<Engine>, job_id: JobId, message: &str) {
    if let Err(e) = engine.history.append_job_error(job_id, message).await {
        warn!(job_id, error = %e, "failed to persist job error event");
    }
    engine.publish(job_id, EventKind::JobError {
        error: message.to_string(),
    });

    match engine
        .history
        .finish_job(job_id, JobStatus::Failed, Some(message))
        .await
    {
        Ok(record) => {
            engine.publish(job_id, EventKind::JobDone {
                status: JobStatus::Failed,
                counters: record.counters(),
            });
        }
        Err(e) => error!(job_id, error = %e, "failed to mark job failed"),
    }
}

/// Terminal CANCELLED transition plus its bus events.
async fn settle_cancelled(engine: &Arc<Engine>, job_id: JobId) {
    match engine
        .history
        .finish_job(job_id, JobStatus::Cancelled, None)
        .await
    {
        Ok(record) => {
            info!(job_id, "job cancelled");
            engine.publish(job_id, EventKind::JobCancelled);
            engine.publish(job_id, EventKind::JobDone {
                status: JobStatus::Cancelled,
                counters: record.counters(),
            });
        }
        Err(e) => error!(job_id, error = %e, "failed to mark job cancelled"),
    }
}

/// Waits out the cancellation grace period, then aborts a wedged adapter.
async fn await_with_grace(
    handle: &mut tokio::task::JoinHandle<Result<DownloadResult, AdapterError>>,
) -> AdapterFinish {
    match tokio::time::timeout(CANCEL_GRACE, &mut *handle).await {
        Ok(joined) => from_join(joined),
        Err(_) => {
            error!("adapter ignored cancellation for {CANCEL_GRACE:?}; aborting its task");
            handle.abort();
            AdapterFinish::Wedged
        }
    }
}

fn from_join(
    joined: Result<Result<DownloadResult, AdapterError>, tokio::task::JoinError>,
) -> AdapterFinish {
    match joined {
        Ok(result) => AdapterFinish::Returned(result),
        Err(join_error) if join_error.is_panic() => {
            AdapterFinish::Panicked(panic_summary(&join_error))
        }
        Err(_) => AdapterFinish::Wedged,
    }
}

/// A short, stack-free summary of a panic payload.
fn panic_summary(join_error: &tokio::task::JoinError) -> String {
    let text = join_error.to_string();
    text.lines().next().unwrap_or("unknown panic").to_string()
}

/// Loads the job's options snapshot, falling back to defaults when the
/// stored blob is unreadable.
fn load_options(engine: &Arc<Engine>, job: &JobRecord) -> DownloadOptions {
    let parsed: Result<serde_json::Value, _> = serde_json::from_str(&job.options_blob);
    match parsed {
        Ok(value) => match DownloadOptions::from_stored_json(&value) {
            Ok((options, notes)) => {
                for note in notes {
                    engine.publish(job.job_id, EventKind::Log {
                        message: format!("option adjusted: {note}"),
                        level: LogLevel::Warning,
                    });
                }
                options
            }
            Err(e) => {
                warn!(job_id = job.job_id, error = %e, "stored options unreadable; using defaults");
                DownloadOptions::default()
            }
        },
        Err(e) => {
            warn!(job_id = job.job_id, error = %e, "stored options unreadable; using defaults");
            DownloadOptions::default()
        }
    }
}

/// Deletes any `.part` stragglers belonging to a job's incomplete items.
/// Adapters clean their own partials on cancellation; this is the queue
/// manager's verification pass.
pub(super) async fn sweep_part_files(engine: &Arc<Engine>, job_id: JobId) {
    let paths = match engine.history.incomplete_item_paths(job_id).await {
        Ok(paths) => paths,
        Err(e) => {
            warn!(job_id, error = %e, "could not list incomplete items for sweep");
            return;
        }
    };

    for path in paths {
        let part = FsAdapter::part_path(Path::new(&path));
        match tokio::fs::remove_file(&part).await {
            Ok(()) => info!(job_id, path = %part.display(), "removed straggler partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id, path = %part.display(), error = %e, "failed to remove partial file"),
        }
    }
}
