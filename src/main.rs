//! CLI entry point for the spool tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use spool_core::{
    DownloaderFactory, EngineConfig, EventBus, EventKind, HistoryStore, JobPriority, JobStatus,
    QueueManager, Reorder, StateDb,
};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Argument errors and --help should print before any log machinery
    // comes up.
    let args = Args::parse();

    // RUST_LOG wins when set; otherwise -q/-v pick the floor.
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    if let Command::Run { workers, bandwidth } = args.command {
        return run_until_drained(&args, workers.into(), bandwidth).await;
    }

    let manager = open_engine(&args).await?;

    match args.command {
        Command::Add {
            ref urls,
            ref output,
            ref priority,
            ref options,
        } => {
            let options: serde_json::Value =
                serde_json::from_str(options).context("the --options value must be JSON")?;
            let priority = match priority.as_str() {
                "high" => JobPriority::High,
                "low" => JobPriority::Low,
                _ => JobPriority::Normal,
            };
            for url in urls {
                let job_id = manager
                    .enqueue_with(url, &options, priority, Some(output.clone()))
                    .await?;
                println!("queued job {job_id}: {url}");
            }
        }

        // Handled above: Run owns its engine so it can size the pool.
        Command::Run { .. } => unreachable!(),

        Command::List { ref status } => {
            let filter = status.as_deref().and_then(|s| s.parse::<JobStatus>().ok());
            let jobs = manager.list_jobs(filter).await?;
            for job in &jobs {
                let counters = job.counters();
                println!(
                    "{:>5}  {:<9}  {:>3}/{:<3}  {}",
                    job.job_id,
                    job.status().to_string(),
                    counters.settled(),
                    counters.total,
                    job.url
                );
            }
            println!("{} job(s)", jobs.len());
        }

        Command::Cancel { job_id } => {
            manager.cancel(job_id).await?;
            println!("cancelled job {job_id}");
        }

        Command::Pause { job_id } => {
            manager.pause(job_id).await?;
            println!("paused job {job_id}");
        }

        Command::Resume { job_id } => {
            manager.resume(job_id).await?;
            println!("resumed job {job_id}");
        }

        Command::Remove { job_id } => {
            manager.remove(job_id).await?;
            println!("removed job {job_id}");
        }

        Command::Reorder { job_id, delta } => {
            manager.reorder(job_id, Reorder::By(delta)).await?;
            println!("moved job {job_id} by {delta}");
        }

        Command::ClearCompleted => {
            let purged = manager.clear_completed().await?;
            println!("removed {purged} completed job(s)");
        }

        Command::Events { job_id, since } => {
            for event in manager.recent_events(job_id, since).await? {
                println!("{:>6}  {}  {}", event.id, event.timestamp, event.payload_blob);
            }
        }
    }

    Ok(())
}

/// Opens the engine over the state directory without starting workers.
async fn open_engine(args: &Args) -> Result<QueueManager> {
    let db = StateDb::open(&args.state_dir).await?;
    let history = HistoryStore::new(db);
    let bus = EventBus::default();
    Ok(QueueManager::new(
        history,
        bus,
        DownloaderFactory::new(),
        EngineConfig::default(),
    ))
}

/// Runs the worker pool with a live progress line until the queue drains.
async fn run_until_drained(args: &Args, workers: usize, bandwidth_kbps: u64) -> Result<()> {
    let db = StateDb::open(&args.state_dir).await?;
    let history = HistoryStore::new(db);
    let bus = EventBus::default();
    let manager = QueueManager::new(
        history,
        bus,
        DownloaderFactory::new(),
        EngineConfig {
            workers,
            bandwidth_limit_kbps: bandwidth_kbps,
            ..EngineConfig::default()
        },
    );

    let recovered = manager.recover_on_startup().await?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "re-queued jobs from a previous crash");
    }

    let (ui_handle, stop) = spawn_progress_ui(!args.quiet, manager.subscribe());

    manager.start();
    manager.wait_idle().await?;
    manager.shutdown().await;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = ui_handle {
        let _ = handle.await;
    }

    print_summary(&manager).await
}

/// Spawns the event-fed spinner when requested. The flag tells the task to
/// wind down; the handle lets the caller wait for the final redraw.
fn spawn_progress_ui(
    use_spinner: bool,
    mut events: spool_core::EventStream,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);

    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(100));

        while !stop_signal.load(Ordering::SeqCst) {
            let event = tokio::time::timeout(std::time::Duration::from_millis(200), events.recv())
                .await;
            let Ok(event) = event else { continue };
            let Some(event) = event else { break };

            match &event.kind {
                EventKind::JobStarted { url, .. } => {
                    spinner.set_message(format!("job {}: {}", event.job_id, url));
                }
                EventKind::ItemProgress {
                    item_key,
                    bytes_done,
                    bytes_total,
                    ..
                } => {
                    let total = bytes_total
                        .map_or_else(|| "?".to_string(), |t| t.to_string());
                    spinner.set_message(format!(
                        "job {}: {} ({bytes_done}/{total} bytes)",
                        event.job_id,
                        short_name(item_key)
                    ));
                }
                EventKind::JobDone { status, .. } => {
                    spinner.println(format!("job {} finished: {status}", event.job_id));
                }
                _ => {}
            }
        }

        spinner.finish_and_clear();
    });

    (Some(handle), stop)
}

/// Final per-status counts for the run.
async fn print_summary(manager: &QueueManager) -> Result<()> {
    let jobs = manager.list_jobs(None).await?;
    let done = jobs
        .iter()
        .filter(|j| j.status() == JobStatus::Completed)
        .count();
    let failed = jobs
        .iter()
        .filter(|j| j.status() == JobStatus::Failed)
        .count();
    let cancelled = jobs
        .iter()
        .filter(|j| j.status() == JobStatus::Cancelled)
        .count();
    println!("done: {done} completed, {failed} failed, {cancelled} cancelled");
    Ok(())
}

/// Trims an item key down to something spinner-sized.
fn short_name(item_key: &str) -> &str {
    item_key.rsplit('/').next().unwrap_or(item_key)
}
