//! Command-line surface of the spool binary: one subcommand per engine
//! command, parsed with clap's derive API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use spool_core::DEFAULT_WORKERS;

/// Universal media download engine.
///
/// Spool enumerates the media behind each URL you give it, downloads the
/// items concurrently under politeness constraints, and records everything
/// durably so a crash or restart picks up where it left off.
#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(author, version, about)]
pub struct Args {
    /// More logging; stack it (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding the history database
    #[arg(long, default_value = ".spool", global = true)]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Engine commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue one or more URLs
    Add {
        /// URLs to enqueue
        #[arg(required = true)]
        urls: Vec<String>,

        /// Output folder for these jobs
        #[arg(short, long, default_value = "downloads")]
        output: PathBuf,

        /// Queue priority
        #[arg(long, value_parser = ["high", "normal", "low"], default_value = "normal")]
        priority: String,

        /// Options as a JSON object (keys per the options schema)
        #[arg(long, default_value = "{}")]
        options: String,
    },

    /// Run the worker pool until the queue drains
    Run {
        /// Worker pool size (1-16)
        #[arg(short = 'w', long, default_value_t = DEFAULT_WORKERS as u8, value_parser = clap::value_parser!(u8).range(1..=16))]
        workers: u8,

        /// Aggregate bandwidth cap in KiB/s (0 = unlimited)
        #[arg(short = 'b', long, default_value_t = 0)]
        bandwidth: u64,
    },

    /// List jobs
    List {
        /// Only show jobs with this status
        #[arg(long, value_parser = ["pending", "running", "completed", "failed", "cancelled"])]
        status: Option<String>,
    },

    /// Cancel a job
    Cancel {
        /// The job to cancel
        job_id: i64,
    },

    /// Pause a running job (it returns to the queue)
    Pause {
        /// The job to pause
        job_id: i64,
    },

    /// Resume a paused job
    Resume {
        /// The job to resume
        job_id: i64,
    },

    /// Remove a pending or finished job from history
    Remove {
        /// The job to remove
        job_id: i64,
    },

    /// Move a pending job within its priority band
    Reorder {
        /// The job to move
        job_id: i64,

        /// Signed offset (negative = earlier)
        delta: i64,
    },

    /// Remove all completed jobs from history
    ClearCompleted,

    /// Show the persisted event stream for a job
    Events {
        /// The job whose events to show
        job_id: i64,

        /// Only events after this id
        #[arg(long)]
        since: Option<i64>,
    },
}
