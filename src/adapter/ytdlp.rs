//! Universal video engine wrapper (yt-dlp as a child process).
//!
//! Resolution tier 3: URLs on hosts the extractor is known to cover are
//! delegated to `yt-dlp`, with its line-based progress translated into the
//! engine's `ITEM_PROGRESS` contract. The whole URL is treated as one item
//! keyed by the URL itself; yt-dlp manages its own output filenames inside
//! the job's rendered destination directory.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use url::Url;

use super::process::{LineSource, ProcessError, run_engine};
use super::{AdapterError, DownloadContext, Downloader, DownloadResult};
use crate::download::{ProgressThrottler, extract_host};
use crate::storage::TemplateVars;

/// The engine binary.
const PROGRAM: &str = "yt-dlp";

/// Line prefix produced by our `--progress-template`.
const PROGRESS_PREFIX: &str = "spool.progress ";

/// Hosts the extractor is known to cover. Kept syntactic so resolution
/// stays pure; anything else falls through to the generic tier.
const KNOWN_HOSTS: [&str; 14] = [
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "twitch.tv",
    "twitter.com",
    "x.com",
    "tiktok.com",
    "dailymotion.com",
    "soundcloud.com",
    "streamable.com",
    "rumble.com",
    "bitchute.com",
    "odysee.com",
    "bilibili.com",
];

/// yt-dlp wrapper adapter.
#[derive(Debug, Default)]
pub struct YtDlpAdapter;

impl YtDlpAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Downloader for YtDlpAdapter {
    fn site_name(&self) -> &'static str {
        "ytdlp"
    }

    fn can_handle(&self, url: &str) -> bool {
        host_matches(url, &KNOWN_HOSTS)
    }

    #[instrument(skip_all, fields(job_id = ctx.job_id, url = %ctx.url))]
    async fn download(&self, ctx: &DownloadContext) -> Result<DownloadResult, AdapterError> {
        let item_key = ctx.url.clone();
        let reporter = &ctx.reporter;

        if reporter
            .is_already_completed(&item_key)
            .await
            .map_err(|e| AdapterError::fatal(format!("history unavailable: {e}")))?
        {
            debug!("media already completed in an earlier run");
            return Ok(DownloadResult {
                total_files: 1,
                completed_files: 1,
                ..DownloadResult::default()
            }
            .settled(false));
        }

        let dest_dir = destination_dir(ctx)?;
        let args = build_args(&ctx.url, &ctx.options, &dest_dir);

        reporter
            .set_total(1)
            .await
            .map_err(|e| AdapterError::fatal(format!("history unavailable: {e}")))?;
        reporter
            .item_start(&item_key, &ctx.url, None)
            .await
            .map_err(|e| AdapterError::fatal(format!("history unavailable: {e}")))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = ctx.cancel.clone();
        let runner = tokio::spawn(async move {
            run_engine(PROGRAM, &args, &cancel, move |source, line| {
                let _ = tx.send((source, line.to_string()));
            })
            .await
        });

        let mut throttler = ProgressThrottler::new();
        let mut bytes_done: u64 = 0;
        let mut bytes_total: Option<u64> = None;
        let mut destination: Option<String> = None;
        let mut stderr_tail: Vec<String> = Vec::new();

        while let Some((source, line)) = rx.recv().await {
            match source {
                LineSource::Stdout => {
                    if let Some(progress) = line.strip_prefix(PROGRESS_PREFIX) {
                        if let Some((done, total)) = parse_progress(progress) {
                            bytes_done = done;
                            bytes_total = total.or(bytes_total);
                            if let Some(frame) = throttler.update(done, bytes_total) {
                                reporter.item_progress(&item_key, frame);
                            }
                        }
                    } else if let Some(path) = line.strip_prefix("[download] Destination: ") {
                        destination = Some(path.trim().to_string());
                    } else if let Some(path) = parse_merge_line(&line) {
                        destination = Some(path);
                    }
                }
                LineSource::Stderr => {
                    debug!(line = %line, "yt-dlp stderr");
                    if stderr_tail.len() == 5 {
                        stderr_tail.remove(0);
                    }
                    stderr_tail.push(line);
                }
            }
        }

        let run_result = match runner.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(error = %join_error, "engine runner task panicked");
                Err(ProcessError::Failed {
                    program: PROGRAM.to_string(),
                    code: None,
                })
            }
        };

        settle(ctx, &item_key, run_result, bytes_done, destination, &stderr_tail).await
    }
}

/// Maps the process outcome onto the item and result contracts.
async fn settle(
    ctx: &DownloadContext,
    item_key: &str,
    run_result: Result<(), ProcessError>,
    bytes_done: u64,
    destination: Option<String>,
    stderr_tail: &[String],
) -> Result<DownloadResult, AdapterError> {
    let reporter = &ctx.reporter;
    let fatal = |e: crate::history::HistoryError| {
        AdapterError::fatal(format!("history unavailable: {e}"))
    };

    match run_result {
        Ok(()) => {
            let file_path = destination
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|| ctx.fs.root().to_path_buf());
            let bytes = match tokio::fs::metadata(&file_path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => bytes_done,
            };
            reporter
                .item_done(item_key, &file_path, bytes)
                .await
                .map_err(fatal)?;
            Ok(DownloadResult {
                total_files: 1,
                completed_files: 1,
                ..DownloadResult::default()
            }
            .settled(false))
        }
        Err(ProcessError::Cancelled { .. }) => {
            reporter.item_cancelled(item_key).await.map_err(fatal)?;
            Ok(DownloadResult {
                total_files: 1,
                ..DownloadResult::default()
            }
            .settled(true))
        }
        Err(e @ ProcessError::Spawn { .. }) => {
            let message = format!("{e}; install yt-dlp to download from this site");
            reporter.item_fail(item_key, &message).await.map_err(fatal)?;
            Err(AdapterError::fatal(message))
        }
        Err(e) => {
            let mut message = e.to_string();
            if !stderr_tail.is_empty() {
                message = format!("{message}: {}", stderr_tail.join(" | "));
            }
            reporter.item_fail(item_key, &message).await.map_err(fatal)?;
            Ok(DownloadResult {
                total_files: 1,
                failed_files: vec![item_key.to_string()],
                error_message: Some(message),
                ..DownloadResult::default()
            }
            .settled(false))
        }
    }
}

/// Renders the job's destination directory for the engine's output option.
fn destination_dir(ctx: &DownloadContext) -> Result<String, AdapterError> {
    let vars = TemplateVars {
        site: extract_host(&ctx.url),
        ..TemplateVars::default()
    };
    let dir = ctx
        .fs
        .render_template(&ctx.options.folder_template, &vars)
        .map_err(|e| AdapterError::fatal(e.to_string()))?;
    Ok(dir.display().to_string())
}

/// Builds the yt-dlp argument list from the job's URL and options.
fn build_args(url: &str, options: &crate::options::DownloadOptions, dest_dir: &str) -> Vec<String> {
    let mut args = vec![
        url.to_string(),
        "--newline".to_string(),
        "--continue".to_string(),
        "--no-overwrites".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_PREFIX}%(progress.downloaded_bytes)s %(progress.total_bytes)s"
        ),
        "--output".to_string(),
        format!("{dest_dir}/%(title)s [%(id)s].%(ext)s"),
    ];

    if let Some(from) = options.date_from {
        args.push("--dateafter".to_string());
        args.push(from.format("%Y%m%d").to_string());
    }
    if let Some(to) = options.date_to {
        args.push("--datebefore".to_string());
        args.push(to.format("%Y%m%d").to_string());
    }
    if options.bandwidth_limit_kbps > 0 {
        args.push("--limit-rate".to_string());
        args.push(format!("{}K", options.bandwidth_limit_kbps));
    }
    if !options.proxy_url.is_empty() {
        args.push("--proxy".to_string());
        args.push(options.proxy_url.clone());
    }

    // The opaque engine_specific record maps straight onto CLI flags.
    if let Some(format) = options.engine_specific.get("format").and_then(|v| v.as_str()) {
        args.push("--format".to_string());
        args.push(format.to_string());
    }
    if let Some(extra) = options
        .engine_specific
        .get("extra_args")
        .and_then(|v| v.as_array())
    {
        args.extend(extra.iter().filter_map(|v| v.as_str().map(str::to_string)));
    }

    args
}

/// Parses a rendered progress template line: `<downloaded> <total>`.
/// Either field may be `NA` or a float.
fn parse_progress(line: &str) -> Option<(u64, Option<u64>)> {
    let mut parts = line.split_whitespace();
    let done = parse_bytes(parts.next()?)?;
    let total = parts.next().and_then(parse_bytes);
    Some((done, total))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_bytes(field: &str) -> Option<u64> {
    field.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64)
}

/// Extracts the output path from a `[Merger] Merging formats into "..."` line.
fn parse_merge_line(line: &str) -> Option<String> {
    let rest = line.strip_prefix("[Merger] Merging formats into \"")?;
    rest.strip_suffix('"').map(str::to_string)
}

/// True when the URL's host is (a subdomain of) one of `hosts`.
pub(super) fn host_matches(url: &str, hosts: &[&str]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    hosts
        .iter()
        .any(|known| host == *known || host.ends_with(&format!(".{known}")))
}
