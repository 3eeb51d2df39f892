//! Multi-gallery engine wrapper (gallery-dl as a child process).
//!
//! Resolution tier 2: URLs on hosts the gallery extractor covers are
//! delegated to `gallery-dl`. The engine prints one line per file it
//! writes (prefixed with `# ` when the file already existed), which maps
//! naturally onto item events: each printed path becomes an item keyed by
//! its filename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::process::{LineSource, ProcessError, run_engine};
use super::ytdlp::host_matches;
use super::{AdapterError, DownloadContext, Downloader, DownloadResult};
use crate::download::extract_host;
use crate::storage::TemplateVars;

/// The engine binary.
const PROGRAM: &str = "gallery-dl";

/// Hosts the gallery extractor is known to cover. Kept syntactic so
/// resolution stays pure.
const KNOWN_HOSTS: [&str; 12] = [
    "imgur.com",
    "flickr.com",
    "deviantart.com",
    "artstation.com",
    "pixiv.net",
    "danbooru.donmai.us",
    "gelbooru.com",
    "e621.net",
    "rule34.xxx",
    "fanbox.cc",
    "patreon.com",
    "redgifs.com",
];

/// gallery-dl wrapper adapter.
#[derive(Debug, Default)]
pub struct GalleryDlAdapter;

impl GalleryDlAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Downloader for GalleryDlAdapter {
    fn site_name(&self) -> &'static str {
        "gallery"
    }

    fn can_handle(&self, url: &str) -> bool {
        host_matches(url, &KNOWN_HOSTS)
    }

    #[instrument(skip_all, fields(job_id = ctx.job_id, url = %ctx.url))]
    async fn download(&self, ctx: &DownloadContext) -> Result<DownloadResult, AdapterError> {
        let reporter = &ctx.reporter;
        let fatal =
            |e: crate::history::HistoryError| AdapterError::fatal(format!("history unavailable: {e}"));

        let dest_dir = destination_dir(ctx)?;
        let mut args = vec![
            "--dest".to_string(),
            dest_dir.clone(),
            ctx.url.clone(),
        ];
        if !ctx.options.proxy_url.is_empty() {
            args.push("--proxy".to_string());
            args.push(ctx.options.proxy_url.clone());
        }
        if let Some(extra) = ctx
            .options
            .engine_specific
            .get("extra_args")
            .and_then(|v| v.as_array())
        {
            args.extend(extra.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = ctx.cancel.clone();
        let runner = tokio::spawn(async move {
            run_engine(PROGRAM, &args, &cancel, move |source, line| {
                let _ = tx.send((source, line.to_string()));
            })
            .await
        });

        let mut result = DownloadResult::default();
        let mut stderr_tail: Vec<String> = Vec::new();

        while let Some((source, line)) = rx.recv().await {
            match source {
                LineSource::Stdout => {
                    let Some(written) = parse_file_line(&line, &dest_dir) else {
                        debug!(line = %line, "unrecognized gallery-dl output line");
                        continue;
                    };

                    result.total_files += 1;
                    let key = item_key_for(&written.path);

                    if written.already_present
                        || reporter.is_already_completed(&key).await.map_err(fatal)?
                    {
                        // Files gallery-dl left in place are not re-counted
                        // as new transfers.
                        result.completed_files += 1;
                        continue;
                    }

                    let bytes = tokio::fs::metadata(&written.path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    reporter
                        .item_start(&key, &ctx.url, Some(bytes))
                        .await
                        .map_err(fatal)?;
                    reporter
                        .item_done(&key, &written.path, bytes)
                        .await
                        .map_err(fatal)?;
                    result.completed_files += 1;
                }
                LineSource::Stderr => {
                    debug!(line = %line, "gallery-dl stderr");
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

        // The item total is only known once the engine has finished.
        reporter.set_total(result.total_files).await.map_err(fatal)?;

        match run_result {
            Ok(()) => Ok(result.settled(false)),
            Err(ProcessError::Cancelled { .. }) => Ok(result.settled(true)),
            Err(e @ ProcessError::Spawn { .. }) => Err(AdapterError::fatal(format!(
                "{e}; install gallery-dl to download from this site"
            ))),
            Err(e) => {
                let mut message = e.to_string();
                if !stderr_tail.is_empty() {
                    message = format!("{message}: {}", stderr_tail.join(" | "));
                }
                result.error_message = Some(message);
                // The engine died mid-gallery; everything it did not list
                // counts as failed wholesale.
                result.failed_files.push(ctx.url.clone());
                Ok(result.settled(false))
            }
        }
    }
}

/// One file line from gallery-dl's stdout.
struct WrittenFile {
    path: PathBuf,
    already_present: bool,
}

/// Parses a gallery-dl output line into a written-file record.
///
/// Lines are either a path (fresh download) or `# path` (file already
/// existed). Anything that does not resolve under the destination
/// directory is ignored.
fn parse_file_line(line: &str, dest_dir: &str) -> Option<WrittenFile> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (candidate, already_present) = match trimmed.strip_prefix("# ") {
        Some(rest) => (rest.trim(), true),
        None => (trimmed, false),
    };

    let path = if Path::new(candidate).is_absolute() {
        PathBuf::from(candidate)
    } else {
        Path::new(dest_dir).join(candidate)
    };

    // Engine banners and warnings aren't paths into the destination.
    if !path.starts_with(dest_dir) {
        return None;
    }
    path.extension()?;

    Some(WrittenFile {
        path,
        already_present,
    })
}

/// Item key: the file's name, stable across reruns of the same gallery.
fn item_key_for(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Renders the job's destination directory for the engine's `--dest`.
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
