//! The shared per-item transfer pipeline.
//!
//! Native and generic adapters enumerate [`MediaItem`]s and hand them to
//! [`download_enumerated`], which runs each through the same machinery:
//! resume check, pre-transfer filters, destination planning, the domain
//! limiter, the retry loop around the streaming client, and the atomic
//! commit - reporting every step through the job's reporter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::NaiveDate;
use tracing::{debug, info, instrument, warn};

use super::{AdapterError, DownloadContext, DownloadResult};
use crate::download::{
    DownloadError, FailureKind, HttpClient, ItemCandidate, ItemFilter, ProgressThrottler,
    RetryDecision, RetryPolicy, classify_error, extract_host, parse_retry_after,
};
use crate::events::LogLevel;
use crate::storage::TemplateVars;

/// How many 429 answers a job tolerates before the host gets a cooldown.
const RATE_LIMIT_STRIKE_BUDGET: u32 = 2;

/// One enumerated media item, ready for transfer.
#[derive(Debug, Clone)]
pub struct MediaItem {
    /// Canonical identifier within the job (stable URL or post+index).
    pub key: String,
    /// Direct URL of the media file.
    pub url: String,
    /// Original filename (naming-mode input).
    pub filename: String,
    /// Size in bytes when enumeration supplied it.
    pub size: Option<u64>,
    /// Post publication date when the source exposes it.
    pub published: Option<NaiveDate>,
    /// Folder-template values for this item.
    pub vars: TemplateVars,
}

/// Terminal fate of one item inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemFate {
    /// Transferred and committed.
    Completed,
    /// Completed in a previous run; skipped without recounting.
    AlreadyDone,
    /// Filtered out (counted as skipped).
    Skipped,
    /// Failed permanently (job continues).
    Failed,
    /// Aborted by cancellation (job stops).
    Cancelled,
}

/// Job-wide 429 accounting: past the strike budget, the host's spacing
/// interval is doubled once for the remainder of the job.
#[derive(Debug, Default)]
struct RateWatch {
    strikes: AtomicU32,
    cooled: AtomicBool,
}

impl RateWatch {
    fn strike(&self) -> u32 {
        self.strikes.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn mark_cooled(&self) -> bool {
        !self.cooled.swap(true, Ordering::SeqCst)
    }
}

/// Runs every enumerated item through the shared pipeline and settles the
/// job-level result.
///
/// Stops at the first cancellation (remaining items stay PENDING) and
/// propagates only job-fatal trouble (disk errors, history failures) as
/// [`AdapterError`] - after recording the current item's failure.
///
/// # Errors
///
/// Returns [`AdapterError`] when the job cannot continue.
#[instrument(skip_all, fields(job_id = ctx.job_id, items = items.len()))]
pub async fn download_enumerated(
    ctx: &DownloadContext,
    client: &HttpClient,
    items: Vec<MediaItem>,
) -> Result<DownloadResult, AdapterError> {
    ctx.reporter
        .set_total(items.len())
        .await
        .map_err(|e| AdapterError::fatal(format!("history unavailable: {e}")))?;

    let filter = ItemFilter::from_options(&ctx.options);
    let policy = RetryPolicy::from_options(&ctx.options);
    let watch = RateWatch::default();

    let mut result = DownloadResult {
        total_files: items.len(),
        ..DownloadResult::default()
    };
    let mut cancelled = false;

    for (index, item) in items.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let fate = match transfer_item(ctx, client, &filter, &policy, &watch, item, index + 1).await
        {
            Ok(fate) => fate,
            Err(fatal) => {
                // The job is going down; settle the untouched tail so the
                // terminal counters still account for every item.
                for remaining in &items[index + 1..] {
                    let _ = ctx
                        .reporter
                        .item_skip(&remaining.key, "not attempted: job aborted")
                        .await;
                }
                return Err(fatal);
            }
        };
        match fate {
            ItemFate::Completed | ItemFate::AlreadyDone => result.completed_files += 1,
            ItemFate::Skipped => {
                result.completed_files += 1;
                result.skipped_files.push(item.key.clone());
            }
            ItemFate::Failed => result.failed_files.push(item.key.clone()),
            ItemFate::Cancelled => {
                cancelled = true;
                break;
            }
        }
    }

    if !result.failed_files.is_empty() {
        result.error_message = Some(format!(
            "{} of {} items failed",
            result.failed_files.len(),
            result.total_files
        ));
    }

    Ok(result.settled(cancelled))
}

/// Runs one item: resume check, filters, planning, limiter, retry loop,
/// commit.
#[instrument(skip_all, fields(item_key = %item.key))]
async fn transfer_item(
    ctx: &DownloadContext,
    client: &HttpClient,
    filter: &ItemFilter,
    policy: &RetryPolicy,
    watch: &RateWatch,
    item: &MediaItem,
    sequence: usize,
) -> Result<ItemFate, AdapterError> {
    let reporter = &ctx.reporter;

    // Idempotent resume: items completed by a previous run are not
    // transferred and not recounted.
    if history_fatal(reporter.is_already_completed(&item.key).await)? {
        debug!("item already completed in an earlier run");
        return Ok(ItemFate::AlreadyDone);
    }

    // Everything known pre-transfer gets filtered before any network work.
    let candidate = ItemCandidate {
        name: if item.filename.is_empty() {
            &item.url
        } else {
            &item.filename
        },
        size: item.size,
        published: item.published,
    };
    if let Some(reason) = filter.evaluate(&candidate) {
        history_fatal(reporter.item_skip(&item.key, &reason.to_string()).await)?;
        return Ok(ItemFate::Skipped);
    }

    // Destination planning (template, naming mode, collision suffix).
    let path = match ctx
        .fs
        .plan_item(
            &ctx.options.folder_template,
            &item.vars,
            &item.url,
            &item.filename,
            ctx.options.file_naming_mode,
            sequence,
        )
        .await
    {
        Ok(path) => path,
        Err(e) if e.is_disk_full() => {
            let message = e.to_string();
            history_fatal(reporter.item_fail(&item.key, &message).await)?;
            return Err(AdapterError::fatal(message));
        }
        Err(e) => {
            history_fatal(reporter.item_fail(&item.key, &e.to_string()).await)?;
            return Ok(ItemFate::Failed);
        }
    };

    let host = extract_host(&item.url);

    // HEAD probe fills in the size when a size filter needs it.
    let mut bytes_total = item.size;
    if bytes_total.is_none() && (ctx.options.min_size_bytes > 0 || ctx.options.max_size_bytes > 0)
    {
        match ctx.limiter.acquire(&host, &ctx.cancel).await {
            Ok(_permit) => match client.probe(&item.url).await {
                Ok(probe) => {
                    if let Some(size) = probe.content_length {
                        bytes_total = Some(size);
                        if let Some(reason) = filter.check_size(size) {
                            history_fatal(
                                reporter.item_skip(&item.key, &reason.to_string()).await,
                            )?;
                            return Ok(ItemFate::Skipped);
                        }
                    }
                }
                Err(e) => debug!(error = %e, "size probe failed; the GET will decide"),
            },
            Err(_) => return Ok(ItemFate::Cancelled),
        }
    }

    history_fatal(reporter.item_start(&item.key, &item.url, bytes_total).await)?;

    let mut attempt: u32 = 1;
    loop {
        let permit = match ctx.limiter.acquire(&host, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(_) => {
                ctx.fs.discard_part(&path).await;
                history_fatal(reporter.item_cancelled(&item.key).await)?;
                return Ok(ItemFate::Cancelled);
            }
        };

        let mut throttler = ProgressThrottler::new();
        let fetched = client
            .fetch_to_part(
                &item.url,
                &path,
                &ctx.fs,
                true,
                &ctx.cancel,
                &ctx.bandwidth,
                |done, total| {
                    if let Some(frame) = throttler.update(done, total) {
                        reporter.item_progress(&item.key, frame);
                    }
                },
            )
            .await;
        drop(permit);

        let error = match fetched {
            Ok(outcome) => {
                history_fatal(
                    reporter
                        .persist_progress(&item.key, outcome.bytes_on_disk, outcome.content_length)
                        .await,
                )?;
                match ctx.fs.commit(&path, outcome.content_length).await {
                    Ok(bytes) => {
                        reporter.item_progress(&item.key, throttler.finalize(bytes, Some(bytes)));
                        history_fatal(reporter.item_done(&item.key, &path, bytes).await)?;
                        info!(path = %path.display(), bytes, "item completed");
                        return Ok(ItemFate::Completed);
                    }
                    Err(e) if e.is_disk_full() => {
                        let message = e.to_string();
                        history_fatal(reporter.item_fail(&item.key, &message).await)?;
                        return Err(AdapterError::fatal(message));
                    }
                    Err(crate::storage::StorageError::SizeMismatch {
                        path: part,
                        expected,
                        actual,
                    }) => DownloadError::integrity(part, expected, actual),
                    Err(e) => {
                        let message = e.to_string();
                        history_fatal(reporter.item_fail(&item.key, &message).await)?;
                        return Err(AdapterError::fatal(message));
                    }
                }
            }
            Err(e) => e,
        };

        if error.is_cancelled() {
            ctx.fs.discard_part(&path).await;
            history_fatal(reporter.item_cancelled(&item.key).await)?;
            return Ok(ItemFate::Cancelled);
        }
        if error.is_fatal_to_job() {
            let message = error.to_string();
            history_fatal(reporter.item_fail(&item.key, &message).await)?;
            return Err(AdapterError::fatal(message));
        }

        let kind = classify_error(&error);

        // Excessive 429s double the host's spacing for the rest of the job.
        if kind == FailureKind::RateLimited
            && watch.strike() >= RATE_LIMIT_STRIKE_BUDGET
            && watch.mark_cooled()
        {
            let interval = ctx.limiter.cooldown(&host);
            reporter.log(
                LogLevel::Warning,
                format!(
                    "{host} keeps rate limiting; spacing requests {} ms apart for the rest of this job",
                    interval.as_millis()
                ),
            );
        }

        let retry_after = match &error {
            DownloadError::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value).map(|d| policy.cap_retry_after(d)),
            _ => None,
        };

        match policy.decide(kind, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                let delay = retry_after.unwrap_or(delay);
                info!(
                    attempt = next_attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    error = %error,
                    "retrying item"
                );
                if ctx.cancel.sleep(delay).await {
                    ctx.fs.discard_part(&path).await;
                    history_fatal(reporter.item_cancelled(&item.key).await)?;
                    return Ok(ItemFate::Cancelled);
                }
                attempt = next_attempt;
            }
            RetryDecision::GiveUp { reason } => {
                let message = format!("{error} ({reason})");
                warn!(%message, "item failed");
                history_fatal(reporter.item_fail(&item.key, &message).await)?;
                return Ok(ItemFate::Failed);
            }
        }
    }
}

/// History failures are engine-fatal: the job cannot keep its contract
/// without durable state.
fn history_fatal<T>(result: Result<T, crate::history::HistoryError>) -> Result<T, AdapterError> {
    result.map_err(|e| AdapterError::fatal(format!("history unavailable: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::db::StateDb;
    use crate::download::{BandwidthLimiter, CancelToken, DomainLimiter, HostPolicy};
    use crate::events::EventBus;
    use crate::history::{HistoryStore, JobPriority, JobRecord};
    use crate::options::DownloadOptions;
    use crate::queue::JobReporter;
    use crate::storage::FsAdapter;

    struct Fixture {
        ctx: DownloadContext,
        client: HttpClient,
        history: HistoryStore,
        job: JobRecord,
        _temp: tempfile::TempDir,
    }

    async fn fixture(mut options: DownloadOptions) -> Fixture {
        // Fast retries and no politeness gaps in tests.
        options.retry_base_delay_s = 0;
        options.retry_max_delay_s = 0;

        let temp = tempfile::tempdir().unwrap();
        let db = StateDb::in_memory().await.unwrap();
        let history = HistoryStore::new(db);
        let bus = EventBus::new(256);
        let job = history
            .insert_job(
                "https://example.site/user/alice",
                "generic",
                JobPriority::Normal,
                temp.path().to_str().unwrap(),
                &options,
            )
            .await
            .unwrap();

        let ctx = DownloadContext {
            job_id: job.job_id,
            url: job.url.clone(),
            options: options.clone(),
            cancel: CancelToken::new(),
            reporter: JobReporter::new(job.job_id, history.clone(), bus),
            fs: FsAdapter::new(temp.path()),
            limiter: Arc::new(DomainLimiter::new(HostPolicy {
                max_concurrent: 2,
                min_interval: std::time::Duration::ZERO,
            })),
            bandwidth: Arc::new(BandwidthLimiter::unlimited()),
        };
        let client = HttpClient::from_options(&options).unwrap();

        Fixture {
            ctx,
            client,
            history,
            job,
            _temp: temp,
        }
    }

    fn item(key: &str, url: String) -> MediaItem {
        MediaItem {
            key: key.to_string(),
            url,
            filename: key.to_string(),
            size: None,
            published: None,
            vars: TemplateVars::default(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1_u8; 100]))
            .mount(&server)
            .await;

        let f = fixture(DownloadOptions::default()).await;
        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("a.jpg", format!("{}/a.jpg", server.uri()))],
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.completed_files, 1);

        let job = f.history.get_job(f.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.completed_items, 1);
        assert!(f.ctx.fs.root().join("a.jpg").exists());
    }

    #[tokio::test]
    async fn test_pipeline_retries_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/b.mp4"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/b.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2_u8; 64]))
            .mount(&server)
            .await;

        let f = fixture(DownloadOptions::default()).await;
        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("b.mp4", format!("{}/b.mp4", server.uri()))],
        )
        .await
        .unwrap();

        assert!(result.success, "expected success after retry: {result:?}");
        assert!(result.failed_files.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_exhausts_retries_and_fails_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut options = DownloadOptions::default();
        options.max_retries = 2;
        let f = fixture(options).await;

        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("b.mp4", format!("{}/b.mp4", server.uri()))],
        )
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_files, vec!["b.mp4".to_string()]);
        assert!(result.error_message.is_some());

        let job = f.history.get_job(f.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.failed_items, 1);
    }

    #[tokio::test]
    async fn test_pipeline_404_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(DownloadOptions::default()).await;
        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("gone.jpg", format!("{}/gone.jpg", server.uri()))],
        )
        .await
        .unwrap();

        assert_eq!(result.failed_files.len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_filters_skip_before_network() {
        // No mock server mounted: a network attempt would error loudly.
        let mut options = DownloadOptions::default();
        options.include_archives = false;
        let f = fixture(options).await;

        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("bundle.zip", "http://127.0.0.1:9/bundle.zip".to_string())],
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.skipped_files, vec!["bundle.zip".to_string()]);
        assert_eq!(result.completed_files, 1);

        let job = f.history.get_job(f.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.skipped_items, 1);
    }

    #[tokio::test]
    async fn test_pipeline_head_probe_prunes_oversized() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(url_path("/big.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "12000000"))
            .mount(&server)
            .await;

        let mut options = DownloadOptions::default();
        options.max_size_bytes = 10_000_000;
        let f = fixture(options).await;

        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("big.bin", format!("{}/big.bin", server.uri()))],
        )
        .await
        .unwrap();

        assert_eq!(result.skipped_files, vec!["big.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_pipeline_resume_skips_previously_completed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![3_u8; 10]))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(DownloadOptions::default()).await;
        // Simulate a previous run that completed the item.
        f.ctx
            .reporter
            .item_done("a.jpg", std::path::Path::new("/tmp/out/a.jpg"), 10)
            .await
            .unwrap();

        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("a.jpg", format!("{}/a.jpg", server.uri()))],
        )
        .await
        .unwrap();

        // Counted as completed locally, but no new transfer and no recount.
        assert_eq!(result.completed_files, 1);
        let job = f.history.get_job(f.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.completed_items, 1);

        let events = f.history.recent_events(f.job.job_id, None).await.unwrap();
        let starts = events.iter().filter(|e| e.type_str == "ITEM_START").count();
        assert_eq!(starts, 0, "no duplicate ITEM_START for resumed item");
    }

    #[tokio::test]
    async fn test_pipeline_cancel_before_item_leaves_it_pending() {
        let f = fixture(DownloadOptions::default()).await;
        f.ctx.cancel.cancel();

        let result = download_enumerated(
            &f.ctx,
            &f.client,
            vec![item("a.jpg", "http://127.0.0.1:9/a.jpg".to_string())],
        )
        .await
        .unwrap();

        assert!(!result.success);
        assert_eq!(result.completed_files, 0);

        // The item never started, so no row was written for it.
        let items = f.history.items_for_job(f.job.job_id).await.unwrap();
        assert!(items.is_empty());
    }
}
