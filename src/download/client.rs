//! HTTP client wrapper for streaming item transfers.
//!
//! One [`HttpClient`] is built per job from its options (proxy, UA,
//! timeouts) and reused across that job's items for connection pooling.
//! Transfers stream to the `.part` staging file with a cancellation check
//! and a bandwidth-token acquisition per chunk; committing the staged file
//! into place is the caller's job, after the size check.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, Proxy, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::bandwidth::BandwidthLimiter;
use super::cancel::CancelToken;
use super::error::DownloadError;
use crate::options::DownloadOptions;
use crate::storage::FsAdapter;

/// User-Agent sent when the options don't override it.
pub const DEFAULT_USER_AGENT: &str = concat!("spool/", env!("CARGO_PKG_VERSION"));

/// What a HEAD probe learned about a URL.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// Content-Length, when the server reports one.
    pub content_length: Option<u64>,
    /// Whether the server advertises ranged GET support.
    pub accepts_ranges: bool,
    /// Filename from Content-Disposition, when present.
    pub filename: Option<String>,
}

/// Result of one streaming transfer into a `.part` file.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Bytes now present in the staging file (resumed + written).
    pub bytes_on_disk: u64,
    /// Expected total size, when the server reported one.
    pub content_length: Option<u64>,
    /// Whether a ranged resume was actually used (server answered 206).
    pub resumed: bool,
}

/// HTTP client configured from one job's options.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client from job options: timeouts, optional proxy, UA.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for an unparseable proxy URL,
    /// or [`DownloadError::Network`] if the client cannot be constructed.
    #[instrument(skip(options))]
    pub fn from_options(options: &DownloadOptions) -> Result<Self, DownloadError> {
        let user_agent = if options.user_agent.is_empty() {
            DEFAULT_USER_AGENT
        } else {
            options.user_agent.as_str()
        };

        let mut builder = ClientBuilder::new()
            .user_agent(user_agent)
            .connect_timeout(std::time::Duration::from_secs(options.connection_timeout_s))
            .read_timeout(std::time::Duration::from_secs(options.read_timeout_s))
            .gzip(true);

        if !options.proxy_url.is_empty() {
            let proxy = Proxy::all(&options.proxy_url)
                .map_err(|_| DownloadError::invalid_url(options.proxy_url.clone()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| DownloadError::network("building HTTP client", e))?;
        Ok(Self { client })
    }

    /// HEAD-probes a URL for size, range support, and a suggested filename.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for error responses and the
    /// usual network/timeout errors.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, DownloadError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| map_send_error(url, e))?;

        if !response.status().is_success() {
            return Err(status_error(url, &response));
        }

        let content_length = header_u64(&response, CONTENT_LENGTH.as_str());
        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);

        Ok(ProbeResult {
            content_length,
            accepts_ranges,
            filename,
        })
    }

    /// Fetches a page body as text (generic adapter's HTML source).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for error responses and the
    /// usual network/timeout errors.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(url, e))?;

        if !response.status().is_success() {
            return Err(status_error(url, &response));
        }

        response.text().await.map_err(|e| map_send_error(url, e))
    }

    /// Streams `url` into the `.part` file for `dest`.
    ///
    /// When `try_resume` is set and a leftover `.part` exists, the request
    /// carries a `Range` header; a 206 answer appends to the leftover,
    /// anything else restarts from zero. Each chunk checks cancellation
    /// (deleting the partial on abort, per the adapter contract) and blocks
    /// on the shared bandwidth bucket. `on_chunk` observes cumulative
    /// bytes on disk plus the expected total.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] on cancellation (partial
    /// removed), [`DownloadError::DiskFull`]/[`DownloadError::Io`] for
    /// write failures, and the usual network/status errors.
    #[instrument(skip_all, fields(url = %url, dest = %dest.display()))]
    pub async fn fetch_to_part(
        &self,
        url: &str,
        dest: &Path,
        fs: &FsAdapter,
        try_resume: bool,
        cancel: &CancelToken,
        bandwidth: &BandwidthLimiter,
        mut on_chunk: impl FnMut(u64, Option<u64>),
    ) -> Result<FetchOutcome, DownloadError> {
        let existing = if try_resume {
            FsAdapter::part_size(dest).await.unwrap_or(0)
        } else {
            0
        };

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        // Header wait races the token so cancellation is not stuck behind
        // a slow server.
        let response = tokio::select! {
            response = request.send() => response.map_err(|e| map_send_error(url, e))?,
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url)),
        };
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, &response));
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !resumed {
            debug!("server ignored range request; restarting transfer");
        }

        let remaining_length = header_u64(&response, CONTENT_LENGTH.as_str());
        let content_length = if resumed {
            remaining_length.map(|n| n + existing)
        } else {
            remaining_length
        };

        let part = fs
            .open_part(dest, resumed)
            .await
            .map_err(|e| storage_to_download(dest, e))?;
        let mut file = tokio::io::BufWriter::new(part.file);
        let mut bytes_on_disk = part.existing_bytes;

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                () = cancel.cancelled() => {
                    drop(file);
                    fs.discard_part(dest).await;
                    return Err(DownloadError::cancelled(url));
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| map_send_error(url, e))?;

            if bandwidth
                .throttle(chunk.len() as u64, cancel)
                .await
                .is_err()
            {
                drop(file);
                fs.discard_part(dest).await;
                return Err(DownloadError::cancelled(url));
            }

            if let Err(e) = file.write_all(&chunk).await {
                let _ = file.flush().await;
                return Err(DownloadError::io(FsAdapter::part_path(dest), e));
            }
            bytes_on_disk += chunk.len() as u64;
            on_chunk(bytes_on_disk, content_length);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(FsAdapter::part_path(dest), e))?;

        debug!(bytes = bytes_on_disk, resumed, "transfer streamed to part file");
        Ok(FetchOutcome {
            bytes_on_disk,
            content_length,
            resumed,
        })
    }
}

/// Maps a reqwest send/body error onto the download error taxonomy.
fn map_send_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// Builds an `HttpStatus` error, capturing Retry-After when present.
fn status_error(url: &str, response: &reqwest::Response) -> DownloadError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if retry_after.is_some() {
        warn!(url, status = %response.status(), "server sent Retry-After");
    }
    DownloadError::http_status_with_retry_after(url, response.status().as_u16(), retry_after)
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn storage_to_download(dest: &Path, error: crate::storage::StorageError) -> DownloadError {
    if error.is_disk_full() {
        return DownloadError::DiskFull {
            path: FsAdapter::part_path(dest),
        };
    }
    DownloadError::io(
        FsAdapter::part_path(dest),
        std::io::Error::other(error.to_string()),
    )
}

/// Pulls the suggested filename out of a Content-Disposition header.
///
/// The RFC 5987 `filename*=` form wins when present; otherwise the plain
/// `filename=` parameter is accepted quoted or bare.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    encoded_filename_param(header).or_else(|| plain_filename_param(header))
}

/// `filename*=charset''percent-encoded` per RFC 5987.
fn encoded_filename_param(header: &str) -> Option<String> {
    let value = header[header.find("filename*=")? + "filename*=".len()..].trim();
    let encoded_start = value.find("''")? + 2;
    let encoded = value[encoded_start..]
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    urlencoding::decode(encoded).ok().map(|name| name.into_owned())
}

/// The plain `filename=` parameter, quoted or bare.
fn plain_filename_param(header: &str) -> Option<String> {
    let value = header[header.find("filename=")? + "filename=".len()..].trim();

    if let Some(quoted) = value.strip_prefix('"') {
        let end = quoted.find('"')?;
        return Some(quoted[..end].to_string());
    }

    let bare = value.split(';').next().unwrap_or(value).trim();
    (!bare.is_empty()).then(|| bare.to_string())
}
