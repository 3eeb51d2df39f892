//! Last-resort generic HTML adapter.
//!
//! Fetches the page behind the URL, harvests direct media links from
//! `src`/`href`/`data-src` attributes, and runs them through the shared
//! item pipeline. This is resolution tier 4: it accepts any http(s) URL,
//! so an unresolvable page fails the job with a clear message rather than
//! leaving it stuck.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, instrument};
use url::Url;

use super::transfer::{MediaItem, download_enumerated};
use super::{AdapterError, DownloadContext, Downloader, DownloadResult};
use crate::download::{FileKind, HttpClient, extract_host, filters};
use crate::events::LogLevel;
use crate::storage::TemplateVars;

/// Attribute pattern the harvester scans for.
const LINK_ATTRIBUTE_PATTERN: &str = r#"(?i)(?:src|href|data-src)\s*=\s*["']([^"'\s]+)["']"#;

/// Fallback HTML media scraper.
#[derive(Debug, Default)]
pub struct GenericAdapter;

impl GenericAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Downloader for GenericAdapter {
    fn site_name(&self) -> &'static str {
        "generic"
    }

    fn can_handle(&self, url: &str) -> bool {
        Url::parse(url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    #[instrument(skip_all, fields(job_id = ctx.job_id, url = %ctx.url))]
    async fn download(&self, ctx: &DownloadContext) -> Result<DownloadResult, AdapterError> {
        let client = HttpClient::from_options(&ctx.options)
            .map_err(|e| AdapterError::fatal(e.to_string()))?;

        let page_url = Url::parse(&ctx.url)
            .map_err(|_| AdapterError::fatal(format!("no resolver for URL: {}", ctx.url)))?;

        // The page fetch itself respects the host's politeness budget.
        let host = extract_host(&ctx.url);
        let html = {
            let _permit = ctx
                .limiter
                .acquire(&host, &ctx.cancel)
                .await
                .map_err(|_| AdapterError::fatal("cancelled before page fetch".to_string()))?;
            client
                .fetch_text(&ctx.url)
                .await
                .map_err(|e| AdapterError::fatal(format!("failed to fetch page: {e}")))?
        };

        let items = harvest_media_items(&page_url, &html);
        info!(count = items.len(), "harvested media links");

        if items.is_empty() {
            ctx.reporter.log(
                LogLevel::Warning,
                format!("no direct media links found at {}", ctx.url),
            );
            ctx.reporter
                .set_total(0)
                .await
                .map_err(|e| AdapterError::fatal(format!("history unavailable: {e}")))?;
            return Ok(DownloadResult::default().settled(ctx.cancel.is_cancelled()));
        }

        download_enumerated(ctx, &client, items).await
    }
}

/// Extracts media links from page HTML, absolutized and deduplicated in
/// document order.
fn harvest_media_items(page_url: &Url, html: &str) -> Vec<MediaItem> {
    // The pattern is a compile-time constant; a failure here is a bug.
    let Ok(pattern) = Regex::new(LINK_ATTRIBUTE_PATTERN) else {
        return Vec::new();
    };

    let site = page_url.host_str().unwrap_or("unknown").to_string();
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for capture in pattern.captures_iter(html) {
        let Some(raw) = capture.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let Ok(absolute) = page_url.join(raw) else {
            debug!(link = raw, "discarding unjoinable link");
            continue;
        };
        if !matches!(absolute.scheme(), "http" | "https") {
            continue;
        }

        let Some(extension) = filters::extension_of(absolute.as_str()) else {
            continue;
        };
        if filters::classify_extension(&extension) == FileKind::Other {
            continue;
        }

        let url_text = absolute.to_string();
        if !seen.insert(url_text.clone()) {
            continue;
        }

        let filename = filename_from_url(&absolute);
        items.push(MediaItem {
            key: url_text.clone(),
            url: url_text,
            filename,
            size: None,
            published: None,
            vars: TemplateVars {
                site: site.clone(),
                ..TemplateVars::default()
            },
        });
    }

    items
}

/// Derives a filename from the URL's last path segment, percent-decoded.
fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .unwrap_or_else(|| "download.bin".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://example.site/gallery/alice").unwrap()
    }

    // ==================== can_handle ====================

    #[test]
    fn test_can_handle_http_only() {
        let adapter = GenericAdapter::new();
        assert!(adapter.can_handle("https://anything.example/x"));
        assert!(adapter.can_handle("http://anything.example/x"));
        assert!(!adapter.can_handle("ftp://anything.example/x"));
        assert!(!adapter.can_handle("not a url"));
    }

    // ==================== Harvesting ====================

    #[test]
    fn test_harvest_absolutizes_relative_links() {
        let html = r#"<img src="/media/a.jpg"><a href="b.mp4">clip</a>"#;
        let items = harvest_media_items(&page(), html);
        let urls: Vec<&str> = items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.site/media/a.jpg",
                "https://example.site/gallery/b.mp4",
            ]
        );
    }

    #[test]
    fn test_harvest_ignores_non_media_links() {
        let html = r#"
            <a href="/about.html">about</a>
            <script src="/app.js"></script>
            <img src="/media/photo.png">
            <a href="mailto:alice@example.site">mail</a>
        "#;
        let items = harvest_media_items(&page(), html);
        assert_eq!(items.len(), 1);
        assert!(items[0].url.ends_with("photo.png"));
    }

    #[test]
    fn test_harvest_dedupes_preserving_order() {
        let html = r#"
            <img src="/a.jpg"><img data-src="/a.jpg">
            <img src="/b.jpg">
        "#;
        let items = harvest_media_items(&page(), html);
        let keys: Vec<&str> = items.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(keys, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_harvest_sets_site_var() {
        let html = r#"<img src="/a.jpg">"#;
        let items = harvest_media_items(&page(), html);
        assert_eq!(items[0].vars.site, "example.site");
    }

    #[test]
    fn test_filename_from_url_decodes() {
        let url = Url::parse("https://example.site/media/my%20photo.jpg").unwrap();
        assert_eq!(filename_from_url(&url), "my photo.jpg");
    }
}
