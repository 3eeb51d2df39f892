//! URL-to-adapter resolution with a 4-tier fallback.
//!
//! Resolution is pure (no I/O) and deterministic:
//!
//! 1. **Native tier**: registered site adapters, in registration order
//! 2. **Gallery tier**: the gallery-dl wrapper, by host match
//! 3. **Universal tier**: the yt-dlp wrapper, by host match
//! 4. **Generic tier**: the HTML scraper, for any http(s) URL
//!
//! Falling through to the generic tier is flagged so the caller can emit a
//! warning `LOG`; the generic adapter itself then either finds media or
//! fails the job with a clear message.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::{Downloader, GalleryDlAdapter, GenericAdapter, YtDlpAdapter};

/// Engine classification recorded on the job and shown in views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTag {
    /// A registered site adapter.
    Native(String),
    /// The gallery-dl wrapper.
    Gallery,
    /// The yt-dlp wrapper.
    Ytdlp,
    /// The fallback HTML scraper.
    Generic,
}

impl EngineTag {
    /// The persisted/wire label: `native:<site>` | `gallery` | `ytdlp` |
    /// `generic`.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Native(site) => format!("native:{site}"),
            Self::Gallery => "gallery".to_string(),
            Self::Ytdlp => "ytdlp".to_string(),
            Self::Generic => "generic".to_string(),
        }
    }
}

impl fmt::Display for EngineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Result of resolving one URL.
#[derive(Clone)]
pub struct Resolution {
    /// The adapter that will run the job.
    pub adapter: Arc<dyn Downloader>,
    /// Its engine classification.
    pub tag: EngineTag,
    /// True when no specific tier matched and the generic scraper is a
    /// last resort (the caller emits a warning).
    pub fallback: bool,
}

/// Adapter registry and resolution order.
pub struct DownloaderFactory {
    native: Vec<Arc<dyn Downloader>>,
    gallery: Arc<GalleryDlAdapter>,
    universal: Arc<YtDlpAdapter>,
    generic: Arc<GenericAdapter>,
}

impl Default for DownloaderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloaderFactory {
    /// Creates a factory with the built-in engine tiers and an empty
    /// native registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            native: Vec::new(),
            gallery: Arc::new(GalleryDlAdapter::new()),
            universal: Arc::new(YtDlpAdapter::new()),
            generic: Arc::new(GenericAdapter::new()),
        }
    }

    /// Registers a native site adapter. Ties within the native tier
    /// resolve in registration order.
    pub fn register_native(&mut self, adapter: Arc<dyn Downloader>) {
        debug!(site = adapter.site_name(), "registered native adapter");
        self.native.push(adapter);
    }

    /// Resolves a URL to an adapter and engine tag.
    #[instrument(skip(self))]
    #[must_use]
    pub fn resolve(&self, url: &str) -> Resolution {
        for adapter in &self.native {
            if adapter.can_handle(url) {
                return Resolution {
                    tag: EngineTag::Native(adapter.site_name().to_string()),
                    adapter: Arc::clone(adapter),
                    fallback: false,
                };
            }
        }

        if self.gallery.can_handle(url) {
            return Resolution {
                adapter: self.gallery.clone(),
                tag: EngineTag::Gallery,
                fallback: false,
            };
        }

        if self.universal.can_handle(url) {
            return Resolution {
                adapter: self.universal.clone(),
                tag: EngineTag::Ytdlp,
                fallback: false,
            };
        }

        debug!("no specific adapter matched; using generic scraper");
        Resolution {
            adapter: self.generic.clone(),
            tag: EngineTag::Generic,
            fallback: true,
        }
    }
}

impl fmt::Debug for DownloaderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloaderFactory")
            .field(
                "native",
                &self
                    .native
                    .iter()
                    .map(|a| a.site_name())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
