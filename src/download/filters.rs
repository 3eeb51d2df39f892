//! Pre-transfer filtering: file type, size, date window, extension set.
//!
//! Adapters evaluate filters before network transfer whenever the
//! information is available (extension from the URL, size from enumeration
//! or a HEAD probe, publication date from the post). A filtered item is
//! reported as `ITEM_SKIP` with the reason produced here.

use std::fmt;

use chrono::NaiveDate;

use crate::options::DownloadOptions;

/// Coarse media classification by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// jpg, png, gif, ...
    Image,
    /// mp4, webm, mkv, ...
    Video,
    /// pdf, txt, epub, ...
    Document,
    /// zip, rar, 7z, ...
    Archive,
    /// Anything unrecognized; never excluded by the type flags.
    Other,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Archive => "archive",
            Self::Other => "other",
        };
        write!(f, "{name}")
    }
}

const IMAGE_EXTENSIONS: [&str; 10] = [
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "avif", "heic", "tiff",
];
const VIDEO_EXTENSIONS: [&str; 10] = [
    "mp4", "webm", "mkv", "mov", "avi", "wmv", "flv", "m4v", "ts", "mpg",
];
const DOCUMENT_EXTENSIONS: [&str; 7] = ["pdf", "txt", "doc", "docx", "md", "epub", "rtf"];
const ARCHIVE_EXTENSIONS: [&str; 7] = ["zip", "rar", "7z", "tar", "gz", "bz2", "xz"];

/// Classifies a lowercase extension (without dot).
#[must_use]
pub fn classify_extension(ext: &str) -> FileKind {
    let ext = ext.trim_start_matches('.').to_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Image
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Video
    } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Document
    } else if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        FileKind::Archive
    } else {
        FileKind::Other
    }
}

/// Extracts the lowercase extension (without dot) from a filename or URL
/// path, ignoring query strings.
#[must_use]
pub fn extension_of(name_or_url: &str) -> Option<String> {
    let path = name_or_url
        .split(['?', '#'])
        .next()
        .unwrap_or(name_or_url);
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    let dot = last_segment.rfind('.')?;
    let ext = &last_segment[dot + 1..];
    if ext.is_empty() || ext.len() > 12 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Why an item was filtered out. `Display` yields the `ITEM_SKIP` reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The item's media type is switched off in the options.
    TypeExcluded(FileKind),
    /// The extension is in the excluded set.
    ExtensionExcluded(String),
    /// Below `min_size_bytes`.
    TooSmall {
        /// Observed size.
        size: u64,
        /// Configured minimum.
        min: u64,
    },
    /// Above `max_size_bytes`.
    TooLarge {
        /// Observed size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
    /// Published outside the configured date window.
    OutsideDateWindow(NaiveDate),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeExcluded(kind) => write!(f, "{kind} files excluded by options"),
            Self::ExtensionExcluded(ext) => write!(f, "extension .{ext} excluded by options"),
            Self::TooSmall { size, min } => {
                write!(f, "size {size} below minimum {min} bytes")
            }
            Self::TooLarge { size, max } => {
                write!(f, "size {size} above maximum {max} bytes")
            }
            Self::OutsideDateWindow(date) => {
                write!(f, "published {date} outside the requested date window")
            }
        }
    }
}

/// One enumerated item, as much of it as is known pre-transfer.
#[derive(Debug, Clone, Default)]
pub struct ItemCandidate<'a> {
    /// Filename or direct URL (extension source).
    pub name: &'a str,
    /// Size in bytes, when enumeration or a HEAD probe supplied it.
    pub size: Option<u64>,
    /// Post publication date, when the source exposes it.
    pub published: Option<NaiveDate>,
}

/// Filter set snapshotted from one job's options.
#[derive(Debug, Clone)]
pub struct ItemFilter {
    include_images: bool,
    include_videos: bool,
    include_docs: bool,
    include_archives: bool,
    min_size: u64,
    max_size: u64,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    excluded_extensions: std::collections::BTreeSet<String>,
}

impl ItemFilter {
    /// Builds the filter from job options.
    #[must_use]
    pub fn from_options(options: &DownloadOptions) -> Self {
        Self {
            include_images: options.include_images,
            include_videos: options.include_videos,
            include_docs: options.include_docs,
            include_archives: options.include_archives,
            min_size: options.min_size_bytes,
            max_size: options.max_size_bytes,
            date_from: options.date_from,
            date_to: options.date_to,
            excluded_extensions: options.excluded_extensions.clone(),
        }
    }

    /// Evaluates everything known about a candidate. Returns the first
    /// matching skip reason, or `None` to proceed.
    #[must_use]
    pub fn evaluate(&self, candidate: &ItemCandidate<'_>) -> Option<SkipReason> {
        if let Some(ext) = extension_of(candidate.name) {
            if self.excluded_extensions.contains(&ext) {
                return Some(SkipReason::ExtensionExcluded(ext));
            }
            let kind = classify_extension(&ext);
            if !self.kind_included(kind) {
                return Some(SkipReason::TypeExcluded(kind));
            }
        }

        if let Some(size) = candidate.size
            && let Some(reason) = self.check_size(size)
        {
            return Some(reason);
        }

        if let Some(published) = candidate.published
            && let Some(reason) = self.check_date(published)
        {
            return Some(reason);
        }

        None
    }

    /// Size-only check, usable again after a HEAD probe fills in the size.
    #[must_use]
    pub fn check_size(&self, size: u64) -> Option<SkipReason> {
        if self.min_size > 0 && size < self.min_size {
            return Some(SkipReason::TooSmall {
                size,
                min: self.min_size,
            });
        }
        if self.max_size > 0 && size > self.max_size {
            return Some(SkipReason::TooLarge {
                size,
                max: self.max_size,
            });
        }
        None
    }

    /// Inclusive date-window check.
    #[must_use]
    pub fn check_date(&self, published: NaiveDate) -> Option<SkipReason> {
        if let Some(from) = self.date_from
            && published < from
        {
            return Some(SkipReason::OutsideDateWindow(published));
        }
        if let Some(to) = self.date_to
            && published > to
        {
            return Some(SkipReason::OutsideDateWindow(published));
        }
        None
    }

    fn kind_included(&self, kind: FileKind) -> bool {
        match kind {
            FileKind::Image => self.include_images,
            FileKind::Video => self.include_videos,
            FileKind::Document => self.include_docs,
            FileKind::Archive => self.include_archives,
            FileKind::Other => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn options_with(mutate: impl FnOnce(&mut DownloadOptions)) -> DownloadOptions {
        let mut options = DownloadOptions::default();
        mutate(&mut options);
        options
    }

    // ==================== Classification ====================

    #[test]
    fn test_classify_known_extensions() {
        assert_eq!(classify_extension("jpg"), FileKind::Image);
        assert_eq!(classify_extension(".PNG"), FileKind::Image);
        assert_eq!(classify_extension("mp4"), FileKind::Video);
        assert_eq!(classify_extension("pdf"), FileKind::Document);
        assert_eq!(classify_extension("zip"), FileKind::Archive);
        assert_eq!(classify_extension("mp3"), FileKind::Other);
    }

    #[test]
    fn test_extension_of_url_with_query() {
        assert_eq!(
            extension_of("https://cdn.example.site/a/b/photo.JPG?token=x"),
            Some("jpg".to_string())
        );
        assert_eq!(extension_of("photo"), None);
        assert_eq!(extension_of("https://example.site/path/"), None);
    }

    // ==================== Type and extension filters ====================

    #[test]
    fn test_default_filter_passes_everything() {
        let filter = ItemFilter::from_options(&DownloadOptions::default());
        let candidate = ItemCandidate {
            name: "video.mp4",
            size: Some(5_000_000),
            published: None,
        };
        assert_eq!(filter.evaluate(&candidate), None);
    }

    #[test]
    fn test_archives_excluded_by_type_flag() {
        let options = options_with(|o| o.include_archives = false);
        let filter = ItemFilter::from_options(&options);

        let candidate = ItemCandidate {
            name: "bundle.zip",
            ..Default::default()
        };
        assert_eq!(
            filter.evaluate(&candidate),
            Some(SkipReason::TypeExcluded(FileKind::Archive))
        );
    }

    #[test]
    fn test_unknown_kind_never_type_excluded() {
        let options = options_with(|o| {
            o.include_images = false;
            o.include_videos = false;
            o.include_docs = false;
            o.include_archives = false;
        });
        let filter = ItemFilter::from_options(&options);
        let candidate = ItemCandidate {
            name: "track.mp3",
            ..Default::default()
        };
        assert_eq!(filter.evaluate(&candidate), None);
    }

    #[test]
    fn test_excluded_extension_wins_over_type() {
        let options = options_with(|o| {
            o.excluded_extensions.insert("jpg".to_string());
        });
        let filter = ItemFilter::from_options(&options);
        let candidate = ItemCandidate {
            name: "photo.jpg",
            ..Default::default()
        };
        assert_eq!(
            filter.evaluate(&candidate),
            Some(SkipReason::ExtensionExcluded("jpg".to_string()))
        );
    }

    // ==================== Size window ====================

    #[test]
    fn test_size_window_bounds() {
        let options = options_with(|o| {
            o.min_size_bytes = 1000;
            o.max_size_bytes = 10_000_000;
        });
        let filter = ItemFilter::from_options(&options);

        assert_eq!(
            filter.check_size(500),
            Some(SkipReason::TooSmall {
                size: 500,
                min: 1000
            })
        );
        assert_eq!(
            filter.check_size(12_000_000),
            Some(SkipReason::TooLarge {
                size: 12_000_000,
                max: 10_000_000
            })
        );
        assert_eq!(filter.check_size(1000), None);
        assert_eq!(filter.check_size(10_000_000), None);
    }

    #[test]
    fn test_zero_bounds_are_unbounded() {
        let filter = ItemFilter::from_options(&DownloadOptions::default());
        assert_eq!(filter.check_size(0), None);
        assert_eq!(filter.check_size(u64::MAX), None);
    }

    // ==================== Date window ====================

    #[test]
    fn test_date_window_inclusive() {
        let options = options_with(|o| {
            o.date_from = NaiveDate::from_ymd_opt(2024, 1, 1);
            o.date_to = NaiveDate::from_ymd_opt(2024, 12, 31);
        });
        let filter = ItemFilter::from_options(&options);

        let inside = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        assert_eq!(filter.check_date(inside), None);

        // Boundaries are inclusive.
        assert_eq!(
            filter.check_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            None
        );
        assert_eq!(
            filter.check_date(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()),
            None
        );

        let before = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert!(matches!(
            filter.check_date(before),
            Some(SkipReason::OutsideDateWindow(_))
        ));
    }

    // ==================== Reason text ====================

    #[test]
    fn test_skip_reason_messages_are_descriptive() {
        assert!(
            SkipReason::TypeExcluded(FileKind::Archive)
                .to_string()
                .contains("archive")
        );
        assert!(
            SkipReason::TooLarge {
                size: 12,
                max: 10
            }
            .to_string()
            .contains("maximum")
        );
    }
}
