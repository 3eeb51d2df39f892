//! Typed download options and their loading rules.
//!
//! Options arrive from two boundaries with different strictness:
//! - the engine API ([`DownloadOptions::from_api_json`]) rejects unknown keys
//!   so callers learn about typos immediately;
//! - the persistence layer ([`DownloadOptions::from_stored_json`]) ignores
//!   unknown keys and clamps out-of-range values, so history written by a
//!   newer build still loads.
//!
//! Clamp notes produced while loading are surfaced as `LOG` events by the
//! next enqueue; the options themselves never carry invalid values.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default HTTP connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_S: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const DEFAULT_READ_TIMEOUT_S: u64 = 300;

/// Default maximum retry attempts (including the initial attempt).
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay for retry backoff (seconds).
pub const DEFAULT_RETRY_BASE_DELAY_S: u64 = 1;

/// Default ceiling for retry backoff (seconds).
pub const DEFAULT_RETRY_MAX_DELAY_S: u64 = 30;

/// Every key the options schema recognizes, for API-boundary validation.
const KNOWN_KEYS: [&str; 20] = [
    "include_images",
    "include_videos",
    "include_docs",
    "include_archives",
    "min_size_bytes",
    "max_size_bytes",
    "date_from",
    "date_to",
    "excluded_extensions",
    "proxy_url",
    "bandwidth_limit_kbps",
    "connection_timeout_s",
    "read_timeout_s",
    "user_agent",
    "max_retries",
    "retry_base_delay_s",
    "retry_max_delay_s",
    "folder_template",
    "file_naming_mode",
    "engine_specific",
];

/// Errors produced while loading options.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The API boundary rejects keys outside the schema.
    #[error("unrecognized option key: {0}")]
    UnknownKey(String),

    /// The JSON did not match the schema shape.
    #[error("malformed options: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// How destination filenames are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileNamingMode {
    /// Keep the name the source supplied.
    #[default]
    Original,
    /// Sequential number within the job (`001.jpg`, `002.jpg`, ...).
    Numbered,
    /// Unix-timestamp prefix plus the original name.
    Timestamped,
    /// SHA-256 of the source URL, hex-truncated.
    Hash,
}

/// The full recognized option surface. All fields have defaults; a missing
/// key means "use the default".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Include image files (jpg, png, gif, webp, ...).
    pub include_images: bool,
    /// Include video files (mp4, webm, mkv, ...).
    pub include_videos: bool,
    /// Include document files (pdf, txt, ...).
    pub include_docs: bool,
    /// Include archive files (zip, rar, 7z, ...).
    pub include_archives: bool,
    /// Minimum item size in bytes; 0 = unbounded.
    pub min_size_bytes: u64,
    /// Maximum item size in bytes; 0 = unbounded.
    pub max_size_bytes: u64,
    /// Inclusive lower bound on post publication date.
    pub date_from: Option<NaiveDate>,
    /// Inclusive upper bound on post publication date.
    pub date_to: Option<NaiveDate>,
    /// Lowercase extensions (without dot) to exclude.
    pub excluded_extensions: BTreeSet<String>,
    /// HTTP(S) proxy URL; empty = direct connection.
    pub proxy_url: String,
    /// Aggregate throughput cap in KiB/s; 0 = unlimited.
    pub bandwidth_limit_kbps: u64,
    /// Per-request connect timeout in seconds.
    pub connection_timeout_s: u64,
    /// Per-request read timeout in seconds.
    pub read_timeout_s: u64,
    /// User-Agent override; empty = engine default.
    pub user_agent: String,
    /// Maximum attempts per item (including the first).
    pub max_retries: u32,
    /// Base backoff delay in seconds.
    pub retry_base_delay_s: u64,
    /// Backoff ceiling in seconds.
    pub retry_max_delay_s: u64,
    /// Destination subfolder template with `{site}`, `{user}`, `{post}`,
    /// `{date:YYYY-MM-DD}` placeholders; empty = no subfolders.
    pub folder_template: String,
    /// Destination filename derivation mode.
    pub file_naming_mode: FileNamingMode,
    /// Opaque sub-record passed through to the resolved adapter.
    pub engine_specific: Value,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            include_images: true,
            include_videos: true,
            include_docs: true,
            include_archives: true,
            min_size_bytes: 0,
            max_size_bytes: 0,
            date_from: None,
            date_to: None,
            excluded_extensions: BTreeSet::new(),
            proxy_url: String::new(),
            bandwidth_limit_kbps: 0,
            connection_timeout_s: DEFAULT_CONNECT_TIMEOUT_S,
            read_timeout_s: DEFAULT_READ_TIMEOUT_S,
            user_agent: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_s: DEFAULT_RETRY_BASE_DELAY_S,
            retry_max_delay_s: DEFAULT_RETRY_MAX_DELAY_S,
            folder_template: String::new(),
            file_naming_mode: FileNamingMode::Original,
            engine_specific: Value::Object(serde_json::Map::new()),
        }
    }
}

impl DownloadOptions {
    /// Parses options handed to the engine API.
    ///
    /// Unknown keys are rejected so callers learn about typos immediately.
    /// Out-of-range values are clamped; the returned notes describe each
    /// clamp and are surfaced as `LOG` events by the enqueue path.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::UnknownKey`] for a key outside the schema,
    /// or [`OptionsError::Malformed`] for a shape mismatch.
    pub fn from_api_json(raw: &Value) -> Result<(Self, Vec<String>), OptionsError> {
        if let Value::Object(map) = raw {
            for key in map.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    return Err(OptionsError::UnknownKey(key.clone()));
                }
            }
        }
        Self::load(raw)
    }

    /// Parses options read back from the history store.
    ///
    /// Unknown keys are ignored (forward compatibility) and out-of-range
    /// values are clamped with notes, never errors.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::Malformed`] only when a known key has an
    /// irrecoverable shape (e.g. a string where an object is required).
    pub fn from_stored_json(raw: &Value) -> Result<(Self, Vec<String>), OptionsError> {
        Self::load(raw)
    }

    fn load(raw: &Value) -> Result<(Self, Vec<String>), OptionsError> {
        let mut notes = Vec::new();
        let sanitized = sanitize_numbers(raw, &mut notes);
        let mut options: Self = serde_json::from_value(sanitized)?;
        options.normalize(&mut notes);
        Ok((options, notes))
    }

    /// Clamps cross-field inconsistencies, recording a note per adjustment.
    fn normalize(&mut self, notes: &mut Vec<String>) {
        if self.max_size_bytes != 0 && self.max_size_bytes < self.min_size_bytes {
            notes.push(format!(
                "max_size_bytes {} below min_size_bytes {}; treating max as unbounded",
                self.max_size_bytes, self.min_size_bytes
            ));
            self.max_size_bytes = 0;
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to)
            && from > to
        {
            notes.push(format!("date window {from}..{to} inverted; swapping bounds"));
            self.date_from = Some(to);
            self.date_to = Some(from);
        }
        if self.connection_timeout_s == 0 {
            notes.push(format!(
                "connection_timeout_s 0 invalid; using default {DEFAULT_CONNECT_TIMEOUT_S}"
            ));
            self.connection_timeout_s = DEFAULT_CONNECT_TIMEOUT_S;
        }
        if self.read_timeout_s == 0 {
            notes.push(format!(
                "read_timeout_s 0 invalid; using default {DEFAULT_READ_TIMEOUT_S}"
            ));
            self.read_timeout_s = DEFAULT_READ_TIMEOUT_S;
        }
        if self.max_retries == 0 {
            notes.push("max_retries 0 invalid; using 1 (no retries)".to_string());
            self.max_retries = 1;
        }
        if self.retry_max_delay_s < self.retry_base_delay_s {
            notes.push(format!(
                "retry_max_delay_s {} below retry_base_delay_s {}; raising to base",
                self.retry_max_delay_s, self.retry_base_delay_s
            ));
            self.retry_max_delay_s = self.retry_base_delay_s;
        }
        // Extension sets compare as bare lowercase names everywhere else.
        self.excluded_extensions = self
            .excluded_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
    }
}

/// Replaces negative numbers in known numeric fields with 0, noting each.
///
/// Serde would reject `-1` for a `u64` field outright; the persistence
/// boundary instead clamps and keeps loading.
fn sanitize_numbers(raw: &Value, notes: &mut Vec<String>) -> Value {
    const NUMERIC_KEYS: [&str; 8] = [
        "min_size_bytes",
        "max_size_bytes",
        "bandwidth_limit_kbps",
        "connection_timeout_s",
        "read_timeout_s",
        "max_retries",
        "retry_base_delay_s",
        "retry_max_delay_s",
    ];

    let Value::Object(map) = raw else {
        return raw.clone();
    };

    let mut out = map.clone();
    for key in NUMERIC_KEYS {
        let negative = out.get(key).and_then(Value::as_i64).filter(|n| *n < 0);
        if let Some(n) = negative {
            notes.push(format!("{key} {n} negative; clamping to 0"));
            out.insert(key.to_string(), Value::from(0));
        }
    }
    Value::Object(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==================== Defaults ====================

    #[test]
    fn test_defaults_match_schema() {
        let options = DownloadOptions::default();
        assert!(options.include_images);
        assert!(options.include_videos);
        assert!(options.include_docs);
        assert!(options.include_archives);
        assert_eq!(options.min_size_bytes, 0);
        assert_eq!(options.max_size_bytes, 0);
        assert_eq!(options.connection_timeout_s, 30);
        assert_eq!(options.read_timeout_s, 300);
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retry_base_delay_s, 1);
        assert_eq!(options.retry_max_delay_s, 30);
        assert_eq!(options.file_naming_mode, FileNamingMode::Original);
        assert!(options.engine_specific.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_empty_object_loads_defaults() {
        let (options, notes) = DownloadOptions::from_api_json(&json!({})).unwrap();
        assert_eq!(options, DownloadOptions::default());
        assert!(notes.is_empty());
    }

    // ==================== API boundary ====================

    #[test]
    fn test_api_rejects_unknown_key() {
        let result = DownloadOptions::from_api_json(&json!({"include_imges": true}));
        assert!(matches!(result, Err(OptionsError::UnknownKey(k)) if k == "include_imges"));
    }

    #[test]
    fn test_api_accepts_full_surface() {
        let raw = json!({
            "include_images": true,
            "include_videos": false,
            "include_docs": true,
            "include_archives": false,
            "min_size_bytes": 1024,
            "max_size_bytes": 10_000_000,
            "date_from": "2024-01-01",
            "date_to": "2024-12-31",
            "excluded_extensions": ["tmp", "log"],
            "proxy_url": "http://127.0.0.1:8080",
            "bandwidth_limit_kbps": 512,
            "connection_timeout_s": 10,
            "read_timeout_s": 60,
            "user_agent": "spool-test/1.0",
            "max_retries": 3,
            "retry_base_delay_s": 2,
            "retry_max_delay_s": 20,
            "folder_template": "{site}/{user}",
            "file_naming_mode": "NUMBERED",
            "engine_specific": {"format": "bestvideo"},
        });
        let (options, notes) = DownloadOptions::from_api_json(&raw).unwrap();
        assert!(notes.is_empty());
        assert!(!options.include_videos);
        assert_eq!(options.max_size_bytes, 10_000_000);
        assert_eq!(options.file_naming_mode, FileNamingMode::Numbered);
        assert_eq!(options.engine_specific["format"], "bestvideo");
        assert_eq!(
            options.date_from,
            Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
    }

    // ==================== Persistence boundary ====================

    #[test]
    fn test_stored_ignores_unknown_keys() {
        let raw = json!({"include_images": false, "future_flag": 7});
        let (options, _) = DownloadOptions::from_stored_json(&raw).unwrap();
        assert!(!options.include_images);
    }

    #[test]
    fn test_stored_clamps_negative_bandwidth_with_note() {
        let raw = json!({"bandwidth_limit_kbps": -500});
        let (options, notes) = DownloadOptions::from_stored_json(&raw).unwrap();
        assert_eq!(options.bandwidth_limit_kbps, 0);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("bandwidth_limit_kbps"));
    }

    // ==================== Normalization ====================

    #[test]
    fn test_normalize_inverted_size_window() {
        let raw = json!({"min_size_bytes": 1000, "max_size_bytes": 10});
        let (options, notes) = DownloadOptions::from_api_json(&raw).unwrap();
        assert_eq!(options.max_size_bytes, 0);
        assert!(notes[0].contains("unbounded"));
    }

    #[test]
    fn test_normalize_inverted_date_window_swaps() {
        let raw = json!({"date_from": "2025-06-01", "date_to": "2025-01-01"});
        let (options, notes) = DownloadOptions::from_api_json(&raw).unwrap();
        assert!(options.date_from.unwrap() < options.date_to.unwrap());
        assert!(notes[0].contains("inverted"));
    }

    #[test]
    fn test_normalize_zero_timeouts_restore_defaults() {
        let raw = json!({"connection_timeout_s": 0, "read_timeout_s": 0});
        let (options, notes) = DownloadOptions::from_api_json(&raw).unwrap();
        assert_eq!(options.connection_timeout_s, DEFAULT_CONNECT_TIMEOUT_S);
        assert_eq!(options.read_timeout_s, DEFAULT_READ_TIMEOUT_S);
        assert_eq!(notes.len(), 2);
    }

    #[test]
    fn test_normalize_lowercases_excluded_extensions() {
        let raw = json!({"excluded_extensions": [".ZIP", "Log"]});
        let (options, _) = DownloadOptions::from_api_json(&raw).unwrap();
        assert!(options.excluded_extensions.contains("zip"));
        assert!(options.excluded_extensions.contains("log"));
    }

    #[test]
    fn test_normalize_retry_ceiling_not_below_base() {
        let raw = json!({"retry_base_delay_s": 10, "retry_max_delay_s": 2});
        let (options, notes) = DownloadOptions::from_api_json(&raw).unwrap();
        assert_eq!(options.retry_max_delay_s, 10);
        assert!(notes[0].contains("retry_max_delay_s"));
    }

    // ==================== Round trip ====================

    #[test]
    fn test_options_roundtrip_through_json() {
        let mut options = DownloadOptions::default();
        options.include_archives = false;
        options.folder_template = "{site}/{user}/{date:YYYY-MM-DD}".to_string();
        options.file_naming_mode = FileNamingMode::Hash;

        let blob = serde_json::to_value(&options).unwrap();
        let (loaded, notes) = DownloadOptions::from_stored_json(&blob).unwrap();
        assert_eq!(loaded, options);
        assert!(notes.is_empty());
    }

    #[test]
    fn test_file_naming_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&FileNamingMode::Timestamped).unwrap(),
            "\"TIMESTAMPED\""
        );
        let parsed: FileNamingMode = serde_json::from_str("\"HASH\"").unwrap();
        assert_eq!(parsed, FileNamingMode::Hash);
    }
}
