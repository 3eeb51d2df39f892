//! Filesystem adapter: atomic writes, partial files, naming, templating.
//!
//! Items download to `<final>.part` next to their destination and are
//! renamed into place only after a successful size check, so a crash never
//! leaves a half-written file masquerading as complete. Leftover `.part`
//! files are either resumed (when the server supports ranged GET) or
//! discarded and restarted.
//!
//! Destination paths come from the job's `folder_template` rendered under
//! the job's output folder; rendering rejects anything that would escape it.

use std::path::{Component, Path, PathBuf};

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, instrument, warn};

use crate::options::FileNamingMode;

/// Maximum filename length after sanitization, extension included.
const MAX_FILENAME_CHARS: usize = 200;

/// Hex characters of the URL digest used by the HASH naming mode.
const HASH_NAME_CHARS: usize = 16;

/// Errors produced by filesystem operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic filesystem failure.
    #[error("storage error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The disk filled up. Fatal to the job, never retried.
    #[error("disk full at {path}")]
    DiskFull {
        /// The path being written.
        path: PathBuf,
    },

    /// The rendered template would escape the output folder.
    #[error("folder template escapes the output folder: {rendered}")]
    TemplateEscape {
        /// The offending rendered path.
        rendered: String,
    },

    /// A committed file did not match the expected size.
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The staged file.
        path: PathBuf,
        /// Expected size in bytes.
        expected: u64,
        /// Observed size in bytes.
        actual: u64,
    },
}

impl StorageError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::StorageFull {
            return Self::DiskFull { path };
        }
        Self::Io { path, source }
    }

    /// True for disk-space exhaustion (fatal to the whole job).
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull { .. })
    }
}

/// Values substituted into a folder template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    /// `{site}` placeholder.
    pub site: String,
    /// `{user}` placeholder.
    pub user: String,
    /// `{post}` placeholder.
    pub post: String,
    /// `{date:YYYY-MM-DD}` placeholder.
    pub date: Option<NaiveDate>,
}

/// An opened `.part` staging file plus how many bytes it already holds.
#[derive(Debug)]
pub struct PartFile {
    /// The open handle, positioned at the end.
    pub file: File,
    /// Bytes already present (non-zero only when resuming).
    pub existing_bytes: u64,
}

/// Per-job filesystem adapter rooted at the job's output folder.
#[derive(Debug, Clone)]
pub struct FsAdapter {
    root: PathBuf,
}

impl FsAdapter {
    /// Creates an adapter over the job's output folder.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The job's output root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Plans the destination path for one item: renders the folder
    /// template, creates missing directories, derives the filename per the
    /// naming mode, and resolves collisions with a numeric suffix.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TemplateEscape`] for traversal attempts and
    /// [`StorageError::Io`] for directory creation failures.
    #[instrument(skip(self, vars), fields(root = %self.root.display()))]
    pub async fn plan_item(
        &self,
        template: &str,
        vars: &TemplateVars,
        source_url: &str,
        original_name: &str,
        naming: FileNamingMode,
        sequence: usize,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.render_template(template, vars)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let filename = derive_filename(source_url, original_name, naming, sequence);
        Ok(resolve_unique_path(&dir, &filename))
    }

    /// Renders the folder template under the output root.
    ///
    /// Placeholder values are sanitized before substitution, so a hostile
    /// `{user}` cannot inject separators; any residual `..`/absolute
    /// segment rejects the whole path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TemplateEscape`] when expansion would leave
    /// the output folder.
    pub fn render_template(
        &self,
        template: &str,
        vars: &TemplateVars,
    ) -> Result<PathBuf, StorageError> {
        if template.is_empty() {
            return Ok(self.root.clone());
        }

        let date = vars
            .date
            .map_or_else(|| "undated".to_string(), |d| d.format("%Y-%m-%d").to_string());
        let rendered = template
            .replace("{site}", &sanitize_filename(&vars.site))
            .replace("{user}", &sanitize_filename(&vars.user))
            .replace("{post}", &sanitize_filename(&vars.post))
            .replace("{date:YYYY-MM-DD}", &date);

        let relative = Path::new(&rendered);
        let mut out = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => out.push(segment),
                Component::CurDir => {}
                _ => {
                    return Err(StorageError::TemplateEscape { rendered });
                }
            }
        }
        Ok(out)
    }

    /// The staging path next to a final destination.
    #[must_use]
    pub fn part_path(final_path: &Path) -> PathBuf {
        let mut name = final_path
            .file_name()
            .map_or_else(|| "download".to_string(), |n| n.to_string_lossy().into_owned());
        name.push_str(".part");
        final_path.with_file_name(name)
    }

    /// Opens the `.part` file for a destination.
    ///
    /// With `resume` set and a leftover `.part` present, the handle opens
    /// in append mode and `existing_bytes` reports what is already there;
    /// otherwise the staging file is created fresh.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] / [`StorageError::DiskFull`].
    #[instrument(skip(self))]
    pub async fn open_part(
        &self,
        final_path: &Path,
        resume: bool,
    ) -> Result<PartFile, StorageError> {
        let part = Self::part_path(final_path);

        if resume {
            if let Ok(meta) = tokio::fs::metadata(&part).await {
                let existing_bytes = meta.len();
                debug!(path = %part.display(), existing_bytes, "resuming partial file");
                let file = OpenOptions::new()
                    .append(true)
                    .open(&part)
                    .await
                    .map_err(|e| StorageError::io(&part, e))?;
                return Ok(PartFile {
                    file,
                    existing_bytes,
                });
            }
        }

        let file = File::create(&part)
            .await
            .map_err(|e| StorageError::io(&part, e))?;
        Ok(PartFile {
            file,
            existing_bytes: 0,
        })
    }

    /// Size of a leftover `.part` file, if one exists.
    pub async fn part_size(final_path: &Path) -> Option<u64> {
        tokio::fs::metadata(Self::part_path(final_path))
            .await
            .ok()
            .map(|m| m.len())
    }

    /// Commits a completed `.part` into place: verifies the size when the
    /// expected total is known, then renames atomically. Returns the final
    /// size on disk.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SizeMismatch`] when the staged size differs
    /// from the expectation (the `.part` is kept for a ranged retry), or
    /// [`StorageError::Io`] for rename failures.
    #[instrument(skip(self))]
    pub async fn commit(
        &self,
        final_path: &Path,
        expected_bytes: Option<u64>,
    ) -> Result<u64, StorageError> {
        let part = Self::part_path(final_path);
        let actual = tokio::fs::metadata(&part)
            .await
            .map_err(|e| StorageError::io(&part, e))?
            .len();

        if let Some(expected) = expected_bytes
            && expected != actual
        {
            return Err(StorageError::SizeMismatch {
                path: part,
                expected,
                actual,
            });
        }

        tokio::fs::rename(&part, final_path)
            .await
            .map_err(|e| StorageError::io(final_path, e))?;
        debug!(path = %final_path.display(), bytes = actual, "committed download");
        Ok(actual)
    }

    /// Removes the `.part` for a destination, ignoring absence.
    #[instrument(skip(self))]
    pub async fn discard_part(&self, final_path: &Path) {
        let part = Self::part_path(final_path);
        match tokio::fs::remove_file(&part).await {
            Ok(()) => debug!(path = %part.display(), "discarded partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %part.display(), error = %e, "failed to discard partial file"),
        }
    }
}

/// Makes a name safe to write to disk.
///
/// Replaces `< > : " / \ | ? *` and control characters with `_`, then
/// truncates to 200 characters preserving the extension. Idempotent:
/// `sanitize(sanitize(x)) == sanitize(x)`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        return "_".to_string();
    }

    truncate_preserving_extension(trimmed, MAX_FILENAME_CHARS)
}

/// Truncates to `max` characters, keeping the extension intact.
fn truncate_preserving_extension(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        // Only treat a short trailing segment as an extension.
        Some(pos) if name.len() - pos <= 13 && pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let keep = max.saturating_sub(ext.chars().count()).max(1);
    let truncated_stem: String = stem.chars().take(keep).collect();
    format!("{truncated_stem}{ext}")
}

/// Derives the destination filename for one item per the naming mode.
#[must_use]
pub fn derive_filename(
    source_url: &str,
    original_name: &str,
    naming: FileNamingMode,
    sequence: usize,
) -> String {
    let original = sanitize_filename(original_name);
    let extension = original
        .rfind('.')
        .map(|pos| original[pos..].to_string())
        .unwrap_or_default();

    match naming {
        FileNamingMode::Original => original,
        FileNamingMode::Numbered => format!("{sequence:03}{extension}"),
        FileNamingMode::Timestamped => {
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("{timestamp}_{original}")
        }
        FileNamingMode::Hash => {
            let digest = Sha256::digest(source_url.as_bytes());
            let hex: String = digest
                .iter()
                .take(HASH_NAME_CHARS / 2)
                .map(|b| format!("{b:02x}"))
                .collect();
            format!("{hex}{extension}")
        }
    }
}

/// Resolves a unique file path, adding a numeric suffix if the destination
/// or its staging file already exists.
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let base_path = dir.join(&filename);

    if !base_path.exists() && !FsAdapter::part_path(&base_path).exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename.as_str(), ""),
    };

    for i in 2..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() && !FsAdapter::part_path(&candidate).exists() {
            return candidate;
        }
    }

    // Practically unreachable; fall back to a timestamped name.
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn vars() -> TemplateVars {
        TemplateVars {
            site: "example.site".to_string(),
            user: "alice".to_string(),
            post: "post-42".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 9),
        }
    }

    // ==================== Sanitization ====================

    #[test]
    fn test_sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename(r#"a<b>c:d"e/f\g|h?i*j.png"#), "a_b_c_d_e_f_g_h_i_j.png");
    }

    #[test]
    fn test_sanitize_replaces_control_characters() {
        assert_eq!(sanitize_filename("a\x00b\x1fc.jpg"), "a_b_c.jpg");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            r#"we?ird:na/me.mp4"#,
            "ordinary.jpg",
            &"x".repeat(400),
            "no_extension",
            " spaced .png",
        ];
        for input in inputs {
            let once = sanitize_filename(input);
            assert_eq!(sanitize_filename(&once), once, "input: {input}");
        }
    }

    #[test]
    fn test_sanitize_truncates_preserving_extension() {
        let long = format!("{}.jpeg", "a".repeat(300));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.chars().count(), 200);
        assert!(sanitized.ends_with(".jpeg"));
    }

    #[test]
    fn test_sanitize_empty_becomes_placeholder() {
        assert_eq!(sanitize_filename(""), "_");
        assert_eq!(sanitize_filename("   "), "_");
    }

    // ==================== Naming modes ====================

    #[test]
    fn test_derive_filename_original() {
        let name = derive_filename(
            "https://cdn.example.site/x/photo.jpg",
            "photo.jpg",
            FileNamingMode::Original,
            1,
        );
        assert_eq!(name, "photo.jpg");
    }

    #[test]
    fn test_derive_filename_numbered_keeps_extension() {
        let name = derive_filename(
            "https://cdn.example.site/x/photo.jpg",
            "photo.jpg",
            FileNamingMode::Numbered,
            7,
        );
        assert_eq!(name, "007.jpg");
    }

    #[test]
    fn test_derive_filename_hash_is_stable() {
        let first = derive_filename(
            "https://cdn.example.site/x/photo.jpg",
            "photo.jpg",
            FileNamingMode::Hash,
            1,
        );
        let second = derive_filename(
            "https://cdn.example.site/x/photo.jpg",
            "renamed.jpg",
            FileNamingMode::Hash,
            9,
        );
        assert_eq!(first, second);
        assert_eq!(first.len(), HASH_NAME_CHARS + 4);
        assert!(first.ends_with(".jpg"));
    }

    #[test]
    fn test_derive_filename_timestamped_prefixes_original() {
        let name = derive_filename(
            "https://cdn.example.site/x/photo.jpg",
            "photo.jpg",
            FileNamingMode::Timestamped,
            1,
        );
        assert!(name.ends_with("_photo.jpg"));
    }

    // ==================== Template rendering ====================

    #[test]
    fn test_render_template_substitutes_placeholders() {
        let fs = FsAdapter::new("/out");
        let dir = fs
            .render_template("{site}/{user}/{date:YYYY-MM-DD}", &vars())
            .unwrap();
        assert_eq!(dir, PathBuf::from("/out/example.site/alice/2025-03-09"));
    }

    #[test]
    fn test_render_template_empty_is_root() {
        let fs = FsAdapter::new("/out");
        assert_eq!(fs.render_template("", &vars()).unwrap(), PathBuf::from("/out"));
    }

    #[test]
    fn test_render_template_missing_date_uses_placeholder() {
        let fs = FsAdapter::new("/out");
        let mut v = vars();
        v.date = None;
        let dir = fs.render_template("{date:YYYY-MM-DD}", &v).unwrap();
        assert_eq!(dir, PathBuf::from("/out/undated"));
    }

    #[test]
    fn test_render_template_rejects_traversal() {
        let fs = FsAdapter::new("/out");
        let result = fs.render_template("../{user}", &vars());
        assert!(matches!(result, Err(StorageError::TemplateEscape { .. })));
    }

    #[test]
    fn test_render_template_sanitizes_hostile_values() {
        let fs = FsAdapter::new("/out");
        let mut v = vars();
        v.user = "../../etc".to_string();
        // The separators inside the value are flattened to underscores.
        let dir = fs.render_template("{user}", &v).unwrap();
        assert_eq!(dir, PathBuf::from("/out/.._.._etc"));
    }

    // ==================== Part files ====================

    #[tokio::test]
    async fn test_part_path_appends_suffix() {
        let part = FsAdapter::part_path(Path::new("/out/a/photo.jpg"));
        assert_eq!(part, PathBuf::from("/out/a/photo.jpg.part"));
    }

    #[tokio::test]
    async fn test_open_write_commit_cycle() {
        let temp = tempfile::tempdir().unwrap();
        let fs = FsAdapter::new(temp.path());
        let final_path = temp.path().join("photo.jpg");

        let mut part = fs.open_part(&final_path, false).await.unwrap();
        part.file.write_all(b"0123456789").await.unwrap();
        part.file.flush().await.unwrap();
        drop(part);

        let bytes = fs.commit(&final_path, Some(10)).await.unwrap();
        assert_eq!(bytes, 10);
        assert!(final_path.exists());
        assert!(!FsAdapter::part_path(&final_path).exists());
    }

    #[tokio::test]
    async fn test_commit_size_mismatch_keeps_part() {
        let temp = tempfile::tempdir().unwrap();
        let fs = FsAdapter::new(temp.path());
        let final_path = temp.path().join("photo.jpg");

        let mut part = fs.open_part(&final_path, false).await.unwrap();
        part.file.write_all(b"short").await.unwrap();
        part.file.flush().await.unwrap();
        drop(part);

        let result = fs.commit(&final_path, Some(10)).await;
        assert!(matches!(result, Err(StorageError::SizeMismatch { .. })));
        assert!(!final_path.exists());
        assert!(FsAdapter::part_path(&final_path).exists());
    }

    #[tokio::test]
    async fn test_open_part_resumes_existing_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let fs = FsAdapter::new(temp.path());
        let final_path = temp.path().join("video.mp4");

        let mut part = fs.open_part(&final_path, false).await.unwrap();
        part.file.write_all(b"01234").await.unwrap();
        part.file.flush().await.unwrap();
        drop(part);

        let resumed = fs.open_part(&final_path, true).await.unwrap();
        assert_eq!(resumed.existing_bytes, 5);

        // Without resume, the staging file restarts from zero.
        let fresh = fs.open_part(&final_path, false).await.unwrap();
        assert_eq!(fresh.existing_bytes, 0);
    }

    #[tokio::test]
    async fn test_discard_part_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let fs = FsAdapter::new(temp.path());
        let final_path = temp.path().join("photo.jpg");

        fs.open_part(&final_path, false).await.unwrap();
        fs.discard_part(&final_path).await;
        assert!(!FsAdapter::part_path(&final_path).exists());

        // Second discard is a no-op.
        fs.discard_part(&final_path).await;
    }

    // ==================== Collision handling ====================

    #[tokio::test]
    async fn test_resolve_unique_path_adds_suffix() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("photo.jpg"), b"x").unwrap();

        let next = resolve_unique_path(temp.path(), "photo.jpg");
        assert_eq!(next, temp.path().join("photo_2.jpg"));

        std::fs::write(&next, b"x").unwrap();
        let third = resolve_unique_path(temp.path(), "photo.jpg");
        assert_eq!(third, temp.path().join("photo_3.jpg"));
    }

    #[tokio::test]
    async fn test_plan_item_creates_directories() {
        let temp = tempfile::tempdir().unwrap();
        let fs = FsAdapter::new(temp.path());

        let path = fs
            .plan_item(
                "{site}/{user}",
                &vars(),
                "https://cdn.example.site/x/photo.jpg",
                "photo.jpg",
                FileNamingMode::Original,
                1,
            )
            .await
            .unwrap();

        assert!(path.parent().unwrap().is_dir());
        assert!(path.ends_with("example.site/alice/photo.jpg"));
    }
}
