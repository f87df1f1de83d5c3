//! File safety utilities for Stagehand.
//!
//! This crate holds the small filesystem guards the apply engine relies on:
//! - Validation of caller-supplied relative paths so they can never escape
//!   the directory they are joined onto
//! - Regular-file checks before copying a file into an undo log (devices,
//!   FIFOs and sockets are refused, oversized files are refused)
//! - Crash-safe atomic writes (temp file, fsync, rename) for metadata files

use std::fs::{File, Metadata, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum file size accepted by [`ensure_regular_file`] callers that do not
/// configure their own limit (100MB).
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Errors that can occur during file validation.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// A relative path was empty, absolute, or tried to leave its base.
    #[error("Invalid relative path '{path}': {reason}")]
    InvalidRelativePath { path: String, reason: &'static str },

    /// The path exists but is a directory.
    #[error("Expected a regular file but found a directory: {0}")]
    Directory(PathBuf),

    /// The path is a block/character device, FIFO or socket.
    #[error("Refusing to read special file: {0}")]
    SpecialFile(PathBuf),

    /// File exceeds maximum allowed size.
    #[error("File too large: {path} ({size} bytes, max {max} bytes)")]
    TooLarge { path: PathBuf, size: u64, max: u64 },

    /// IO error during validation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalize a caller-supplied relative path into its canonical
/// `/`-separated form.
///
/// Both `/` and `\` are accepted as separators. Empty and `.` segments are
/// dropped. Absolute paths, drive prefixes, `..` segments and NUL bytes are
/// rejected.
///
/// # Examples
///
/// ```
/// use stagehand_utils_file_safety::normalize_relative_path;
///
/// assert_eq!(normalize_relative_path("src//./lib.rs").unwrap(), "src/lib.rs");
/// assert!(normalize_relative_path("../etc/passwd").is_err());
/// ```
pub fn normalize_relative_path(raw: &str) -> Result<String, FileError> {
    let invalid = |reason| FileError::InvalidRelativePath {
        path: raw.to_string(),
        reason,
    };

    if raw.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }

    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(invalid("absolute paths are not allowed"));
    }
    if Path::new(raw)
        .components()
        .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        return Err(invalid("absolute paths are not allowed"));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(invalid("parent directory segments are not allowed")),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(invalid("path is empty"));
    }

    Ok(segments.join("/"))
}

/// Join a path produced by [`normalize_relative_path`] onto `base`.
pub fn join_relative(base: &Path, normalized: &str) -> PathBuf {
    normalized
        .split('/')
        .fold(base.to_path_buf(), |acc, segment| acc.join(segment))
}

/// Render `path` relative to `base` in `/`-separated form.
///
/// Returns `None` when `path` is not under `base` or contains non-UTF-8
/// segments.
pub fn relative_string(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => segments.push(s.to_str()?.to_string()),
            _ => return None,
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Validate that `metadata` (taken from `path`) describes a regular file
/// that is safe to copy.
///
/// `max_size` of 0 disables the size check.
pub fn ensure_regular_file(path: &Path, metadata: &Metadata, max_size: u64) -> Result<(), FileError> {
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        return Err(FileError::Directory(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;

        if file_type.is_block_device()
            || file_type.is_char_device()
            || file_type.is_fifo()
            || file_type.is_socket()
        {
            return Err(FileError::SpecialFile(path.to_path_buf()));
        }
    }

    if !file_type.is_file() {
        return Err(FileError::SpecialFile(path.to_path_buf()));
    }

    if max_size > 0 && metadata.len() > max_size {
        return Err(FileError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max: max_size,
        });
    }

    Ok(())
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically write content to a file.
///
/// Writes to a uniquely named temporary sibling, optionally syncs it to
/// disk, then renames it over `path`. The target therefore holds either the
/// old content or the new content, never a partial write. The temporary
/// file is removed if any step fails.
///
/// # Examples
///
/// ```no_run
/// use stagehand_utils_file_safety::atomic_write;
/// use std::path::Path;
///
/// atomic_write(Path::new("history.json"), b"[]", true).expect("Failed to write");
/// ```
pub fn atomic_write(path: &Path, content: &[u8], sync: bool) -> Result<(), std::io::Error> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let temp_name = format!(
        ".{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = parent.join(&temp_name);

    let result = write_and_rename(&temp_path, path, content, sync);
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    #[cfg(unix)]
    if sync {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Whether `name` is a temporary file left by an interrupted
/// [`atomic_write`], i.e. `.<target>.tmp.<pid>.<counter>`.
///
/// ```
/// use stagehand_utils_file_safety::is_atomic_temp_name;
///
/// assert!(is_atomic_temp_name(".history.json.tmp.4242.0"));
/// assert!(!is_atomic_temp_name(".env.tmp.local"));
/// ```
pub fn is_atomic_temp_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('.') else {
        return false;
    };
    let mut parts = rest.rsplitn(3, '.');
    let (Some(counter), Some(pid), Some(stem)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    numeric(counter)
        && numeric(pid)
        && stem
            .strip_suffix(".tmp")
            .is_some_and(|target| !target.is_empty())
}

fn write_and_rename(
    temp_path: &Path,
    path: &Path,
    content: &[u8],
    sync: bool,
) -> Result<(), std::io::Error> {
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)?;
        file.write_all(content)?;
        if sync {
            file.sync_all()?;
        }
    }
    std::fs::rename(temp_path, path)
}
