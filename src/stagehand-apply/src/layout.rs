//! On-disk layout of a feature directory.
//!
//! ```text
//! <data_dir>/<feature>/
//!     history.json            committed batches
//!     feature.json            status record
//!     revert.journal.json     present only while a revert is in flight
//!     commit.pending.json     installed batch whose history entry is not yet written
//!     staging/<path>          proposed content
//!     snapshots/<n>/<path>    pre-apply copy of <path> for batch n
//!     snapshots/<n>/<path>.__new__   <path> did not exist before batch n
//! ```

use std::path::{Path, PathBuf};

use stagehand_utils_file_safety::{join_relative, normalize_relative_path};

use crate::{ApplyError, Result};

/// Suffix of snapshot entries marking "file did not exist pre-apply".
pub const SENTINEL_SUFFIX: &str = ".__new__";

pub const HISTORY_FILE: &str = "history.json";
pub const FEATURE_FILE: &str = "feature.json";
pub const JOURNAL_FILE: &str = "revert.journal.json";
pub const PENDING_COMMIT_FILE: &str = "commit.pending.json";
pub const STAGING_DIR: &str = "staging";
pub const SNAPSHOTS_DIR: &str = "snapshots";

const MAX_FEATURE_ID_LEN: usize = 128;

/// Paths for one feature.
#[derive(Debug, Clone)]
pub struct FeatureLayout {
    dir: PathBuf,
}

impl FeatureLayout {
    /// Resolve the layout for `feature` under `data_dir`, validating the id.
    pub fn new(data_dir: &Path, feature: &str) -> Result<Self> {
        validate_feature_id(feature)?;
        Ok(Self {
            dir: data_dir.join(feature),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn feature_path(&self) -> PathBuf {
        self.dir.join(FEATURE_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    pub fn pending_commit_path(&self) -> PathBuf {
        self.dir.join(PENDING_COMMIT_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOTS_DIR)
    }

    pub fn snapshot_dir(&self, batch_index: u64) -> PathBuf {
        self.snapshots_dir().join(batch_index.to_string())
    }
}

/// Feature ids become directory names, so they are restricted to
/// `[A-Za-z0-9._-]`, may not start with `.`, and are at most 128 bytes.
pub fn validate_feature_id(feature: &str) -> Result<()> {
    let invalid = |reason| Err(ApplyError::InvalidFeatureId(feature.to_string(), reason));

    if feature.is_empty() {
        return invalid("id is empty");
    }
    if feature.len() > MAX_FEATURE_ID_LEN {
        return invalid("id is longer than 128 bytes");
    }
    if feature.starts_with('.') {
        return invalid("id may not start with '.'");
    }
    if !feature
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("id may only contain ASCII letters, digits, '-', '_' and '.'");
    }
    Ok(())
}

/// Normalize a staged relative path, rejecting anything that could escape
/// the source root or collide with a snapshot sentinel.
pub fn normalize_staged_path(raw: &str) -> Result<String> {
    let normalized = normalize_relative_path(raw).map_err(|e| ApplyError::invalid_path(raw, e))?;
    if normalized.ends_with(SENTINEL_SUFFIX) {
        return Err(ApplyError::InvalidPath {
            path: raw.to_string(),
            reason: format!("paths ending in '{SENTINEL_SUFFIX}' are reserved"),
        });
    }
    Ok(normalized)
}

/// Absolute location of a normalized relative path under `root`.
pub fn resolve(root: &Path, normalized: &str) -> PathBuf {
    join_relative(root, normalized)
}
