//! Error types for stagehand-apply.

use std::path::PathBuf;

use stagehand_utils_file_safety::FileError;
use thiserror::Error;

use crate::engine::ApplyPhase;

/// Apply engine error types.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Feature ids name a directory under the data dir.
    #[error("Invalid feature id '{0}': {1}")]
    InvalidFeatureId(String, &'static str),

    /// A staged relative path cannot be mapped into the source tree.
    #[error("Invalid staged path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Source root {} is not a directory", .0.display())]
    SourceRootMissing(PathBuf),

    /// The undo log could not be written. Nothing was mutated.
    #[error("Snapshot for batch {batch_index} failed at '{path}': {message}")]
    SnapshotFailure {
        batch_index: u64,
        path: String,
        message: String,
    },

    /// A file listed by the staging store had no content.
    #[error("Staged content missing for '{path}'{}", format_rollback_issues(.rollback_issues))]
    MissingStagedContent {
        path: String,
        rollback_issues: Vec<String>,
    },

    /// A write or rename in phases 1-3 failed; the batch was rolled back.
    #[error("Apply failed while {phase} '{path}': {message}{}", format_rollback_issues(.rollback_issues))]
    MutationFailure {
        phase: ApplyPhase,
        path: String,
        message: String,
        rollback_issues: Vec<String>,
    },

    /// Files were installed but the history entry could not be persisted.
    /// The entry stays pending and is retried before the next apply or
    /// revert of the feature.
    #[error(
        "Batch {batch_index} was installed but its history entry could not be recorded: {message}. \
         Snapshot {batch_index} still holds the pre-apply state; recording is retried on the next apply or revert"
    )]
    HistoryNotRecorded { batch_index: u64, message: String },

    /// No snapshot directory exists for this batch.
    #[error("Snapshot {batch_index} not found for feature '{feature}'")]
    SnapshotNotFound { feature: String, batch_index: u64 },

    /// Revert target is not a committed batch.
    #[error("Batch {batch_index} is out of range for feature '{feature}' ({history_len} batches applied)")]
    BatchOutOfRange {
        feature: String,
        batch_index: u64,
        history_len: usize,
    },

    /// Staging store failure.
    #[error("Staging error: {0}")]
    Staging(String),

    /// Feature registry failure.
    #[error("Feature registry error: {0}")]
    Registry(String),

    /// Configuration could not be loaded.
    #[error("Configuration error in {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApplyError {
    /// Rollback problems attached to a failed apply, if any.
    ///
    /// Each line names the paths a user needs for manual recovery.
    pub fn rollback_issues(&self) -> &[String] {
        match self {
            Self::MissingStagedContent {
                rollback_issues, ..
            }
            | Self::MutationFailure {
                rollback_issues, ..
            } => rollback_issues,
            _ => &[],
        }
    }

    pub(crate) fn invalid_path(path: &str, err: FileError) -> Self {
        let reason = match err {
            FileError::InvalidRelativePath { reason, .. } => reason.to_string(),
            other => other.to_string(),
        };
        Self::InvalidPath {
            path: path.to_string(),
            reason,
        }
    }
}

fn format_rollback_issues(issues: &[String]) -> String {
    if issues.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nRollback issues:");
    for issue in issues {
        out.push_str("\n  - ");
        out.push_str(issue);
    }
    out
}

/// Result type for apply operations.
pub type Result<T> = std::result::Result<T, ApplyError>;
