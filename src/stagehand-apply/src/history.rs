//! Append-only per-feature record of committed batches.

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fs_ops::{remove_if_exists, FsOps, TokioFs};
use crate::layout::FeatureLayout;
use crate::{ApplyError, Result};

/// One committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub batch_index: u64,
    pub files: Vec<String>,
    pub message: String,
    pub applied_at: DateTime<Utc>,
}

/// `history.json` reader/writer.
///
/// Absent or corrupt history is treated as empty. Any other read failure is
/// an error, since the history length allocates the next batch index. Writes
/// replace the whole file through a temp file and rename, so a crash
/// mid-write leaves the previous list intact.
///
/// An installed batch is first recorded in `commit.pending.json`. If the
/// append that follows fails, [`HistoryLog::recover_pending`] finishes it
/// before the feature is touched again.
#[derive(Clone)]
pub struct HistoryLog {
    data_dir: PathBuf,
    sync_writes: bool,
    fs: Arc<dyn FsOps>,
}

impl fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryLog")
            .field("data_dir", &self.data_dir)
            .field("sync_writes", &self.sync_writes)
            .finish_non_exhaustive()
    }
}

impl HistoryLog {
    pub fn new(data_dir: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes,
            fs: Arc::new(TokioFs),
        }
    }

    /// Route writes through `fs`.
    pub fn with_fs_ops(mut self, fs: Arc<dyn FsOps>) -> Self {
        self.fs = fs;
        self
    }

    pub async fn read_history(&self, feature: &str) -> Result<Vec<HistoryEntry>> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.history_path();
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&json) {
            Ok(history) => Ok(history),
            Err(e) => {
                warn!(feature, path = %path.display(), error = %e, "Corrupt history, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    pub async fn write_history(&self, feature: &str, history: &[HistoryEntry]) -> Result<()> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.history_path();
        let json = serde_json::to_vec_pretty(history)?;
        self.fs.write_atomic(&path, &json, self.sync_writes).await?;
        debug!(feature, entries = history.len(), "History written");
        Ok(())
    }

    /// Public read accessor.
    pub async fn get_history(&self, feature: &str) -> Result<Vec<HistoryEntry>> {
        self.read_history(feature).await
    }

    /// Append one entry, returning the new length.
    pub async fn append(&self, feature: &str, entry: HistoryEntry) -> Result<usize> {
        let mut history = self.read_history(feature).await?;
        history.push(entry);
        self.write_history(feature, &history).await?;
        Ok(history.len())
    }

    /// Drop the last `count` entries (clamped), returning how many remain.
    pub async fn remove_last_history_entries(&self, feature: &str, count: usize) -> Result<usize> {
        let history = self.read_history(feature).await?;
        let keep = history.len().saturating_sub(count);
        self.truncate_to(feature, keep).await
    }

    /// Keep at most the first `len` entries, returning how many remain.
    ///
    /// Expressed as a target length so replaying it is idempotent.
    pub async fn truncate_to(&self, feature: &str, len: usize) -> Result<usize> {
        let mut history = self.read_history(feature).await?;
        if history.len() > len {
            history.truncate(len);
            self.write_history(feature, &history).await?;
        }
        Ok(history.len())
    }

    /// Persist `entry` as installed but not yet appended.
    pub async fn write_pending(&self, feature: &str, entry: &HistoryEntry) -> Result<()> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.pending_commit_path();
        let json = serde_json::to_vec_pretty(entry)?;
        self.fs.write_atomic(&path, &json, self.sync_writes).await?;
        Ok(())
    }

    pub async fn read_pending(&self, feature: &str) -> Result<Option<HistoryEntry>> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.pending_commit_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(feature, path = %path.display(), error = %e, "Discarding unreadable pending commit");
                self.clear_pending(feature).await?;
                Ok(None)
            }
        }
    }

    pub async fn clear_pending(&self, feature: &str) -> Result<()> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.pending_commit_path();
        remove_if_exists(self.fs.as_ref(), &path).await?;
        Ok(())
    }

    /// Append a pending entry left by an earlier apply, if any.
    ///
    /// Returns the entry when it was appended now. An entry already present
    /// in history (crash between append and cleanup) is just cleared. If the
    /// append fails again the record stays and the error is
    /// [`ApplyError::HistoryNotRecorded`].
    pub async fn recover_pending(&self, feature: &str) -> Result<Option<HistoryEntry>> {
        let Some(entry) = self.read_pending(feature).await? else {
            return Ok(None);
        };
        let len = self.read_history(feature).await?.len() as u64;

        let appended = match len.cmp(&entry.batch_index) {
            Ordering::Equal => {
                self.append(feature, entry.clone())
                    .await
                    .map_err(|e| ApplyError::HistoryNotRecorded {
                        batch_index: entry.batch_index,
                        message: e.to_string(),
                    })?;
                info!(feature, batch_index = entry.batch_index, "Recorded previously installed batch");
                Some(entry)
            }
            Ordering::Greater => None,
            Ordering::Less => {
                warn!(
                    feature,
                    batch_index = entry.batch_index,
                    history_len = len,
                    "Pending commit does not follow history, discarding"
                );
                None
            }
        };
        self.clear_pending(feature).await?;
        Ok(appended)
    }
}
