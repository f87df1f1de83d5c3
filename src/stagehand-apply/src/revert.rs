//! Reverting to a snapshot.
//!
//! Reverting to batch N restores snapshots `history_len - 1` down to N, so a
//! file first touched by a later batch is returned to its state before that
//! batch, and snapshot N decides last.
//!
//! A revert restores files and truncates history, two separate writes. The
//! intent is written to `revert.journal.json` first and removed last, so an
//! interrupted revert is finished by the next revert or apply of that
//! feature (or an explicit [`RevertCoordinator::recover_pending_revert`]).
//! Both steps are idempotent, which makes replaying a journal safe.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_utils_file_safety::atomic_write;
use tracing::{debug, info, warn};

use crate::fs_ops::FsOps;
use crate::history::HistoryLog;
use crate::layout::{validate_feature_id, FeatureLayout};
use crate::lock::FeatureLocks;
use crate::snapshot::SnapshotStore;
use crate::{ApplyConfig, ApplyError, Result};

/// Persisted revert intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertJournal {
    pub batch_index: u64,
    /// History length once the revert completes; equals `batch_index`.
    pub target_history_len: usize,
    /// History length when the revert started. Snapshots
    /// `batch_index..history_len` are restored newest first.
    pub history_len: usize,
    pub source_root: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertOutcome {
    pub batch_index: u64,
    pub restored_files: Vec<String>,
    pub removed_entries: usize,
    /// Completed from a journal left by an interrupted revert.
    pub recovered: bool,
}

#[derive(Debug, Clone)]
pub struct RevertCoordinator {
    data_dir: PathBuf,
    sync_writes: bool,
    snapshots: SnapshotStore,
    history: HistoryLog,
    locks: FeatureLocks,
}

impl RevertCoordinator {
    pub fn new(config: &ApplyConfig, locks: FeatureLocks) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            sync_writes: config.sync_writes,
            snapshots: SnapshotStore::new(config),
            history: HistoryLog::new(&config.data_dir, config.sync_writes),
            locks,
        }
    }

    pub fn with_fs_ops(mut self, fs: Arc<dyn FsOps>) -> Self {
        self.history = self.history.with_fs_ops(fs);
        self
    }

    /// Restore snapshots `history_len - 1` down to `batch_index` into
    /// `source_root` and drop history entries `batch_index..`.
    ///
    /// Snapshot directories are kept, so the reverted indices are reused by
    /// the next applies.
    pub async fn revert_to(
        &self,
        feature: &str,
        batch_index: u64,
        source_root: &Path,
    ) -> Result<RevertOutcome> {
        validate_feature_id(feature)?;
        let _lease = self.locks.acquire(feature).await;
        self.recover_locked(feature).await?;
        self.history.recover_pending(feature).await?;

        let history_len = self.history.read_history(feature).await?.len();
        let target_history_len = usize::try_from(batch_index)
            .ok()
            .filter(|n| *n < history_len)
            .ok_or_else(|| ApplyError::BatchOutOfRange {
                feature: feature.to_string(),
                batch_index,
                history_len,
            })?;
        for index in batch_index..history_len as u64 {
            if !self.snapshots.has_snapshot(feature, index).await? {
                return Err(ApplyError::SnapshotNotFound {
                    feature: feature.to_string(),
                    batch_index: index,
                });
            }
        }

        let journal = RevertJournal {
            batch_index,
            target_history_len,
            history_len,
            source_root: source_root.to_path_buf(),
            started_at: Utc::now(),
        };
        self.write_journal(feature, &journal).await?;
        self.execute(feature, &journal, false).await
    }

    /// Finish a revert interrupted by a crash, if one is pending.
    pub async fn recover_pending_revert(&self, feature: &str) -> Result<Option<RevertOutcome>> {
        validate_feature_id(feature)?;
        let _lease = self.locks.acquire(feature).await;
        self.recover_locked(feature).await
    }

    /// Same as [`Self::recover_pending_revert`] for callers already holding
    /// the feature lease.
    pub(crate) async fn recover_locked(&self, feature: &str) -> Result<Option<RevertOutcome>> {
        let Some(journal) = self.read_journal(feature).await? else {
            return Ok(None);
        };
        warn!(
            feature,
            batch_index = journal.batch_index,
            started_at = %journal.started_at,
            "Completing interrupted revert"
        );
        self.execute(feature, &journal, true).await.map(Some)
    }

    pub async fn pending_journal(&self, feature: &str) -> Result<Option<RevertJournal>> {
        self.read_journal(feature).await
    }

    async fn execute(
        &self,
        feature: &str,
        journal: &RevertJournal,
        recovered: bool,
    ) -> Result<RevertOutcome> {
        let mut restored_files = Vec::new();
        for index in (journal.batch_index..journal.history_len as u64).rev() {
            let restored = self
                .snapshots
                .restore_snapshot(feature, index, &journal.source_root)
                .await?;
            debug!(feature, batch_index = index, files = restored.len(), "Restored snapshot");
            restored_files.extend(restored);
        }
        restored_files.sort();
        restored_files.dedup();

        let before = self.history.read_history(feature).await?.len();
        let remaining = self
            .history
            .truncate_to(feature, journal.target_history_len)
            .await?;
        self.clear_journal(feature).await?;

        let removed_entries = before.saturating_sub(remaining);
        info!(
            feature,
            batch_index = journal.batch_index,
            files = restored_files.len(),
            removed_entries,
            recovered,
            "Reverted to snapshot"
        );
        Ok(RevertOutcome {
            batch_index: journal.batch_index,
            restored_files,
            removed_entries,
            recovered,
        })
    }

    async fn read_journal(&self, feature: &str) -> Result<Option<RevertJournal>> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.journal_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(journal) => Ok(Some(journal)),
            Err(e) => {
                warn!(feature, path = %path.display(), error = %e, "Discarding unreadable revert journal");
                self.clear_journal(feature).await?;
                Ok(None)
            }
        }
    }

    async fn write_journal(&self, feature: &str, journal: &RevertJournal) -> Result<()> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.journal_path();
        let json = serde_json::to_vec_pretty(journal)?;
        let sync = self.sync_writes;
        tokio::task::spawn_blocking(move || atomic_write(&path, &json, sync))
            .await
            .map_err(|e| ApplyError::Io(io::Error::other(e)))??;
        debug!(feature, batch_index = journal.batch_index, "Revert journal written");
        Ok(())
    }

    async fn clear_journal(&self, feature: &str) -> Result<()> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.journal_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
