//! Per-batch undo log.
//!
//! Before batch N touches the source tree, every file it will write is
//! copied to `snapshots/N/<path>`. Files that do not exist yet get an empty
//! `<path>.__new__` sentinel instead, so restoring the snapshot deletes them.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_utils_file_safety::{ensure_regular_file, relative_string};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::layout::{resolve, FeatureLayout, SENTINEL_SUFFIX};
use crate::{ApplyConfig, ApplyError, Result};

/// A revert point on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub batch_index: u64,
    /// Every path the batch touched, sorted.
    pub files: Vec<String>,
    /// The subset of `files` that did not exist before the batch.
    pub new_files: Vec<String>,
    /// Snapshot directory mtime.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    relative_path: String,
    stored_at: PathBuf,
    existed: bool,
}

/// Reads and writes snapshot directories.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data_dir: PathBuf,
    sync_writes: bool,
    max_file_size: u64,
}

impl SnapshotStore {
    pub fn new(config: &ApplyConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            sync_writes: config.sync_writes,
            max_file_size: config.max_snapshot_file_size,
        }
    }

    /// Record the current state of `files` (normalized relative paths) as
    /// batch `batch_index`.
    ///
    /// Any failure aborts the apply before the source tree is touched. A
    /// stale directory left at this index by an earlier failed attempt or a
    /// revert is replaced.
    pub async fn take_snapshot(
        &self,
        feature: &str,
        batch_index: u64,
        files: &[String],
        source_root: &Path,
    ) -> Result<()> {
        let dir = FeatureLayout::new(&self.data_dir, feature)?.snapshot_dir(batch_index);
        let fail = |path: &str, message: String| ApplyError::SnapshotFailure {
            batch_index,
            path: path.to_string(),
            message,
        };

        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(feature, batch_index, "Replaced stale snapshot directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(fail(".", e.to_string())),
        }
        fs::create_dir_all(&dir).await.map_err(|e| fail(".", e.to_string()))?;

        let mut created = 0usize;
        for rel in files {
            let source = resolve(source_root, rel);
            let existed = self
                .snapshot_file(&dir, rel, &source)
                .await
                .map_err(|e| fail(rel, e.to_string()))?;
            if !existed {
                created += 1;
            }
        }

        if self.sync_writes {
            sync_dir(&dir).await;
        }

        debug!(
            feature,
            batch_index,
            files = files.len(),
            new_files = created,
            "Snapshot taken"
        );
        Ok(())
    }

    /// Returns whether the source existed.
    async fn snapshot_file(
        &self,
        dir: &Path,
        rel: &str,
        source: &Path,
    ) -> std::result::Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let metadata = match fs::metadata(source).await {
            Ok(m) => Some(m),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match metadata {
            Some(metadata) => {
                ensure_regular_file(source, &metadata, self.max_file_size)?;
                let dest = resolve(dir, rel);
                create_parent(&dest).await?;
                fs::copy(source, &dest).await?;
                if self.sync_writes {
                    fs::File::open(&dest).await?.sync_all().await?;
                }
                Ok(true)
            }
            None => {
                let marker = resolve(dir, &format!("{rel}{SENTINEL_SUFFIX}"));
                create_parent(&marker).await?;
                let mut file = fs::File::create(&marker).await?;
                file.flush().await?;
                if self.sync_writes {
                    file.sync_all().await?;
                }
                Ok(false)
            }
        }
    }

    pub async fn has_snapshot(&self, feature: &str, batch_index: u64) -> Result<bool> {
        let dir = FeatureLayout::new(&self.data_dir, feature)?.snapshot_dir(batch_index);
        Ok(fs::try_exists(&dir).await?)
    }

    /// Put the source tree back to the state recorded for `batch_index`.
    ///
    /// Sentinel entries delete their file (already gone is fine); regular
    /// entries overwrite it. Safe to run any number of times. Returns the
    /// affected relative paths, sorted.
    pub async fn restore_snapshot(
        &self,
        feature: &str,
        batch_index: u64,
        source_root: &Path,
    ) -> Result<Vec<String>> {
        let dir = FeatureLayout::new(&self.data_dir, feature)?.snapshot_dir(batch_index);
        if !fs::try_exists(&dir).await? {
            return Err(ApplyError::SnapshotNotFound {
                feature: feature.to_string(),
                batch_index,
            });
        }

        let entries = collect_entries(dir).await?;
        let mut restored = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = resolve(source_root, &entry.relative_path);
            if entry.existed {
                create_parent(&target).await?;
                fs::copy(&entry.stored_at, &target).await?;
                debug!(path = %entry.relative_path, "Restored file from snapshot");
            } else {
                match fs::remove_file(&target).await {
                    Ok(()) => debug!(path = %entry.relative_path, "Removed file created by batch"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            restored.push(entry.relative_path);
        }
        restored.sort();
        restored.dedup();

        info!(
            feature,
            batch_index,
            files = restored.len(),
            "Restored snapshot"
        );
        Ok(restored)
    }

    /// All revert points of a feature, ascending by batch index.
    pub async fn list_snapshots(&self, feature: &str) -> Result<Vec<SnapshotInfo>> {
        let root = FeatureLayout::new(&self.data_dir, feature)?.snapshots_dir();
        let mut snapshots = Vec::new();

        let mut dirs = match fs::read_dir(&root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir) = dirs.next_entry().await? {
            let Some(batch_index) = dir.file_name().to_str().and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            let metadata = dir.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            let entries = collect_entries(dir.path()).await?;
            let mut files: Vec<String> = entries.iter().map(|e| e.relative_path.clone()).collect();
            let mut new_files: Vec<String> = entries
                .into_iter()
                .filter(|e| !e.existed)
                .map(|e| e.relative_path)
                .collect();
            files.sort();
            new_files.sort();

            snapshots.push(SnapshotInfo {
                batch_index,
                files,
                new_files,
                created_at,
            });
        }

        snapshots.sort_by_key(|s| s.batch_index);
        Ok(snapshots)
    }

    /// Delete snapshots left behind by reverted batches (index `>=
    /// history_len`), then all but the newest `keep_latest` of the rest.
    /// Returns how many were removed.
    pub async fn prune_snapshots(
        &self,
        feature: &str,
        keep_latest: usize,
        history_len: usize,
    ) -> Result<usize> {
        let layout = FeatureLayout::new(&self.data_dir, feature)?;
        let (live, stale): (Vec<_>, Vec<_>) = self
            .list_snapshots(feature)
            .await?
            .into_iter()
            .partition(|s| s.batch_index < history_len as u64);

        let excess = live.len().saturating_sub(keep_latest);
        let doomed = stale.iter().chain(&live[..excess]);
        let mut removed = 0;
        for snapshot in doomed {
            fs::remove_dir_all(layout.snapshot_dir(snapshot.batch_index)).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(feature, removed, stale = stale.len(), kept = live.len() - excess, "Pruned snapshots");
        }
        Ok(removed)
    }
}

async fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

async fn collect_entries(dir: PathBuf) -> Result<Vec<SnapshotEntry>> {
    tokio::task::spawn_blocking(move || walk_snapshot(&dir))
        .await
        .map_err(|e| ApplyError::Io(io::Error::other(e)))?
}

fn walk_snapshot(dir: &Path) -> Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_string(dir, entry.path()) else {
            continue;
        };
        let (relative_path, existed) = match rel.strip_suffix(SENTINEL_SUFFIX) {
            Some(stripped) => (stripped.to_string(), false),
            None => (rel, true),
        };
        entries.push(SnapshotEntry {
            relative_path,
            stored_at: entry.into_path(),
            existed,
        });
    }
    Ok(entries)
}
