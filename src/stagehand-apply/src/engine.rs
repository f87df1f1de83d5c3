//! Transactional apply of staged files.
//!
//! One call to [`ApplyEngine::apply_batch`] moves everything staged for a
//! feature into the source tree, or nothing:
//!
//! ```text
//! staged -> snapshotting -> writing -> backing-up -> promoting -> committing -> cleaning -> applied
//!                 |            |___________|______________|____________|
//!                 v                        v
//!               failed          rolling-back -> failed
//! ```
//!
//! `committing` persists the batch's history entry as pending while the
//! backups still exist, so failing to record it rolls the batch back. Once
//! the entry is pending, a failed history append leaves it to be retried by
//! the next apply or revert instead of letting batch index N be reused.
//!
//! Every file gets a sibling `<name>.tmp.<applyId>` (phase 1) and, if it
//! already existed, is moved aside to `<name>.bak.<applyId>` (phase 2)
//! before the temp file is renamed into place (phase 3). Renames stay inside
//! one directory, so they never cross a volume.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fs_ops::{remove_if_exists, FsOps, TokioFs};
use crate::history::{HistoryEntry, HistoryLog};
use crate::layout::{normalize_staged_path, resolve, validate_feature_id, PENDING_COMMIT_FILE};
use crate::lock::FeatureLocks;
use crate::registry::{FeatureRegistry, FeatureStatus, FeatureUpdate};
use crate::revert::{RevertCoordinator, RevertOutcome};
use crate::snapshot::{SnapshotInfo, SnapshotStore};
use crate::staging::StagingStore;
use crate::{ApplyConfig, ApplyError, Result};

/// Batch index reported when nothing was staged.
pub const NOOP_BATCH_INDEX: i64 = -1;
/// Message reported when nothing was staged.
pub const NOOP_MESSAGE: &str = "No staged files to apply";

/// Where an apply attempt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyPhase {
    Staged,
    Snapshotting,
    Writing,
    BackingUp,
    Promoting,
    Committing,
    Cleaning,
    Applied,
    RollingBack,
    Failed,
}

impl ApplyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Snapshotting => "snapshotting",
            Self::Writing => "writing",
            Self::BackingUp => "backing-up",
            Self::Promoting => "promoting",
            Self::Committing => "committing",
            Self::Cleaning => "cleaning",
            Self::Applied => "applied",
            Self::RollingBack => "rolling-back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`ApplyEngine::apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// Index of the committed batch, or [`NOOP_BATCH_INDEX`].
    pub batch_index: i64,
    pub files: Vec<String>,
    pub message: String,
}

impl ApplyResult {
    fn noop() -> Self {
        Self {
            batch_index: NOOP_BATCH_INDEX,
            files: Vec::new(),
            message: NOOP_MESSAGE.to_string(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.batch_index == NOOP_BATCH_INDEX
    }
}

/// Rollback ledger for one file within one attempt.
#[derive(Debug, Clone)]
struct Operation {
    /// Key the staging store listed this file under.
    staged_key: String,
    relative_path: String,
    source_path: PathBuf,
    temp_path: PathBuf,
    backup_path: PathBuf,
    had_source: bool,
    backup_created: bool,
    installed: bool,
    /// Directories phase 1 created, deepest first.
    created_dirs: Vec<PathBuf>,
}

impl Operation {
    fn new(source_root: &Path, staged_key: String, relative_path: String, apply_id: &str) -> Self {
        let source_path = resolve(source_root, &relative_path);
        let sibling = |kind: &str| {
            let mut name = source_path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            name.push(format!(".{kind}.{apply_id}"));
            source_path.with_file_name(name)
        };
        let temp_path = sibling("tmp");
        let backup_path = sibling("bak");

        Self {
            staged_key,
            relative_path,
            source_path,
            temp_path,
            backup_path,
            had_source: false,
            backup_created: false,
            installed: false,
            created_dirs: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum FailureKind {
    MissingContent,
    Io(String),
}

/// First failure seen in phases 1-3.
#[derive(Debug)]
struct PhaseFailure {
    phase: ApplyPhase,
    path: String,
    kind: FailureKind,
}

impl PhaseFailure {
    fn io(phase: ApplyPhase, op: &Operation, err: impl fmt::Display) -> Self {
        Self {
            phase,
            path: op.relative_path.clone(),
            kind: FailureKind::Io(err.to_string()),
        }
    }

    fn into_error(self, rollback_issues: Vec<String>) -> ApplyError {
        match self.kind {
            FailureKind::MissingContent => ApplyError::MissingStagedContent {
                path: self.path,
                rollback_issues,
            },
            FailureKind::Io(message) => ApplyError::MutationFailure {
                phase: self.phase,
                path: self.path,
                message,
                rollback_issues,
            },
        }
    }
}

struct WriteOutcome {
    created_dirs: Vec<PathBuf>,
    result: std::result::Result<bool, PhaseFailure>,
}

/// Applies staged batches to a source tree and reverts them.
pub struct ApplyEngine {
    config: ApplyConfig,
    staging: Arc<dyn StagingStore>,
    registry: Arc<dyn FeatureRegistry>,
    history: HistoryLog,
    snapshots: SnapshotStore,
    revert: RevertCoordinator,
    locks: FeatureLocks,
    fs: Arc<dyn FsOps>,
}

impl ApplyEngine {
    pub fn new(
        config: ApplyConfig,
        staging: Arc<dyn StagingStore>,
        registry: Arc<dyn FeatureRegistry>,
    ) -> Self {
        let locks = FeatureLocks::new();
        Self {
            history: HistoryLog::new(&config.data_dir, config.sync_writes),
            snapshots: SnapshotStore::new(&config),
            revert: RevertCoordinator::new(&config, locks.clone()),
            locks,
            staging,
            registry,
            fs: Arc::new(TokioFs),
            config,
        }
    }

    /// Route source-tree mutations and history writes through `fs`.
    pub fn with_fs_ops(mut self, fs: Arc<dyn FsOps>) -> Self {
        self.history = self.history.with_fs_ops(fs.clone());
        self.revert = self.revert.with_fs_ops(fs.clone());
        self.fs = fs;
        self
    }

    /// Share a lock table with other engines in this process.
    pub fn with_locks(mut self, locks: FeatureLocks) -> Self {
        self.revert = RevertCoordinator::new(&self.config, locks.clone()).with_fs_ops(self.fs.clone());
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn revert_coordinator(&self) -> &RevertCoordinator {
        &self.revert
    }

    pub async fn get_history(&self, feature: &str) -> Result<Vec<HistoryEntry>> {
        self.history.get_history(feature).await
    }

    pub async fn list_snapshots(&self, feature: &str) -> Result<Vec<SnapshotInfo>> {
        self.snapshots.list_snapshots(feature).await
    }

    /// Revert the source tree to the state before `batch_index` was applied
    /// and drop that batch and everything after it from history.
    ///
    /// Snapshots are restored newest first down to `batch_index`, so files
    /// only later batches touched are put back too.
    pub async fn revert_to(
        &self,
        feature: &str,
        batch_index: u64,
        source_root: &Path,
    ) -> Result<RevertOutcome> {
        self.revert.revert_to(feature, batch_index, source_root).await
    }

    /// Apply everything staged for `feature` to `source_root` as one batch.
    ///
    /// Returns a no-op result (`batch_index == -1`) when nothing is staged.
    /// On error the source tree, staging and history are as they were
    /// before the call; the error message lists anything rollback could not
    /// put back and must be shown to the user verbatim.
    pub async fn apply_batch(
        &self,
        feature: &str,
        source_root: &Path,
        message: &str,
    ) -> Result<ApplyResult> {
        validate_feature_id(feature)?;
        let _lease = self.locks.acquire(feature).await;
        self.revert.recover_locked(feature).await?;
        self.recover_pending_commit(feature).await?;

        let staged = self.staging.list_staged_files(feature).await?;
        if staged.is_empty() {
            debug!(feature, "Nothing staged, skipping apply");
            return Ok(ApplyResult::noop());
        }
        let staged = normalize_batch(staged)?;

        match tokio::fs::metadata(source_root).await {
            Ok(m) if m.is_dir() => {}
            _ => return Err(ApplyError::SourceRootMissing(source_root.to_path_buf())),
        }

        let batch_index = self.history.read_history(feature).await?.len() as u64;
        let files: Vec<String> = staged.iter().map(|(_, rel)| rel.clone()).collect();

        self.transition(feature, batch_index, ApplyPhase::Snapshotting);
        if let Err(e) = self
            .snapshots
            .take_snapshot(feature, batch_index, &files, source_root)
            .await
        {
            self.transition(feature, batch_index, ApplyPhase::Failed);
            error!(feature, batch_index, error = %e, "Snapshot failed, source tree untouched");
            return Err(e);
        }

        let apply_id = Uuid::new_v4().simple().to_string();
        let mut ops: Vec<Operation> = staged
            .into_iter()
            .map(|(key, rel)| Operation::new(source_root, key, rel, &apply_id))
            .collect();

        if let Err(failure) = self.mutate(feature, batch_index, source_root, &mut ops).await {
            warn!(
                feature,
                batch_index,
                phase = %failure.phase,
                path = %failure.path,
                "Apply failed, rolling back"
            );
            self.transition(feature, batch_index, ApplyPhase::RollingBack);
            let issues = self.rollback(&ops).await;
            self.transition(feature, batch_index, ApplyPhase::Failed);
            if !issues.is_empty() {
                error!(feature, batch_index, issues = issues.len(), "Rollback incomplete");
            }
            return Err(failure.into_error(issues));
        }

        self.transition(feature, batch_index, ApplyPhase::Committing);
        let entry = HistoryEntry {
            batch_index,
            files,
            message: message.to_string(),
            applied_at: Utc::now(),
        };
        if let Err(e) = self.history.write_pending(feature, &entry).await {
            warn!(feature, batch_index, error = %e, "Could not record pending commit, rolling back");
            self.transition(feature, batch_index, ApplyPhase::RollingBack);
            let issues = self.rollback(&ops).await;
            self.transition(feature, batch_index, ApplyPhase::Failed);
            return Err(ApplyError::MutationFailure {
                phase: ApplyPhase::Committing,
                path: PENDING_COMMIT_FILE.to_string(),
                message: e.to_string(),
                rollback_issues: issues,
            });
        }

        self.transition(feature, batch_index, ApplyPhase::Cleaning);
        self.remove_backups(&ops).await;

        self.commit(feature, entry).await
    }

    /// Finish a commit whose history append failed earlier.
    async fn recover_pending_commit(&self, feature: &str) -> Result<()> {
        if self.history.recover_pending(feature).await?.is_some() {
            self.mark_applied(feature).await;
        }
        Ok(())
    }

    async fn mark_applied(&self, feature: &str) {
        if let Err(e) = self
            .registry
            .update_feature(
                feature,
                FeatureUpdate {
                    status: FeatureStatus::Applied,
                },
            )
            .await
        {
            warn!(feature, error = %e, "Failed to update feature status");
        }
    }

    fn transition(&self, feature: &str, batch_index: u64, phase: ApplyPhase) {
        debug!(feature, batch_index, phase = %phase, "Apply phase");
    }

    /// Phases 1-3. Each phase runs concurrently across files and finishes
    /// before the next one starts.
    async fn mutate(
        &self,
        feature: &str,
        batch_index: u64,
        source_root: &Path,
        ops: &mut [Operation],
    ) -> std::result::Result<(), PhaseFailure> {
        self.transition(feature, batch_index, ApplyPhase::Writing);
        let outcomes = join_all(
            ops.iter()
                .map(|op| self.write_temp(feature, source_root, op)),
        )
        .await;
        let mut failure = None;
        for (op, outcome) in ops.iter_mut().zip(outcomes) {
            op.created_dirs = outcome.created_dirs;
            match outcome.result {
                Ok(had_source) => op.had_source = had_source,
                Err(f) => {
                    failure.get_or_insert(f);
                }
            }
        }
        if let Some(f) = failure {
            return Err(f);
        }

        self.transition(feature, batch_index, ApplyPhase::BackingUp);
        let backups = join_all(ops.iter().enumerate().filter(|(_, op)| op.had_source).map(
            |(i, op)| async move { (i, self.fs.rename(&op.source_path, &op.backup_path).await) },
        ))
        .await;
        record(ops, backups, ApplyPhase::BackingUp, |op| op.backup_created = true)?;

        self.transition(feature, batch_index, ApplyPhase::Promoting);
        let promotions = join_all(ops.iter().enumerate().map(|(i, op)| async move {
            (i, self.fs.rename(&op.temp_path, &op.source_path).await)
        }))
        .await;
        record(ops, promotions, ApplyPhase::Promoting, |op| op.installed = true)?;

        Ok(())
    }

    /// Phase 1 for one file: read staged content, create parent directories,
    /// note whether the source exists, write the temp file.
    async fn write_temp(&self, feature: &str, source_root: &Path, op: &Operation) -> WriteOutcome {
        let mut created_dirs = Vec::new();
        let result = async {
            let content = match self.staging.read_staged(feature, &op.staged_key).await {
                Ok(Some(content)) => content,
                Ok(None) => {
                    return Err(PhaseFailure {
                        phase: ApplyPhase::Writing,
                        path: op.relative_path.clone(),
                        kind: FailureKind::MissingContent,
                    })
                }
                Err(e) => return Err(PhaseFailure::io(ApplyPhase::Writing, op, e)),
            };

            if let Some(parent) = op.source_path.parent() {
                let mut dir = Some(parent);
                while let Some(d) = dir {
                    if d == source_root
                        || self
                            .fs
                            .exists(d)
                            .await
                            .map_err(|e| PhaseFailure::io(ApplyPhase::Writing, op, e))?
                    {
                        break;
                    }
                    created_dirs.push(d.to_path_buf());
                    dir = d.parent();
                }
                if !created_dirs.is_empty() {
                    self.fs
                        .create_dir_all(parent)
                        .await
                        .map_err(|e| PhaseFailure::io(ApplyPhase::Writing, op, e))?;
                }
            }

            let had_source = self
                .fs
                .exists(&op.source_path)
                .await
                .map_err(|e| PhaseFailure::io(ApplyPhase::Writing, op, e))?;
            self.fs
                .write(&op.temp_path, &content, self.config.sync_writes)
                .await
                .map_err(|e| PhaseFailure::io(ApplyPhase::Writing, op, e))?;
            debug!(path = %op.relative_path, had_source, "Wrote temp file");
            Ok::<_, PhaseFailure>(had_source)
        }
        .await;

        WriteOutcome {
            created_dirs,
            result,
        }
    }

    /// Undo phases 1-3, newest file first. Returns the problems that need
    /// manual attention.
    async fn rollback(&self, ops: &[Operation]) -> Vec<String> {
        let mut issues = Vec::new();
        let mut stranded_backups = HashSet::new();

        for (i, op) in ops.iter().enumerate().rev() {
            if op.installed {
                if let Err(e) = remove_if_exists(self.fs.as_ref(), &op.source_path).await {
                    issues.push(format!(
                        "could not remove newly installed {}: {e}",
                        op.source_path.display()
                    ));
                }
            }
            if op.backup_created {
                match self.fs.rename(&op.backup_path, &op.source_path).await {
                    Ok(()) => debug!(path = %op.relative_path, "Restored original from backup"),
                    Err(e) => {
                        stranded_backups.insert(i);
                        issues.push(format!(
                            "could not restore {} from backup; original content is preserved at {}: {e}",
                            op.source_path.display(),
                            op.backup_path.display()
                        ));
                    }
                }
            }
        }

        for (i, op) in ops.iter().enumerate() {
            if let Err(e) = remove_if_exists(self.fs.as_ref(), &op.temp_path).await {
                warn!(path = %op.temp_path.display(), error = %e, "Failed to remove temp file");
            }
            if !stranded_backups.contains(&i) {
                if let Err(e) = remove_if_exists(self.fs.as_ref(), &op.backup_path).await {
                    warn!(path = %op.backup_path.display(), error = %e, "Failed to remove backup file");
                }
            }
        }

        let mut dirs: Vec<&PathBuf> = ops.iter().flat_map(|op| op.created_dirs.iter()).collect();
        dirs.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        dirs.dedup();
        for dir in dirs {
            if let Err(e) = self.fs.remove_dir(dir).await {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %dir.display(), error = %e, "Left directory in place");
                }
            }
        }

        issues
    }

    /// Post-success cleanup; failures only leave stray `.bak.` files.
    async fn remove_backups(&self, ops: &[Operation]) {
        let removals = join_all(
            ops.iter()
                .filter(|op| op.backup_created)
                .map(|op| async move { (op, remove_if_exists(self.fs.as_ref(), &op.backup_path).await) }),
        )
        .await;
        for (op, result) in removals {
            if let Err(e) = result {
                warn!(path = %op.backup_path.display(), error = %e, "Failed to remove backup after apply");
            }
        }
    }

    async fn commit(&self, feature: &str, entry: HistoryEntry) -> Result<ApplyResult> {
        let batch_index = entry.batch_index;
        if let Err(e) = self.history.append(feature, entry.clone()).await {
            error!(feature, batch_index, error = %e, "Files installed but history not recorded");
            return Err(ApplyError::HistoryNotRecorded {
                batch_index,
                message: e.to_string(),
            });
        }
        if let Err(e) = self.history.clear_pending(feature).await {
            warn!(feature, error = %e, "Failed to clear pending commit");
        }

        if let Err(e) = self.staging.clear_staging(feature).await {
            warn!(feature, error = %e, "Failed to clear staging after apply");
        }
        self.mark_applied(feature).await;
        if let Some(keep) = self.config.snapshot_retention {
            let history_len = batch_index as usize + 1;
            if let Err(e) = self
                .snapshots
                .prune_snapshots(feature, keep.max(1), history_len)
                .await
            {
                warn!(feature, error = %e, "Failed to prune snapshots");
            }
        }

        self.transition(feature, batch_index, ApplyPhase::Applied);
        info!(feature, batch_index, files = entry.files.len(), "Applied batch");
        Ok(ApplyResult {
            batch_index: batch_index as i64,
            files: entry.files,
            message: entry.message,
        })
    }
}

/// Validate staged paths and collapse duplicates, keeping first-seen order.
fn normalize_batch(staged: Vec<String>) -> Result<Vec<(String, String)>> {
    let mut seen = HashSet::new();
    let mut batch = Vec::with_capacity(staged.len());
    for key in staged {
        let rel = normalize_staged_path(&key)?;
        if seen.insert(rel.clone()) {
            batch.push((key, rel));
        }
    }
    Ok(batch)
}

/// Apply per-file results of a rename phase to the ledger; the first
/// failure in file order wins.
fn record(
    ops: &mut [Operation],
    results: Vec<(usize, io::Result<()>)>,
    phase: ApplyPhase,
    mark: impl Fn(&mut Operation),
) -> std::result::Result<(), PhaseFailure> {
    let mut failure = None;
    for (i, result) in results {
        match result {
            Ok(()) => mark(&mut ops[i]),
            Err(e) => {
                failure.get_or_insert_with(|| PhaseFailure::io(phase, &ops[i], e));
            }
        }
    }
    match failure {
        Some(f) => Err(f),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_paths_are_siblings() {
        let op = Operation::new(
            Path::new("/src"),
            "b/new.ts".to_string(),
            "b/new.ts".to_string(),
            "abc123",
        );
        assert_eq!(op.source_path, Path::new("/src/b/new.ts"));
        assert_eq!(op.temp_path, Path::new("/src/b/new.ts.tmp.abc123"));
        assert_eq!(op.backup_path, Path::new("/src/b/new.ts.bak.abc123"));
    }

    #[test]
    fn test_normalize_batch_dedupes() {
        let batch = normalize_batch(vec![
            "a.ts".to_string(),
            "./a.ts".to_string(),
            "b//c.ts".to_string(),
        ])
        .unwrap();
        assert_eq!(
            batch,
            vec![
                ("a.ts".to_string(), "a.ts".to_string()),
                ("b//c.ts".to_string(), "b/c.ts".to_string()),
            ]
        );
    }

    #[test]
    fn test_normalize_batch_rejects_escape() {
        let result = normalize_batch(vec!["ok.ts".to_string(), "../evil.ts".to_string()]);
        assert!(matches!(result, Err(ApplyError::InvalidPath { .. })));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ApplyPhase::BackingUp.to_string(), "backing-up");
        assert_eq!(ApplyPhase::RollingBack.as_str(), "rolling-back");
    }

    #[test]
    fn test_noop_result() {
        let result = ApplyResult::noop();
        assert!(result.is_noop());
        assert!(result.files.is_empty());
        assert_eq!(result.message, NOOP_MESSAGE);
    }
}
