//! Integration tests for applying staged batches.
//!
//! Covers:
//! - successful batches and their snapshots, history and registry updates
//! - no-op applies
//! - failures injected in each mutation phase, and the rollback after them
//! - concurrent applies of one feature

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{FaultyFs, Harness, FEATURE};
use pretty_assertions::assert_eq;
use stagehand_apply::{
    ApplyConfig, ApplyEngine, ApplyError, ApplyPhase, FeatureStatus, FsStagingStore,
    JsonFeatureRegistry, MemoryFeatureRegistry, StagingStore, NOOP_BATCH_INDEX, NOOP_MESSAGE,
};

// ============================================================================
// SUCCESSFUL APPLY
// ============================================================================

#[tokio::test]
async fn test_mixed_batch_installs_everything() {
    let h = Harness::new();
    h.write_source("a.ts", "A0");
    h.stage("a.ts", "A1");
    h.stage("b/new.ts", "N");

    let result = h
        .engine
        .apply_batch(FEATURE, h.root(), "first batch")
        .await
        .unwrap();

    assert_eq!(result.batch_index, 0);
    assert_eq!(result.files, vec!["a.ts".to_string(), "b/new.ts".to_string()]);
    assert_eq!(result.message, "first batch");
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A1"));
    assert_eq!(h.read_source("b/new.ts").as_deref(), Some("N"));
    assert_eq!(h.source_tree(), vec!["a.ts", "b/", "b/new.ts"]);

    let snapshot = h.snapshot_dir(0);
    assert_eq!(std::fs::read_to_string(snapshot.join("a.ts")).unwrap(), "A0");
    assert!(snapshot.join("b/new.ts.__new__").exists());

    let history = h.engine.get_history(FEATURE).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].batch_index, 0);
    assert_eq!(history[0].files, result.files);
    assert_eq!(history[0].message, "first batch");

    assert_eq!(h.staging.staged_count(FEATURE), 0);
    assert_eq!(h.registry.status(FEATURE), Some(FeatureStatus::Applied));
}

#[tokio::test]
async fn test_nothing_staged_is_noop() {
    let h = Harness::new();
    h.write_source("a.ts", "A0");

    let result = h.engine.apply_batch(FEATURE, h.root(), "msg").await.unwrap();

    assert!(result.is_noop());
    assert_eq!(result.batch_index, NOOP_BATCH_INDEX);
    assert_eq!(result.message, NOOP_MESSAGE);
    assert!(h.engine.get_history(FEATURE).await.unwrap().is_empty());
    assert!(h.engine.list_snapshots(FEATURE).await.unwrap().is_empty());
    assert_eq!(h.registry.status(FEATURE), None);
    assert_eq!(h.source_tree(), vec!["a.ts"]);
}

#[tokio::test]
async fn test_batch_indices_follow_history() {
    let h = Harness::new();

    for i in 0..3 {
        h.stage("a.ts", &format!("v{i}"));
        let result = h
            .engine
            .apply_batch(FEATURE, h.root(), &format!("batch {i}"))
            .await
            .unwrap();
        assert_eq!(result.batch_index, i);
    }

    let indices: Vec<u64> = h
        .engine
        .get_history(FEATURE)
        .await
        .unwrap()
        .iter()
        .map(|e| e.batch_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(h.read_source("a.ts").as_deref(), Some("v2"));

    // Batch 0 created the file, so its snapshot holds a sentinel; later
    // snapshots hold the content the previous batch wrote.
    assert!(h.snapshot_dir(0).join("a.ts.__new__").exists());
    assert_eq!(
        std::fs::read_to_string(h.snapshot_dir(2).join("a.ts")).unwrap(),
        "v1"
    );
}

#[tokio::test]
async fn test_duplicate_staged_paths_collapse() {
    let h = Harness::new();
    h.stage("src/a.ts", "first");
    h.stage("./src/a.ts", "second");

    let result = h.engine.apply_batch(FEATURE, h.root(), "dup").await.unwrap();

    assert_eq!(result.files, vec!["src/a.ts".to_string()]);
    assert_eq!(h.read_source("src/a.ts").as_deref(), Some("first"));
}

// ============================================================================
// REJECTED BEFORE MUTATION
// ============================================================================

#[tokio::test]
async fn test_escaping_path_is_rejected() {
    let h = Harness::new();
    h.stage("ok.ts", "fine");
    h.stage("../outside.ts", "nope");

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::InvalidPath { ref path, .. } if path == "../outside.ts"));
    assert!(h.source_tree().is_empty());
    assert_eq!(h.staging.staged_count(FEATURE), 2);
}

#[tokio::test]
async fn test_invalid_feature_id_is_rejected() {
    let h = Harness::new();
    let err = h
        .engine
        .apply_batch("../other", h.root(), "msg")
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::InvalidFeatureId(..)));
}

#[tokio::test]
async fn test_missing_source_root_is_rejected() {
    let h = Harness::new();
    h.stage("a.ts", "A1");
    let missing = h.root().join("does-not-exist");

    let err = h
        .engine
        .apply_batch(FEATURE, &missing, "msg")
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::SourceRootMissing(_)));
    assert!(!missing.exists());
}

#[tokio::test]
async fn test_directory_at_staged_path_fails_snapshot() {
    let h = Harness::new();
    h.write_source("a.ts", "A0");
    std::fs::create_dir_all(h.root().join("dir.ts")).unwrap();
    h.stage("a.ts", "A1");
    h.stage("dir.ts", "oops");

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::SnapshotFailure { batch_index: 0, .. }));
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A0"));
    assert!(h.engine.get_history(FEATURE).await.unwrap().is_empty());
}

// ============================================================================
// ROLLBACK AFTER INJECTED FAILURES
// ============================================================================

fn seeded(fs: FaultyFs) -> Harness {
    let h = Harness::with_fs(fs);
    h.write_source("a.ts", "A0");
    h.write_source("b.ts", "B0");
    h.stage("a.ts", "A1");
    h.stage("b.ts", "B1");
    h.stage("c/d/new.ts", "N");
    h
}

fn assert_untouched(h: &Harness) {
    assert_eq!(h.source_tree(), vec!["a.ts", "b.ts"]);
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A0"));
    assert_eq!(h.read_source("b.ts").as_deref(), Some("B0"));
    assert_eq!(h.staging.staged_count(FEATURE), 3);
    assert_eq!(h.registry.status(FEATURE), None);
}

#[tokio::test]
async fn test_write_failure_rolls_back() {
    let h = seeded(FaultyFs::new().fail_write("b.ts.tmp."));

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    match &err {
        ApplyError::MutationFailure { phase, path, .. } => {
            assert_eq!(*phase, ApplyPhase::Writing);
            assert_eq!(path, "b.ts");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.rollback_issues().is_empty());
    assert_untouched(&h);
    assert!(h.engine.get_history(FEATURE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backup_failure_rolls_back() {
    let h = seeded(FaultyFs::new().fail_rename("b.ts", ".bak."));

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ApplyError::MutationFailure { phase: ApplyPhase::BackingUp, .. }
    ));
    assert!(err.rollback_issues().is_empty());
    assert_untouched(&h);
}

#[tokio::test]
async fn test_promote_failure_rolls_back() {
    let h = seeded(FaultyFs::new().fail_rename("b.ts.tmp.", "b.ts"));

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ApplyError::MutationFailure { phase: ApplyPhase::Promoting, .. }
    ));
    assert!(err.to_string().starts_with("Apply failed while promoting 'b.ts'"));
    assert_untouched(&h);
    assert!(h.engine.get_history(FEATURE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_attempt_does_not_consume_index() {
    let h = seeded(FaultyFs::new().fail_write("b.ts.tmp."));
    h.engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    // Same staging, healthy filesystem: index 0 is reused.
    let retry = ApplyEngine::new(
        ApplyConfig::with_data_dir(h.data.path()).sync_writes(false),
        h.staging.clone(),
        h.registry.clone(),
    );
    let result = retry.apply_batch(FEATURE, h.root(), "retry").await.unwrap();
    assert_eq!(result.batch_index, 0);
    assert_eq!(h.read_source("c/d/new.ts").as_deref(), Some("N"));
}

#[tokio::test]
async fn test_unrestorable_backup_is_reported_and_kept() {
    let h = Harness::with_fs(
        FaultyFs::new()
            .fail_rename("b.ts.tmp.", "b.ts")
            .fail_rename("a.ts.bak.", "a.ts"),
    );
    h.write_source("a.ts", "A0");
    h.stage("a.ts", "A1");
    h.stage("b.ts", "B1");

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    let issues = err.rollback_issues();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].contains("a.ts.bak."));
    assert!(err.to_string().contains("Rollback issues:"));

    // The original content survives in the backup for manual recovery.
    let backups: Vec<String> = h
        .source_tree()
        .into_iter()
        .filter(|p| p.starts_with("a.ts.bak."))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(h.read_source(&backups[0]).as_deref(), Some("A0"));
    assert_eq!(h.read_source("b.ts"), None);
}

#[tokio::test]
async fn test_pending_commit_write_failure_rolls_back() {
    let h = seeded(FaultyFs::new().fail_write("commit.pending.json"));

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    match &err {
        ApplyError::MutationFailure { phase, path, .. } => {
            assert_eq!(*phase, ApplyPhase::Committing);
            assert_eq!(path, "commit.pending.json");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.rollback_issues().is_empty());
    assert_untouched(&h);
    assert!(h.engine.get_history(FEATURE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unrecorded_batch_keeps_its_snapshot() {
    let h = Harness::with_fs(FaultyFs::new().fail_write("history.json"));
    h.write_source("a.ts", "A0");
    h.stage("a.ts", "A1");

    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "one")
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::HistoryNotRecorded { batch_index: 0, .. }));
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A1"));
    let snapshot_a = h.snapshot_dir(0).join("a.ts");
    assert_eq!(std::fs::read_to_string(&snapshot_a).unwrap(), "A0");

    // Recording still fails, so nothing new may reuse index 0.
    h.stage("b.ts", "B");
    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "two")
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::HistoryNotRecorded { batch_index: 0, .. }));
    assert_eq!(std::fs::read_to_string(&snapshot_a).unwrap(), "A0");
    assert_eq!(h.read_source("b.ts"), None);

    // Once history is writable the pending entry lands first.
    let engine = h.healthy_engine();
    let result = engine.apply_batch(FEATURE, h.root(), "two").await.unwrap();
    assert_eq!(result.batch_index, 1);
    let history = engine.get_history(FEATURE).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].message, "one");
    assert_eq!(history[0].files, vec!["a.ts".to_string()]);
    assert!(!h.data.path().join(FEATURE).join("commit.pending.json").exists());

    engine.revert_to(FEATURE, 0, h.root()).await.unwrap();
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A0"));
    assert_eq!(h.read_source("b.ts"), None);
}

#[tokio::test]
async fn test_unreadable_history_blocks_apply() {
    let h = Harness::new();
    h.write_source("a.ts", "A0");
    h.stage("a.ts", "A1");
    h.engine.apply_batch(FEATURE, h.root(), "one").await.unwrap();

    let history = h.data.path().join(FEATURE).join("history.json");
    std::fs::remove_file(&history).unwrap();
    std::fs::create_dir(&history).unwrap();

    h.stage("a.ts", "A2");
    let err = h
        .engine
        .apply_batch(FEATURE, h.root(), "two")
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Io(_)));
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A1"));
    assert_eq!(
        std::fs::read_to_string(h.snapshot_dir(0).join("a.ts")).unwrap(),
        "A0"
    );
}

/// Lists a file it has no content for.
struct HoleyStaging;

#[async_trait]
impl StagingStore for HoleyStaging {
    async fn list_staged_files(&self, _feature: &str) -> stagehand_apply::Result<Vec<String>> {
        Ok(vec!["a.ts".to_string(), "ghost.ts".to_string()])
    }

    async fn read_staged(
        &self,
        _feature: &str,
        relative_path: &str,
    ) -> stagehand_apply::Result<Option<Vec<u8>>> {
        Ok((relative_path == "a.ts").then(|| b"A1".to_vec()))
    }

    async fn clear_staging(&self, _feature: &str) -> stagehand_apply::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_missing_staged_content_rolls_back() {
    let h = Harness::new();
    h.write_source("a.ts", "A0");
    let engine = ApplyEngine::new(
        ApplyConfig::with_data_dir(h.data.path()).sync_writes(false),
        Arc::new(HoleyStaging),
        Arc::new(MemoryFeatureRegistry::new()),
    );

    let err = engine
        .apply_batch(FEATURE, h.root(), "msg")
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::MissingStagedContent { ref path, .. } if path == "ghost.ts"));
    assert_eq!(h.source_tree(), vec!["a.ts"]);
    assert_eq!(h.read_source("a.ts").as_deref(), Some("A0"));
}

// ============================================================================
// CONCURRENCY AND PERSISTENT COLLABORATORS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies_get_distinct_indices() {
    let h = Harness::new();
    let engine = Arc::new(h.engine);
    let staging = h.staging.clone();
    let root = h.source.path().to_path_buf();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let staging = staging.clone();
        let root = root.clone();
        tasks.push(tokio::spawn(async move {
            staging.stage(FEATURE, &format!("file{i}.ts"), format!("{i}"));
            engine
                .apply_batch(FEATURE, &root, &format!("task {i}"))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let history = engine.get_history(FEATURE).await.unwrap();
    let indices: Vec<u64> = history.iter().map(|e| e.batch_index).collect();
    let expected: Vec<u64> = (0..history.len() as u64).collect();
    assert_eq!(indices, expected);

    // Each file was staged once, so no two batches may claim it.
    let mut files: Vec<String> = history.iter().flat_map(|e| e.files.clone()).collect();
    let total = files.len();
    files.sort();
    files.dedup();
    assert_eq!(files.len(), total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_features_apply_independently() {
    let h = Harness::new();
    for feature in ["alpha", "beta", "gamma"] {
        h.staging
            .stage(feature, &format!("{feature}.ts"), feature.as_bytes().to_vec());
    }

    let root = h.root();
    let results = futures::future::join_all(
        ["alpha", "beta", "gamma"]
            .into_iter()
            .map(|feature| h.engine.apply_batch(feature, root, feature)),
    )
    .await;

    for result in results {
        assert_eq!(result.unwrap().batch_index, 0);
    }
    assert_eq!(h.source_tree(), vec!["alpha.ts", "beta.ts", "gamma.ts"]);
}

#[tokio::test]
async fn test_file_backed_collaborators() {
    let data = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let config = ApplyConfig::with_data_dir(data.path())
        .sync_writes(true)
        .snapshot_retention(Some(2));
    let staging = Arc::new(FsStagingStore::new(data.path()));
    let registry = Arc::new(JsonFeatureRegistry::new(data.path(), true));
    let engine = ApplyEngine::new(config, staging.clone(), registry.clone());

    for i in 0..3 {
        staging
            .stage(FEATURE, "src/app.ts", format!("v{i}").as_bytes())
            .await
            .unwrap();
        engine
            .apply_batch(FEATURE, source.path(), &format!("batch {i}"))
            .await
            .unwrap();
    }

    assert_eq!(
        std::fs::read_to_string(source.path().join("src/app.ts")).unwrap(),
        "v2"
    );
    assert!(staging.list_staged_files(FEATURE).await.unwrap().is_empty());

    let record = registry.get(FEATURE).await.unwrap().unwrap();
    assert_eq!(record.status, FeatureStatus::Applied);

    let kept: Vec<u64> = engine
        .list_snapshots(FEATURE)
        .await
        .unwrap()
        .iter()
        .map(|s| s.batch_index)
        .collect();
    assert_eq!(kept, vec![1, 2]);
    assert_eq!(engine.get_history(FEATURE).await.unwrap().len(), 3);
}
