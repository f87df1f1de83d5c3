//! Transactional apply, snapshot, history and revert of staged edits.
//!
//! A feature's proposed file contents sit in a staging area. Applying them
//! installs every file into the source tree or none, records a snapshot of
//! the overwritten state, and appends a history entry. Any committed batch
//! can later be reverted, restoring the tree to how it was before that
//! batch.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use stagehand_apply::{ApplyConfig, ApplyEngine, FsStagingStore, JsonFeatureRegistry};
//!
//! # async fn run() -> stagehand_apply::Result<()> {
//! let config = ApplyConfig::with_data_dir("/var/lib/stagehand");
//! let staging = Arc::new(FsStagingStore::new(&config.data_dir));
//! let registry = Arc::new(JsonFeatureRegistry::new(&config.data_dir, config.sync_writes));
//! let engine = ApplyEngine::new(config, staging.clone(), registry);
//!
//! staging.stage("login-form", "src/login.ts", b"export {}").await?;
//! let applied = engine.apply_batch("login-form", Path::new("/repo"), "Add login form").await?;
//! engine.revert_to("login-form", applied.batch_index as u64, Path::new("/repo")).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod fs_ops;
pub mod history;
pub mod layout;
pub mod lock;
pub mod registry;
pub mod revert;
pub mod snapshot;
pub mod staging;

pub use config::ApplyConfig;
pub use engine::{ApplyEngine, ApplyPhase, ApplyResult, NOOP_BATCH_INDEX, NOOP_MESSAGE};
pub use error::{ApplyError, Result};
pub use fs_ops::{FsOps, TokioFs};
pub use history::{HistoryEntry, HistoryLog};
pub use layout::FeatureLayout;
pub use lock::{FeatureGuard, FeatureLocks};
pub use registry::{
    FeatureRecord, FeatureRegistry, FeatureStatus, FeatureUpdate, JsonFeatureRegistry,
    MemoryFeatureRegistry,
};
pub use revert::{RevertCoordinator, RevertJournal, RevertOutcome};
pub use snapshot::{SnapshotInfo, SnapshotStore};
pub use staging::{FsStagingStore, MemoryStagingStore, StagingStore};
