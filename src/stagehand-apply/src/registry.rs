//! Feature registry interface.
//!
//! The engine only ever records that a feature's batch was applied; the
//! rest of a feature's lifecycle belongs to the orchestration layer.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_utils_file_safety::atomic_write;
use tracing::debug;

use crate::layout::FeatureLayout;
use crate::{ApplyError, Result};

/// Feature status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    /// Not yet applied.
    #[default]
    Draft,
    /// At least one batch was applied.
    Applied,
}

/// Fields a caller may change on a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureUpdate {
    pub status: FeatureStatus,
}

/// Persisted feature record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub feature_id: String,
    pub status: FeatureStatus,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait FeatureRegistry: Send + Sync {
    async fn update_feature(&self, feature: &str, update: FeatureUpdate) -> Result<()>;
}

/// Registry persisted as `<data_dir>/<feature>/feature.json`.
#[derive(Debug, Clone)]
pub struct JsonFeatureRegistry {
    data_dir: PathBuf,
    sync_writes: bool,
}

impl JsonFeatureRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_writes,
        }
    }

    /// Load a feature record, `None` if the feature was never updated.
    pub async fn get(&self, feature: &str) -> Result<Option<FeatureRecord>> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.feature_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FeatureRegistry for JsonFeatureRegistry {
    async fn update_feature(&self, feature: &str, update: FeatureUpdate) -> Result<()> {
        let path = FeatureLayout::new(&self.data_dir, feature)?.feature_path();
        let record = FeatureRecord {
            feature_id: feature.to_string(),
            status: update.status,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        let sync = self.sync_writes;
        tokio::task::spawn_blocking(move || atomic_write(&path, &json, sync))
            .await
            .map_err(|e| ApplyError::Registry(e.to_string()))??;
        debug!(feature, status = ?update.status, "Feature status updated");
        Ok(())
    }
}

/// In-process registry.
#[derive(Debug, Default)]
pub struct MemoryFeatureRegistry {
    statuses: Mutex<HashMap<String, FeatureStatus>>,
}

impl MemoryFeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, feature: &str) -> Option<FeatureStatus> {
        let statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.get(feature).copied()
    }
}

#[async_trait]
impl FeatureRegistry for MemoryFeatureRegistry {
    async fn update_feature(&self, feature: &str, update: FeatureUpdate) -> Result<()> {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.insert(feature.to_string(), update.status);
        Ok(())
    }
}
