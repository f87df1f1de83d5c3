//! Staging store interface and implementations.
//!
//! Staged files are proposed content not yet written to the live tree. The
//! apply engine only lists and reads them, and clears a feature's staging
//! area after a successful apply.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use stagehand_utils_file_safety::{atomic_write, is_atomic_temp_name, relative_string};
use tokio::fs;
use tracing::debug;

use crate::layout::{normalize_staged_path, resolve, FeatureLayout};
use crate::{ApplyError, Result};

/// Source of proposed file content for a feature.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Relative paths of all staged files, in staging order.
    async fn list_staged_files(&self, feature: &str) -> Result<Vec<String>>;
    /// Content of one staged file, or `None` if it has none.
    async fn read_staged(&self, feature: &str, relative_path: &str) -> Result<Option<Vec<u8>>>;
    /// Drop everything staged for the feature.
    async fn clear_staging(&self, feature: &str) -> Result<()>;
}

/// Staging area persisted under `<data_dir>/<feature>/staging/`.
#[derive(Debug, Clone)]
pub struct FsStagingStore {
    data_dir: PathBuf,
}

impl FsStagingStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Stage `content` for `relative_path`, replacing earlier content.
    pub async fn stage(&self, feature: &str, relative_path: &str, content: &[u8]) -> Result<()> {
        let layout = FeatureLayout::new(&self.data_dir, feature)?;
        let normalized = normalize_staged_path(relative_path)?;
        let path = resolve(&layout.staging_dir(), &normalized);
        let content = content.to_vec();
        tokio::task::spawn_blocking(move || atomic_write(&path, &content, false))
            .await
            .map_err(|e| ApplyError::Staging(e.to_string()))??;
        debug!(feature, path = %normalized, "Staged file");
        Ok(())
    }

    fn staging_dir(&self, feature: &str) -> Result<PathBuf> {
        Ok(FeatureLayout::new(&self.data_dir, feature)?.staging_dir())
    }
}

fn walk_staging(dir: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Leftovers of an interrupted atomic write are not staged content.
        if is_atomic_temp_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        if let Some(rel) = relative_string(dir, entry.path()) {
            files.push(rel);
        }
    }
    Ok(files)
}

#[async_trait]
impl StagingStore for FsStagingStore {
    async fn list_staged_files(&self, feature: &str) -> Result<Vec<String>> {
        let dir = self.staging_dir(feature)?;
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let files = tokio::task::spawn_blocking(move || walk_staging(&dir))
            .await
            .map_err(|e| ApplyError::Staging(e.to_string()))??;
        Ok(files)
    }

    async fn read_staged(&self, feature: &str, relative_path: &str) -> Result<Option<Vec<u8>>> {
        let normalized = normalize_staged_path(relative_path)?;
        let path = resolve(&self.staging_dir(feature)?, &normalized);
        match fs::read(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_staging(&self, feature: &str) -> Result<()> {
        let dir = self.staging_dir(feature)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(feature, "Cleared staging");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process staging store, ordered by first insertion.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    features: Mutex<HashMap<String, IndexMap<String, Vec<u8>>>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, feature: &str, relative_path: &str, content: impl Into<Vec<u8>>) {
        let mut features = self.features.lock().unwrap_or_else(|e| e.into_inner());
        features
            .entry(feature.to_string())
            .or_default()
            .insert(relative_path.to_string(), content.into());
    }

    pub fn staged_count(&self, feature: &str) -> usize {
        let features = self.features.lock().unwrap_or_else(|e| e.into_inner());
        features.get(feature).map(|f| f.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn list_staged_files(&self, feature: &str) -> Result<Vec<String>> {
        let features = self.features.lock().unwrap_or_else(|e| e.into_inner());
        Ok(features
            .get(feature)
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_staged(&self, feature: &str, relative_path: &str) -> Result<Option<Vec<u8>>> {
        let features = self.features.lock().unwrap_or_else(|e| e.into_inner());
        Ok(features
            .get(feature)
            .and_then(|f| f.get(relative_path))
            .cloned())
    }

    async fn clear_staging(&self, feature: &str) -> Result<()> {
        let mut features = self.features.lock().unwrap_or_else(|e| e.into_inner());
        features.remove(feature);
        Ok(())
    }
}
