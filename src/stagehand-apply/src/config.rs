//! Apply engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stagehand_utils_file_safety::MAX_FILE_SIZE;

use crate::{ApplyError, Result};

/// Environment variable that overrides [`ApplyConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "STAGEHAND_DATA_DIR";

/// Configuration for the apply engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Root directory holding one subdirectory per feature.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Whether temp files, snapshot copies and metadata are fsynced.
    #[serde(default = "default_true")]
    pub sync_writes: bool,
    /// Keep only this many snapshots per feature after each successful apply.
    #[serde(default)]
    pub snapshot_retention: Option<usize>,
    /// Largest source file copied into a snapshot (bytes, 0 = unlimited).
    #[serde(default = "default_max_snapshot_file_size")]
    pub max_snapshot_file_size: u64,
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("stagehand"))
        .unwrap_or_else(|| PathBuf::from(".stagehand"))
}

fn default_max_snapshot_file_size() -> u64 {
    MAX_FILE_SIZE
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_writes: true,
            snapshot_retention: None,
            max_snapshot_file_size: default_max_snapshot_file_size(),
        }
    }
}

impl ApplyConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    pub fn snapshot_retention(mut self, keep: Option<usize>) -> Self {
        self.snapshot_retention = keep;
        self
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ApplyError::Config {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ApplyError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ApplyError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(config.with_env_overrides())
    }

    /// Apply `STAGEHAND_DATA_DIR` if it is set.
    pub fn with_env_overrides(self) -> Self {
        self.override_data_dir(std::env::var(DATA_DIR_ENV).ok())
    }

    fn override_data_dir(mut self, value: Option<String>) -> Self {
        if let Some(dir) = value.filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }
}
