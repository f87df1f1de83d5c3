//! Shared fixtures for stagehand-apply integration tests.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stagehand_apply::{
    ApplyConfig, ApplyEngine, FsOps, MemoryFeatureRegistry, MemoryStagingStore, TokioFs,
};
use tempfile::TempDir;

pub const FEATURE: &str = "login-form";

/// One injected failure: the first operation whose paths contain the given
/// fragments fails with `PermissionDenied`, as do all later matches.
#[derive(Debug, Clone)]
enum Fault {
    Write(String),
    Rename { from: String, to: String },
}

/// [`FsOps`] that delegates to the real filesystem except where a fault
/// matches.
#[derive(Debug, Default)]
pub struct FaultyFs {
    inner: TokioFs,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail writes to any path containing `fragment`.
    pub fn fail_write(self, fragment: &str) -> Self {
        self.push(Fault::Write(fragment.to_string()))
    }

    /// Fail renames whose source contains `from` and destination contains `to`.
    pub fn fail_rename(self, from: &str, to: &str) -> Self {
        self.push(Fault::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    fn push(self, fault: Fault) -> Self {
        self.faults.lock().unwrap().push(fault);
        self
    }

    fn check_write(&self, path: &Path) -> io::Result<()> {
        let path = path.to_string_lossy();
        let faults = self.faults.lock().unwrap();
        if faults
            .iter()
            .any(|f| matches!(f, Fault::Write(frag) if path.contains(frag.as_str())))
        {
            return Err(injected());
        }
        Ok(())
    }

    fn check_rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let (from, to) = (from.to_string_lossy(), to.to_string_lossy());
        let faults = self.faults.lock().unwrap();
        let hit = faults.iter().any(|f| match f {
            Fault::Rename { from: f_from, to: f_to } => {
                from.contains(f_from.as_str()) && to.contains(f_to.as_str())
            }
            Fault::Write(_) => false,
        });
        if hit {
            return Err(injected());
        }
        Ok(())
    }
}

fn injected() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "injected failure")
}

#[async_trait]
impl FsOps for FaultyFs {
    async fn write(&self, path: &Path, contents: &[u8], sync: bool) -> io::Result<()> {
        self.check_write(path)?;
        self.inner.write(path, contents, sync).await
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8], sync: bool) -> io::Result<()> {
        self.check_write(path)?;
        self.inner.write_atomic(path, contents, sync).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check_rename(from, to)?;
        self.inner.rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir(path).await
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        self.inner.exists(path).await
    }
}

/// Engine over in-memory staging and registry with temp data and source dirs.
pub struct Harness {
    pub data: TempDir,
    pub source: TempDir,
    pub staging: Arc<MemoryStagingStore>,
    pub registry: Arc<MemoryFeatureRegistry>,
    pub engine: ApplyEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_fs(fs: FaultyFs) -> Self {
        Self::build(Some(Arc::new(fs)))
    }

    fn build(fs: Option<Arc<dyn FsOps>>) -> Self {
        let data = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let staging = Arc::new(MemoryStagingStore::new());
        let registry = Arc::new(MemoryFeatureRegistry::new());
        let config = ApplyConfig::with_data_dir(data.path()).sync_writes(false);
        let mut engine = ApplyEngine::new(config, staging.clone(), registry.clone());
        if let Some(fs) = fs {
            engine = engine.with_fs_ops(fs);
        }
        Self {
            data,
            source,
            staging,
            registry,
            engine,
        }
    }

    /// A second engine over the same directories and collaborators, on the
    /// real filesystem.
    pub fn healthy_engine(&self) -> ApplyEngine {
        ApplyEngine::new(
            ApplyConfig::with_data_dir(self.data.path()).sync_writes(false),
            self.staging.clone(),
            self.registry.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        self.source.path()
    }

    pub fn write_source(&self, rel: &str, content: &str) {
        let path = self.source.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn read_source(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.source.path().join(rel)).ok()
    }

    pub fn stage(&self, rel: &str, content: &str) {
        self.staging.stage(FEATURE, rel, content);
    }

    /// Every entry under the source root (files and directories), relative
    /// and sorted. Directories end with `/`.
    pub fn source_tree(&self) -> Vec<String> {
        list_tree(self.source.path())
    }

    pub fn snapshot_dir(&self, batch_index: u64) -> std::path::PathBuf {
        self.data
            .path()
            .join(FEATURE)
            .join("snapshots")
            .join(batch_index.to_string())
    }
}

pub fn list_tree(root: &Path) -> Vec<String> {
    let mut entries: Vec<String> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            if e.file_type().is_dir() {
                format!("{rel}/")
            } else {
                rel
            }
        })
        .collect();
    entries.sort();
    entries
}
