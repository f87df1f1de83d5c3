//! Filesystem seam used for every mutation of the source tree and for
//! history writes.
//!
//! The apply engine never touches the source tree directly; it goes through
//! [`FsOps`] so tests can inject failures at an exact step.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use stagehand_utils_file_safety::atomic_write;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Filesystem primitives the apply engine needs.
#[async_trait]
pub trait FsOps: Send + Sync {
    /// Create or truncate `path` and write `contents`, syncing when asked.
    async fn write(&self, path: &Path, contents: &[u8], sync: bool) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Remove an empty directory.
    async fn remove_dir(&self, path: &Path) -> io::Result<()>;
    /// Whether anything (file, directory, link) exists at `path`.
    async fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Replace `path` with `contents` via temp file and rename. Used for the
    /// engine's own metadata files.
    async fn write_atomic(&self, path: &Path, contents: &[u8], sync: bool) -> io::Result<()> {
        let path = path.to_path_buf();
        let contents = contents.to_vec();
        tokio::task::spawn_blocking(move || atomic_write(&path, &contents, sync))
            .await
            .map_err(io::Error::other)?
    }
}

/// [`FsOps`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFs;

#[async_trait]
impl FsOps for TokioFs {
    async fn write(&self, path: &Path, contents: &[u8], sync: bool) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        if sync {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path).await
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        match fs::symlink_metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(fs: &dyn FsOps, path: &Path) -> io::Result<bool> {
    match fs.remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
