//! File operations on a directory tree, shared by the local and NFS
//! backends (an NFS export is just a local tree once it's mounted).

use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::error::{ErrorKind, Result};
use crate::models::FileEntry;
use crate::path::{basename, join_relative, normalize, resolve};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;

#[derive(Debug, Clone)]
pub(crate) struct Tree {
    root: PathBuf,
}
impl Tree {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    fn absolute_path(&self, path: &str) -> PathBuf {
        resolve(&self.root, path)
    }

    fn entry(name: &str, path: &str, metadata: &Metadata) -> FileEntry {
        let modified = metadata
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        FileEntry::new(name, path, size, modified)
            .directory(metadata.is_dir())
            .with_mode(Self::mode(metadata))
    }

    #[cfg(unix)]
    fn mode(metadata: &Metadata) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o777
    }

    #[cfg(not(unix))]
    fn mode(_metadata: &Metadata) -> u32 {
        crate::models::DEFAULT_MODE
    }

    async fn create_parent(&self, absolute: &Path, path: &str) -> Result<()> {
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        Ok(())
    }

    pub(crate) async fn check_root(&self) -> Result<()> {
        let metadata = fs::metadata(&self.root)
            .await
            .map_err(|e| ErrorKind::from_io(e, &self.root.display().to_string()))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::InvalidPath(self.root.display().to_string()));
        }
        Ok(())
    }

    pub(crate) async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let absolute = self.absolute_path(path);
        tracing::debug!(path = %absolute.display(), "reading file");
        Ok(fs::read(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    pub(crate) async fn reader(&self, path: &str) -> Result<BoxSyncRead> {
        let absolute = self.absolute_path(path);
        tracing::debug!(path = %absolute.display(), "opening file for reading");
        let file = fs::File::open(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Box::new(file.into_std().await))
    }

    pub(crate) async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let absolute = self.absolute_path(path);
        tracing::debug!(path = %absolute.display(), bytes = data.len(), "writing file");
        self.create_parent(&absolute, path).await?;
        Ok(fs::write(&absolute, data).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    pub(crate) async fn writer(&self, path: &str) -> Result<BoxSyncWrite> {
        let absolute = self.absolute_path(path);
        tracing::debug!(path = %absolute.display(), "opening file for writing");
        self.create_parent(&absolute, path).await?;
        let file = fs::File::create(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Box::new(file.into_std().await))
    }

    pub(crate) async fn stat(&self, path: &str) -> Result<FileEntry> {
        let absolute = self.absolute_path(path);
        let metadata = fs::metadata(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let relative = normalize(path);
        let name = match basename(&relative) {
            "" => absolute.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default(),
            name => name.to_string(),
        };
        Ok(Self::entry(&name, &relative, &metadata))
    }

    pub(crate) async fn exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.absolute_path(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => exn::bail!(ErrorKind::from_io(e, path)),
        }
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        let absolute = self.absolute_path(path);
        tracing::debug!(path = %absolute.display(), "deleting file");
        Ok(fs::remove_file(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    pub(crate) async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.absolute_path(from);
        let target = self.absolute_path(to);
        tracing::debug!(from = %source.display(), to = %target.display(), "copying file");
        if !fs::try_exists(&source).await.map_err(|e| ErrorKind::from_io(e, from))? {
            exn::bail!(ErrorKind::NotFound(from.to_string()));
        }
        self.create_parent(&target, to).await?;
        fs::copy(&source, &target).await.map_err(|e| ErrorKind::from_io(e, to))?;
        Ok(())
    }

    pub(crate) async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let absolute = self.absolute_path(path);
        let mut entries = fs::read_dir(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let dir = normalize(path);
        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, path))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Entries can vanish (or be unreadable) between the listing and
            // the stat; leave those out rather than failing the listing.
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::debug!(name = %name, error = %err, "skipping unreadable directory entry");
                    continue;
                },
            };
            listing.push(Self::entry(&name, &join_relative(&dir, &name), &metadata));
        }
        Ok(listing)
    }

    pub(crate) async fn create_dir(&self, path: &str) -> Result<()> {
        let absolute = self.absolute_path(path);
        Ok(fs::create_dir_all(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    pub(crate) async fn delete_dir(&self, path: &str) -> Result<()> {
        let absolute = self.absolute_path(path);
        tracing::debug!(path = %absolute.display(), "deleting directory tree");
        Ok(fs::remove_dir_all(&absolute).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }
}
