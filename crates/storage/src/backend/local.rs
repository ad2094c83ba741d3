//! Local filesystem storage backend.
//!
//! Files live below a configured base directory and are accessed with
//! `tokio::fs`. Those calls run on tokio's blocking pool and can't be
//! interrupted once started.

use crate::backend::fs::Tree;
use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::error::{ConnectStep, ErrorKind, Result};
use crate::models::{FileEntry, Protocol};
use crate::{BackendConfig, StorageBackend};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Directory every caller path is resolved below
    pub base_path: PathBuf,
}

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use fsbridge_storage::StorageBackend;
/// use fsbridge_storage::backend::{LocalBackend, LocalConfig};
///
/// # async fn example() -> fsbridge_storage::error::Result<()> {
/// let mut backend = LocalBackend::new("scratch", LocalConfig { base_path: "/srv/files".into() });
/// backend.connect().await?;
/// backend.write("reports/today.txt", b"all good").await?;
/// # Ok(())
/// # }
/// ```
pub struct LocalBackend {
    name: String,
    config: LocalConfig,
    /// Present only once the base path has been verified
    tree: Option<Tree>,
}
impl LocalBackend {
    /// Create a disconnected backend. Nothing is checked until
    /// [`connect()`](StorageBackend::connect).
    pub fn new(name: impl Into<String>, config: LocalConfig) -> Self {
        Self { name: name.into(), config, tree: None }
    }

    fn tree(&self) -> Result<&Tree> {
        self.tree.as_ref().ok_or_raise(|| ErrorKind::NotConnected)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::Local
    }

    fn config(&self) -> BackendConfig {
        BackendConfig::Local(self.config.clone())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.tree.is_some() {
            return Ok(());
        }
        let base = &self.config.base_path;
        let metadata = fs::metadata(base)
            .await
            .or_raise(|| ErrorKind::Connection(ConnectStep::StatBasePath))?;
        if !metadata.is_dir() {
            let cause = exn::Exn::from(ErrorKind::InvalidPath(base.display().to_string()));
            return Err(cause.raise(ErrorKind::Connection(ConnectStep::StatBasePath)));
        }
        tracing::info!(backend = %self.name, path = %base.display(), "connected to local storage");
        self.tree = Some(Tree::new(base.clone()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.tree.take().is_some() {
            tracing::info!(backend = %self.name, "disconnected from local storage");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.tree.is_some()
    }

    async fn test_connection(&self) -> Result<()> {
        self.tree()?.check_root().await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.tree()?.read(path).await
    }

    async fn reader(&self, path: &str) -> Result<BoxSyncRead> {
        self.tree()?.reader(path).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.tree()?.write(path, data).await
    }

    async fn writer(&self, path: &str) -> Result<BoxSyncWrite> {
        self.tree()?.writer(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        self.tree()?.stat(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.tree()?.exists(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.tree()?.delete(path).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.tree()?.copy(from, to).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.tree()?.list(path).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.tree()?.create_dir(path).await
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        self.tree()?.delete_dir(path).await
    }
}
