//! NFS storage backend.
//!
//! Connecting mounts the export onto a local mount point with the kernel's
//! NFS client (Linux only, and usually requiring privileges); from then on
//! every operation is a local file system operation below the mount point.
//! A mount point that is already mounted is adopted as-is and left mounted
//! on disconnect.

use crate::backend::fs::Tree;
use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::error::{ConnectStep, ErrorKind, Result};
use crate::models::{FileEntry, Protocol};
use crate::{BackendConfig, StorageBackend};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsConfig {
    pub host: String,
    /// Exported path on the server
    pub export: String,
    pub mount_point: PathBuf,
    /// Comma-separated mount options passed to the kernel
    pub options: String,
}
impl NfsConfig {
    /// Mount options used when none are configured.
    pub const DEFAULT_OPTIONS: &str = "vers=3";
}

struct Mount {
    tree: Tree,
    /// Mounted by this backend (as opposed to adopted)
    owned: bool,
}

pub struct NfsBackend {
    name: String,
    config: NfsConfig,
    mount: Option<Mount>,
}
impl NfsBackend {
    /// Create a disconnected backend.
    ///
    /// # Errors
    ///
    /// Returns [`Configuration`](ErrorKind::Configuration) if no mount point
    /// is configured.
    pub fn new(name: impl Into<String>, mut config: NfsConfig) -> Result<Self> {
        if config.mount_point.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Configuration("mount point is required for NFS storage".into()));
        }
        if config.options.is_empty() {
            config.options = NfsConfig::DEFAULT_OPTIONS.to_string();
        }
        Ok(Self { name: name.into(), config, mount: None })
    }

    fn tree(&self) -> Result<&Tree> {
        self.mount.as_ref().map(|mount| &mount.tree).ok_or_raise(|| ErrorKind::NotConnected)
    }

    fn source(&self) -> String {
        format!("{}:{}", self.config.host, self.config.export)
    }
}

#[async_trait]
impl StorageBackend for NfsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::Nfs
    }

    fn config(&self) -> BackendConfig {
        BackendConfig::Nfs(self.config.clone())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.mount.is_some() {
            return Ok(());
        }
        let mount_point = self.config.mount_point.clone();
        if sys::is_mounted(&mount_point).await {
            tracing::info!(backend = %self.name, mount_point = %mount_point.display(), "adopting existing mount");
            self.mount = Some(Mount { tree: Tree::new(mount_point), owned: false });
            return Ok(());
        }

        fs::create_dir_all(&mount_point)
            .await
            .or_raise(|| ErrorKind::Connection(ConnectStep::CreateMountPoint))?;

        let source = self.source();
        let (host, options, target) = (self.config.host.clone(), self.config.options.clone(), mount_point.clone());
        tokio::task::spawn_blocking(move || {
            let options = sys::mount_options(&options, &host)?;
            sys::mount(&source, &target, &options)
        })
        .await
        .or_raise(|| ErrorKind::Connection(ConnectStep::Mount))?
        .or_raise(|| ErrorKind::Connection(ConnectStep::Mount))?;

        tracing::info!(
            backend = %self.name,
            source = %self.source(),
            mount_point = %mount_point.display(),
            "mounted NFS export"
        );
        self.mount = Some(Mount { tree: Tree::new(mount_point), owned: true });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mount) = self.mount.take() else {
            return Ok(());
        };
        if !mount.owned {
            tracing::info!(backend = %self.name, "released adopted mount without unmounting");
            return Ok(());
        }
        let target = mount.tree.root().to_path_buf();
        let unmounted = tokio::task::spawn_blocking(move || sys::unmount(&target))
            .await
            .unwrap_or_else(|join| Err(std::io::Error::other(join)));
        if let Err(err) = unmounted {
            // Still mounted, so still connected: the caller may retry.
            self.mount = Some(mount);
            exn::bail!(ErrorKind::Io(err));
        }
        tracing::info!(backend = %self.name, "unmounted NFS export");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.mount.is_some()
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

/// Whether `/proc/mounts` content lists `mount_point` as a mount target.
/// Whitespace in targets is octal-escaped by the kernel.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn lists_mount_point(mounts: &str, mount_point: &Path) -> bool {
    let wanted = mount_point.to_string_lossy().replace(' ', "\\040").replace('\t', "\\011");
    let wanted = match wanted.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| target == wanted)
}

#[cfg(target_os = "linux")]
mod sys {
    use nix::mount::{MsFlags, mount as mount_fs, umount};
    use std::io;
    use std::net::ToSocketAddrs;
    use std::path::Path;

    const NFS_PORT: u16 = 2049;

    pub(super) async fn is_mounted(mount_point: &Path) -> bool {
        match tokio::fs::read_to_string("/proc/mounts").await {
            Ok(mounts) => super::lists_mount_point(&mounts, mount_point),
            Err(_) => false,
        }
    }

    /// The raw syscall doesn't resolve host names the way `mount.nfs` does,
    /// so the server address has to be passed explicitly.
    pub(super) fn mount_options(options: &str, host: &str) -> io::Result<String> {
        if options.split(',').any(|option| option.starts_with("addr=")) {
            return Ok(options.to_string());
        }
        let address = (host, NFS_PORT)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("could not resolve {host}")))?;
        Ok(match options.is_empty() {
            true => format!("addr={}", address.ip()),
            false => format!("{options},addr={}", address.ip()),
        })
    }

    pub(super) fn mount(source: &str, target: &Path, options: &str) -> io::Result<()> {
        Ok(mount_fs(Some(source), target, Some("nfs"), MsFlags::empty(), Some(options))?)
    }

    pub(super) fn unmount(target: &Path) -> io::Result<()> {
        Ok(umount(target)?)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::path::Path;

    pub(super) async fn is_mounted(_mount_point: &Path) -> bool {
        false
    }

    pub(super) fn mount_options(options: &str, _host: &str) -> io::Result<String> {
        Ok(options.to_string())
    }

    pub(super) fn mount(_source: &str, _target: &Path, _options: &str) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "NFS mounts are only supported on Linux"))
    }

    pub(super) fn unmount(_target: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "NFS mounts are only supported on Linux"))
    }
}
