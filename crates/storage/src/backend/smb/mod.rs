//! SMB storage backend.
//!
//! An SMB connection is three nested handles: a transport (the TCP
//! connection to the server), a session on it (after authenticating), and a
//! mounted share on that session. Each layer is a trait so the wire client
//! can be swapped out: [`SmbBackend::new()`] uses the `pavao` client when the
//! `smb` feature is enabled, and [`SmbBackend::with_dialer()`] accepts any
//! other [`SmbDialer`].

#[cfg(any(test, feature = "mock"))]
pub mod memory;
#[cfg(feature = "smb")]
mod native;

use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::error::{ConnectStep, Error, ErrorKind, Result};
use crate::models::{DEFAULT_MODE, FileEntry, Protocol};
use crate::path::{join_relative, normalize, parent, resolve_remote};
use crate::{BackendConfig, StorageBackend};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::time::SystemTime;
use time::OffsetDateTime;
use tokio::runtime::Handle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbConfig {
    pub host: String,
    pub port: u16,
    pub share: String,
    pub username: String,
    pub password: String,
    pub domain: String,
}
impl SmbConfig {
    pub const DEFAULT_PORT: u16 = 445;
    pub const DEFAULT_DOMAIN: &str = "WORKGROUP";
}

/// Metadata of a file or directory on a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbStat {
    pub name: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_directory: bool,
    /// Permission bits, if the server reports any
    pub mode: Option<u32>,
}

/// Opens transports to SMB servers.
#[async_trait]
pub trait SmbDialer: Send + Sync {
    async fn dial(&self, config: &SmbConfig) -> io::Result<Box<dyn SmbTransport>>;
}

/// A connection to an SMB server.
#[async_trait]
pub trait SmbTransport: Send + Sync {
    async fn authenticate(&mut self, config: &SmbConfig) -> io::Result<Box<dyn SmbSession>>;
    async fn close(&mut self) -> io::Result<()>;
}

/// An authenticated session on a transport.
#[async_trait]
pub trait SmbSession: Send + Sync {
    async fn mount(&mut self, share: &str) -> io::Result<Box<dyn SmbShare>>;
    async fn logoff(&mut self) -> io::Result<()>;
}

/// A mounted share. Paths are absolute within the share (`/dir/file`).
///
/// Once unmounted, every operation fails with
/// [`NotConnected`](io::ErrorKind::NotConnected).
#[async_trait]
pub trait SmbShare: Send + Sync {
    async fn read(&self, path: &str) -> io::Result<Vec<u8>>;
    /// Create or truncate; the parent directory must exist.
    async fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;
    async fn stat(&self, path: &str) -> io::Result<SmbStat>;
    async fn read_dir(&self, path: &str) -> io::Result<Vec<SmbStat>>;
    async fn mkdir(&self, path: &str) -> io::Result<()>;
    async fn remove_file(&self, path: &str) -> io::Result<()>;
    /// Remove an empty directory.
    async fn remove_dir(&self, path: &str) -> io::Result<()>;
    async fn unmount(&self) -> io::Result<()>;
}

/// Dialer used when the crate is built without an SMB client.
#[cfg(not(feature = "smb"))]
struct Unavailable;

#[cfg(not(feature = "smb"))]
#[async_trait]
impl SmbDialer for Unavailable {
    async fn dial(&self, _config: &SmbConfig) -> io::Result<Box<dyn SmbTransport>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "built without SMB support (enable the `smb` feature)"))
    }
}

fn default_dialer() -> Arc<dyn SmbDialer> {
    #[cfg(feature = "smb")]
    return Arc::new(native::NativeDialer);
    #[cfg(not(feature = "smb"))]
    Arc::new(Unavailable)
}

pub struct SmbBackend {
    name: String,
    config: SmbConfig,
    dialer: Arc<dyn SmbDialer>,
    transport: Option<Box<dyn SmbTransport>>,
    session: Option<Box<dyn SmbSession>>,
    share: Option<Arc<dyn SmbShare>>,
}
impl SmbBackend {
    pub fn new(name: impl Into<String>, config: SmbConfig) -> Self {
        Self::with_dialer(name, config, default_dialer())
    }

    pub fn with_dialer(name: impl Into<String>, config: SmbConfig, dialer: Arc<dyn SmbDialer>) -> Self {
        Self { name: name.into(), config, dialer, transport: None, session: None, share: None }
    }

    fn share(&self) -> Result<&Arc<dyn SmbShare>> {
        self.share.as_ref().ok_or_raise(|| ErrorKind::NotConnected)
    }

    fn entry(stat: SmbStat, path: &str) -> FileEntry {
        let modified = stat.modified.map(OffsetDateTime::from).unwrap_or_else(OffsetDateTime::now_utc);
        FileEntry::new(stat.name, path, stat.size, modified)
            .directory(stat.is_directory)
            .with_mode(stat.mode.unwrap_or(DEFAULT_MODE))
    }
}

fn share_path(path: &str) -> String {
    resolve_remote("/", path)
}

fn io_error(err: io::Error, path: &str) -> Error {
    let kind = ErrorKind::from_io(err, path);
    exn::Exn::from(kind)
}

/// Collects a streamed upload in memory and writes it to the share on
/// `flush()`; SMB layers only take whole files.
struct BufferedUpload {
    share: Arc<dyn SmbShare>,
    path: String,
    buffer: Vec<u8>,
    /// Whether the share is behind the buffer (true until the first flush,
    /// so flushing an empty upload still creates the file)
    pending: bool,
    runtime: Handle,
}
impl Write for BufferedUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.pending = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending {
            return Ok(());
        }
        self.runtime.block_on(self.share.write(&self.path, &self.buffer))?;
        self.pending = false;
        Ok(())
    }
}
impl Drop for BufferedUpload {
    fn drop(&mut self) {
        if self.pending {
            tracing::warn!(path = %self.path, bytes = self.buffer.len(), "SMB upload dropped without flush, nothing written");
        }
    }
}

#[async_trait]
impl StorageBackend for SmbBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::Smb
    }

    fn config(&self) -> BackendConfig {
        BackendConfig::Smb(self.config.clone())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.share.is_some() {
            return Ok(());
        }
        let mut transport = self
            .dialer
            .dial(&self.config)
            .await
            .or_raise(|| ErrorKind::Connection(ConnectStep::Dial))?;

        let mut session = match transport.authenticate(&self.config).await {
            Ok(session) => session,
            Err(err) => {
                if let Err(close) = transport.close().await {
                    tracing::warn!(backend = %self.name, error = %close, "failed to close SMB transport");
                }
                return Err(exn::Exn::from(err).raise(ErrorKind::Connection(ConnectStep::Authenticate)));
            },
        };

        let share = match session.mount(&self.config.share).await {
            Ok(share) => share,
            Err(err) => {
                if let Err(logoff) = session.logoff().await {
                    tracing::warn!(backend = %self.name, error = %logoff, "failed to log off SMB session");
                }
                if let Err(close) = transport.close().await {
                    tracing::warn!(backend = %self.name, error = %close, "failed to close SMB transport");
                }
                return Err(exn::Exn::from(err).raise(ErrorKind::Connection(ConnectStep::MountShare)));
            },
        };

        tracing::info!(
            backend = %self.name,
            host = %self.config.host,
            share = %self.config.share,
            "connected to SMB share"
        );
        self.transport = Some(transport);
        self.session = Some(session);
        self.share = Some(Arc::from(share));
        Ok(())
    }

    /// Every layer is torn down even if an inner one fails; the handles are
    /// gone afterwards either way.
    async fn disconnect(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        if let Some(share) = self.share.take()
            && let Err(err) = share.unmount().await
        {
            failures.push(format!("unmount share: {err}"));
        }
        if let Some(mut session) = self.session.take()
            && let Err(err) = session.logoff().await
        {
            failures.push(format!("log off session: {err}"));
        }
        if let Some(mut transport) = self.transport.take()
            && let Err(err) = transport.close().await
        {
            failures.push(format!("close transport: {err}"));
        }
        if !failures.is_empty() {
            tracing::warn!(backend = %self.name, failures = ?failures, "SMB teardown incomplete");
            exn::bail!(ErrorKind::Teardown(failures));
        }
        tracing::info!(backend = %self.name, "disconnected from SMB share");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.share.is_some()
    }

    async fn test_connection(&self) -> Result<()> {
        self.share()?.stat("/").await.map_err(|err| io_error(err, ""))?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let share = self.share()?;
        share.read(&share_path(path)).await.map_err(|err| io_error(err, path))
    }

    async fn reader(&self, path: &str) -> Result<BoxSyncRead> {
        Ok(Box::new(Cursor::new(self.read(path).await?)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let share = self.share()?;
        tracing::debug!(path = %share_path(path), bytes = data.len(), "writing file to share");
        share.write(&share_path(path), data).await.map_err(|err| io_error(err, path))
    }

    /// Checks that the parent directory exists; the data itself only
    /// reaches the share on `flush()`.
    async fn writer(&self, path: &str) -> Result<BoxSyncWrite> {
        let share = Arc::clone(self.share()?);
        let target = share_path(path);
        let folder = share.stat(parent(&target)).await.map_err(|err| io_error(err, parent(path)))?;
        if !folder.is_directory {
            exn::bail!(ErrorKind::InvalidPath(parent(path).to_string()));
        }
        Ok(Box::new(BufferedUpload {
            share,
            path: target,
            buffer: Vec::new(),
            pending: true,
            runtime: Handle::current(),
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let stat = self.share()?.stat(&share_path(path)).await.map_err(|err| io_error(err, path))?;
        Ok(Self::entry(stat, &normalize(path)))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.share()?.stat(&share_path(path)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(err, path)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let share = self.share()?;
        share.remove_file(&share_path(path)).await.map_err(|err| io_error(err, path))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let share = self.share()?;
        let data = share.read(&share_path(from)).await.map_err(|err| io_error(err, from))?;
        share.write(&share_path(to), &data).await.map_err(|err| io_error(err, to))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let stats = self.share()?.read_dir(&share_path(path)).await.map_err(|err| io_error(err, path))?;
        let dir = normalize(path);
        Ok(stats
            .into_iter()
            .filter(|stat| stat.name != "." && stat.name != "..")
            .map(|stat| {
                let entry_path = join_relative(&dir, &stat.name);
                Self::entry(stat, &entry_path)
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let share = self.share()?;
        share.mkdir(&share_path(path)).await.map_err(|err| io_error(err, path))
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        let share = self.share()?;
        share.remove_dir(&share_path(path)).await.map_err(|err| io_error(err, path))
    }
}
