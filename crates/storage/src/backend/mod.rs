//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the single contract every
//! protocol adapter (local disk, SMB, FTP, NFS, WebDAV) satisfies, so callers
//! can switch storage by changing configuration rather than code.

mod fs;
mod ftp;
mod local;
mod nfs;
mod smb;
mod webdav;

pub use self::ftp::{FtpBackend, FtpConfig};
pub use self::local::{LocalBackend, LocalConfig};
pub use self::nfs::{NfsBackend, NfsConfig};
#[cfg(any(test, feature = "mock"))]
pub use self::smb::memory::{MemoryDialer, MemoryFault};
pub use self::smb::{SmbBackend, SmbConfig, SmbDialer, SmbSession, SmbShare, SmbStat, SmbTransport};
pub use self::webdav::{WebDavBackend, WebDavConfig};
use crate::error::Result;
use crate::models::{FileEntry, Protocol};
use crate::BackendHandle;
use async_trait::async_trait;
use fsbridge_config::StorageDescriptor;
use std::io::{Read, Write};

/// Blocking reader handed out by [`StorageBackend::reader()`].
pub type BoxSyncRead = Box<dyn Read + Send + 'static>;
/// Blocking writer handed out by [`StorageBackend::writer()`].
pub type BoxSyncWrite = Box<dyn Write + Send + 'static>;

/// Typed connection parameters of a backend, one variant per protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Smb(SmbConfig),
    Ftp(FtpConfig),
    Nfs(NfsConfig),
    WebDav(WebDavConfig),
    Local(LocalConfig),
}
impl BackendConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Smb(_) => Protocol::Smb,
            Self::Ftp(_) => Protocol::Ftp,
            Self::Nfs(_) => Protocol::Nfs,
            Self::WebDav(_) => Protocol::WebDav,
            Self::Local(_) => Protocol::Local,
        }
    }
}

/// Unified interface for storage backends.
///
/// Every backend has a two-state lifecycle: it's created disconnected,
/// [`connect()`](Self::connect) either fully establishes the connection or
/// fails and leaves it disconnected, and [`disconnect()`](Self::disconnect)
/// tears it down again. Any file or directory operation attempted while
/// disconnected fails with [`NotConnected`](crate::error::ErrorKind::NotConnected)
/// without touching the backend.
///
/// # Path Handling
/// All paths are relative to the storage root the caller configured, use
/// `/` as the separator, and are sandboxed (see [`crate::path`]) before use.
/// Paths in returned [`FileEntry`] values are caller-relative too.
///
/// # Cancellation
/// Dropping a returned future cancels the operation only as far as the
/// backend allows: WebDAV requests are aborted, FTP commands already handed
/// to the control connection run to completion, and local/NFS file system
/// calls are not interruptible.
///
/// # Concurrency
/// A backend owns its connection exclusively. It's `Sync`, but concurrent
/// operations on one instance get whatever interleaving the backend itself
/// provides; nothing is serialized on the caller's behalf.
///
/// # Examples
///
/// ```no_run
/// use fsbridge_storage::{StorageBackend, error::Result};
///
/// async fn size_of(backend: &mut dyn StorageBackend, path: &str) -> Result<u64> {
///     backend.connect().await?;
///     let size = match backend.exists(path).await? {
///         true => backend.stat(path).await?.size,
///         false => 0,
///     };
///     backend.disconnect().await?;
///     Ok(size)
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (taken from the storage descriptor).
    /// Used for logging only; uniqueness is not enforced.
    fn name(&self) -> &str;

    /// Protocol tag of this backend.
    fn protocol(&self) -> Protocol;

    /// Connection parameters this backend was constructed with.
    fn config(&self) -> BackendConfig;

    /// Establish the connection.
    ///
    /// Returns [`Connection`](crate::error::ErrorKind::Connection) naming the
    /// step that failed; anything opened before that step is closed again.
    /// Calling this on a connected backend does nothing.
    async fn connect(&mut self) -> Result<()>;

    /// Tear the connection down. Disconnecting a disconnected backend does
    /// nothing and never fails.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the connection handles are actually present.
    fn is_connected(&self) -> bool;

    /// Cheap round trip against the live backend.
    async fn test_connection(&self) -> Result<()>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Open a file for streaming reads.
    ///
    /// Returns a `'static` boxed [`Read`] meant to be consumed inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking). The async setup
    /// (opening the file, sending the request, issuing `RETR`) happens
    /// before returning, so a missing file is reported here as
    /// [`NotFound`](crate::error::ErrorKind::NotFound).
    ///
    /// # Notes
    /// - The FTP reader holds the control connection until it reaches the
    ///   end of the file or is dropped; other operations on the same
    ///   backend wait for it.
    /// - The SMB reader fetches the whole file up front.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use fsbridge_storage::{StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut reader = backend.reader("exports/big.csv").await?;
    /// let lines = tokio::task::spawn_blocking(move || {
    ///     let mut text = String::new();
    ///     std::io::Read::read_to_string(&mut reader, &mut text).map(|_| text.lines().count())
    /// })
    /// .await
    /// .unwrap();
    /// # Ok(())
    /// # }
    /// ```
    async fn reader(&self, path: &str) -> Result<BoxSyncRead>;

    /// Create or truncate a file and write `data` to it.
    ///
    /// Local, NFS and FTP backends create missing parent directories first;
    /// SMB and WebDAV require the parent to exist.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Open a file for streaming writes.
    ///
    /// Returns a `'static` boxed [`Write`] meant to be used inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking). Parent directories
    /// are handled as in [`write()`](Self::write).
    ///
    /// # Notes
    /// - Callers must call `flush()` before dropping: FTP and WebDAV finish
    ///   the upload there and report its outcome, and SMB buffers everything
    ///   and only writes to the share on `flush()`. A writer dropped without
    ///   flushing abandons the upload.
    /// - Writing after a successful `flush()` fails for FTP and WebDAV.
    async fn writer(&self, path: &str) -> Result<BoxSyncWrite>;

    /// Metadata of a file or directory.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if nothing
    /// exists at `path`.
    async fn stat(&self, path: &str) -> Result<FileEntry>;

    /// Check whether something exists at `path`. Absence is `Ok(false)`,
    /// never an error.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Copy a file within the same backend, overwriting the destination.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// List one level of a directory.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Create a directory. Local and NFS backends create every missing
    /// ancestor; the others create exactly one level.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Delete a directory. Local and NFS backends delete recursively; the
    /// others require the directory to be empty.
    async fn delete_dir(&self, path: &str) -> Result<()>;
}

/// Pool of connected backends keyed by descriptor.
///
/// Declared so callers can code against it; this crate ships no
/// implementation.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Connected backend for `descriptor`, reusing an idle one if possible.
    async fn get(&self, descriptor: &StorageDescriptor) -> Result<BackendHandle>;

    /// Hand a backend back to the pool.
    async fn release(&self, backend: BackendHandle) -> Result<()>;

    /// Disconnect every pooled backend.
    async fn close_all(&self) -> Result<()>;
}
