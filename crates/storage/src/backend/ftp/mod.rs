//! FTP storage backend.
//!
//! The control connection is a synchronous `suppaftp` stream; every command
//! runs on tokio's blocking pool with the stream locked for its duration.
//! Streaming readers and writers keep the lock until their transfer is
//! finished. Only connecting has a timeout (30 seconds). A command that has
//! been handed to the blocking pool runs to completion even if the caller
//! stops waiting for it.

#[cfg(test)]
mod test_server;

use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::error::{ConnectStep, Error, ErrorKind, Result};
use crate::models::{FileEntry, Protocol};
use crate::path::{basename, join_relative, normalize, resolve_remote, sanitize};
use crate::{BackendConfig, StorageBackend};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use std::io::{self, Cursor, Read, Write};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use suppaftp::list::File as ListedFile;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const ANONYMOUS: &str = "anonymous";

type FtpResult<T> = std::result::Result<T, FtpError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    /// Empty means anonymous login
    pub username: String,
    pub password: String,
    /// Directory to change into after login; caller paths are resolved below it
    pub path: String,
}
impl FtpConfig {
    pub const DEFAULT_PORT: u16 = 21;
}

/// What a 550 ("requested action not taken") reply to a command means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unavailable {
    /// The target doesn't exist (`RETR`, `SIZE`, `DELE`, `LIST`, `CWD`)
    Missing,
    /// The server refused the change (`MKD`, `RMD`, `STOR`); the reply code
    /// is passed on as-is
    Refused,
}

/// Where to look for a single entry: `SIZE` on the entry itself, then
/// `LIST` on its parent.
struct Lookup {
    name: String,
    remote: String,
    listing_dir: String,
}

struct Session {
    control: Arc<Mutex<FtpStream>>,
    /// Absolute working directory after login (and `CWD`, if configured)
    root: String,
}

pub struct FtpBackend {
    name: String,
    config: FtpConfig,
    connect_timeout: Duration,
    session: Option<Session>,
}
impl FtpBackend {
    pub fn new(name: impl Into<String>, config: FtpConfig) -> Self {
        Self { name: name.into(), config, connect_timeout: CONNECT_TIMEOUT, session: None }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_raise(|| ErrorKind::NotConnected)
    }

    fn remote_path(&self, path: &str) -> Result<String> {
        Ok(resolve_remote(&self.session()?.root, path))
    }

    /// `None` when `path` is the root itself.
    fn lookup(&self, path: &str) -> Result<Option<Lookup>> {
        let mut segments = sanitize(path);
        let Some(name) = segments.pop() else {
            return Ok(None);
        };
        let root = &self.session()?.root;
        Ok(Some(Lookup {
            remote: resolve_remote(root, path),
            listing_dir: resolve_remote(root, &segments.join("/")),
            name,
        }))
    }

    /// Remote directories above `path`, outermost first.
    fn remote_ancestors(&self, path: &str) -> Result<Vec<String>> {
        let root = &self.session()?.root;
        let segments = sanitize(path);
        Ok((1..segments.len())
            .map(|depth| resolve_remote(root, &segments[..depth].join("/")))
            .collect())
    }

    /// Run `command` against the control connection on the blocking pool.
    async fn execute<T, F>(&self, command: F) -> Result<FtpResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> FtpResult<T> + Send + 'static,
    {
        let control = Arc::clone(&self.session()?.control);
        tokio::task::spawn_blocking(move || {
            let mut stream = control.blocking_lock();
            command(&mut *stream)
        })
        .await
        .or_raise(|| ErrorKind::Backend("FTP command task failed".into()))
    }

    /// Like [`execute()`](Self::execute), mapping a failed reply for `path`.
    async fn run<T, F>(&self, path: &str, command: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> FtpResult<T> + Send + 'static,
    {
        self.run_with(path, Unavailable::Missing, command).await
    }

    async fn run_with<T, F>(&self, path: &str, unavailable: Unavailable, command: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> FtpResult<T> + Send + 'static,
    {
        self.execute(command).await?.map_err(|err| reply_error(err, path, unavailable))
    }

    /// Start a transfer that keeps the control connection locked after
    /// returning; `open` runs on the blocking pool and owns the lock.
    async fn open_transfer<T, F>(&self, path: &str, unavailable: Unavailable, open: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(OwnedMutexGuard<FtpStream>) -> FtpResult<T> + Send + 'static,
    {
        let control = Arc::clone(&self.session()?.control).lock_owned().await;
        tokio::task::spawn_blocking(move || open(control))
            .await
            .or_raise(|| ErrorKind::Backend("FTP command task failed".into()))?
            .map_err(|err| reply_error(err, path, unavailable))
    }
}

fn reply_error(err: FtpError, path: &str, unavailable: Unavailable) -> Error {
    let kind = match &err {
        FtpError::UnexpectedResponse(response)
            if matches!(response.status, Status::FileUnavailable) && unavailable == Unavailable::Missing =>
        {
            ErrorKind::NotFound(path.to_string())
        },
        FtpError::UnexpectedResponse(response) => ErrorKind::Status {
            protocol: Protocol::Ftp,
            code: u16::try_from(response.status.code()).unwrap_or_default(),
        },
        FtpError::ConnectionError(_) => ErrorKind::Network(err.to_string()),
        _ => ErrorKind::Backend(err.to_string()),
    };
    exn::Exn::from(err).raise(kind)
}

fn is_unavailable(err: &FtpError) -> bool {
    matches!(err, FtpError::UnexpectedResponse(response) if matches!(response.status, Status::FileUnavailable))
}

/// Create each directory in turn, ignoring failures: most of them will
/// already exist, and there's no reliable way to ask. The command that needs
/// the directories reports the real failure.
fn make_dirs(stream: &mut FtpStream, dirs: &[String]) {
    for dir in dirs {
        if let Err(err) = stream.mkdir(dir) {
            tracing::debug!(dir = %dir, error = %err, "MKD failed, assuming directory exists");
        }
    }
}

fn listed_file(line: &str) -> Option<ListedFile> {
    if line.starts_with("total ") {
        return None;
    }
    match line.parse::<ListedFile>() {
        Ok(file) if file.name() == "." || file.name() == ".." => None,
        Ok(file) => Some(file),
        Err(err) => {
            tracing::warn!(line, error = %err, "skipping unparseable FTP listing line");
            None
        },
    }
}

/// A `RETR` in progress. Holds the control connection until the data
/// connection is drained or dropped, then reads the transfer's final reply.
struct Download<S: Read> {
    control: OwnedMutexGuard<FtpStream>,
    data: Option<S>,
}
impl<S: Read> Download<S> {
    fn finish(&mut self) -> io::Result<()> {
        match self.data.take() {
            Some(data) => self.control.finalize_retr_stream(data).map_err(io::Error::other),
            None => Ok(()),
        }
    }
}
impl<S: Read> Read for Download<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(data) = self.data.as_mut() else {
            return Ok(0);
        };
        let read = data.read(buf)?;
        if read == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(read)
    }
}
impl<S: Read> Drop for Download<S> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!(error = %err, "FTP download ended with an error reply");
        }
    }
}

/// A `STOR` in progress; `flush()` closes the data connection and reads the
/// server's verdict on the upload.
struct Upload<S: Write> {
    control: OwnedMutexGuard<FtpStream>,
    data: Option<S>,
}
impl<S: Write> Upload<S> {
    fn finish(&mut self) -> io::Result<()> {
        let Some(mut data) = self.data.take() else {
            return Ok(());
        };
        let flushed = data.flush();
        let finalized = self.control.finalize_put_stream(data).map_err(io::Error::other);
        flushed.and(finalized)
    }
}
impl<S: Write> Write for Upload<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.data.as_mut() {
            Some(data) => data.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "FTP upload already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.finish()
    }
}
impl<S: Write> Drop for Upload<S> {
    fn drop(&mut self) {
        if self.data.is_some() {
            tracing::warn!("FTP upload dropped without flush, server keeps whatever it received");
        }
        if let Err(err) = self.finish() {
            tracing::warn!(error = %err, "FTP upload ended with an error reply");
        }
    }
}

fn listing_entry(file: &ListedFile, path: &str) -> FileEntry {
    FileEntry::new(file.name(), path, file.size() as u64, OffsetDateTime::from(file.modified()))
        .directory(file.is_directory())
}

/// Dial, log in, switch to binary mode and change into the configured
/// directory. Closes the control connection again if a later step fails.
fn open(config: &FtpConfig, timeout: Duration) -> Result<(FtpStream, String)> {
    let address = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .or_raise(|| ErrorKind::Connection(ConnectStep::Dial))?
        .next()
        .ok_or_raise(|| ErrorKind::Connection(ConnectStep::Dial))?;
    let mut stream =
        FtpStream::connect_timeout(address, timeout).or_raise(|| ErrorKind::Connection(ConnectStep::Dial))?;

    let username = match config.username.as_str() {
        "" => ANONYMOUS,
        username => username,
    };
    let login = stream
        .login(username, config.password.as_str())
        .and_then(|()| stream.transfer_type(FileType::Binary));
    if let Err(err) = login {
        abandon(stream);
        return Err(exn::Exn::from(err).raise(ErrorKind::Connection(ConnectStep::Authenticate)));
    }

    if !config.path.is_empty()
        && let Err(err) = stream.cwd(config.path.as_str())
    {
        abandon(stream);
        return Err(exn::Exn::from(err).raise(ErrorKind::Connection(ConnectStep::ChangeDirectory)));
    }
    let root = stream.pwd().unwrap_or_else(|_| config.path.clone());
    Ok((stream, root))
}

fn abandon(mut stream: FtpStream) {
    if let Err(err) = stream.quit() {
        tracing::warn!(error = %err, "failed to close FTP control connection after failed connect");
    }
}

#[async_trait]
impl StorageBackend for FtpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    fn config(&self) -> BackendConfig {
        BackendConfig::Ftp(self.config.clone())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let (config, timeout) = (self.config.clone(), self.connect_timeout);
        let (stream, root) = tokio::task::spawn_blocking(move || open(&config, timeout))
            .await
            .or_raise(|| ErrorKind::Connection(ConnectStep::Dial))??;
        tracing::info!(backend = %self.name, host = %self.config.host, root = %root, "connected to FTP server");
        self.session = Some(Session { control: Arc::new(Mutex::new(stream)), root });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let quit = tokio::task::spawn_blocking(move || session.control.blocking_lock().quit())
            .await
            .or_raise(|| ErrorKind::Backend("FTP command task failed".into()))?;
        quit.map_err(|err| reply_error(err, "", Unavailable::Missing))?;
        tracing::info!(backend = %self.name, "disconnected from FTP server");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn test_connection(&self) -> Result<()> {
        self.run("", |ftp| ftp.noop()).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let remote = self.remote_path(path)?;
        tracing::debug!(path = %remote, "RETR");
        let buffer = self.run(path, move |ftp| ftp.retr_as_buffer(&remote)).await?;
        Ok(buffer.into_inner())
    }

    async fn reader(&self, path: &str) -> Result<BoxSyncRead> {
        let remote = self.remote_path(path)?;
        tracing::debug!(path = %remote, "RETR (streaming)");
        self.open_transfer(path, Unavailable::Missing, move |mut control| {
            let data = control.retr_as_stream(&remote)?;
            Ok(Box::new(Download { control, data: Some(data) }) as BoxSyncRead)
        })
        .await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let remote = self.remote_path(path)?;
        let ancestors = self.remote_ancestors(path)?;
        let mut data = Cursor::new(data.to_vec());
        tracing::debug!(path = %remote, bytes = data.get_ref().len(), "STOR");
        self.run_with(path, Unavailable::Refused, move |ftp| {
            make_dirs(ftp, &ancestors);
            ftp.put_file(&remote, &mut data).map(|_| ())
        })
        .await
    }

    async fn writer(&self, path: &str) -> Result<BoxSyncWrite> {
        let remote = self.remote_path(path)?;
        let ancestors = self.remote_ancestors(path)?;
        tracing::debug!(path = %remote, "STOR (streaming)");
        self.open_transfer(path, Unavailable::Refused, move |mut control| {
            make_dirs(&mut control, &ancestors);
            let data = control.put_with_stream(&remote)?;
            Ok(Box::new(Upload { control, data: Some(data) }) as BoxSyncWrite)
        })
        .await
    }

    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let Some(target) = self.lookup(path)? else {
            self.run(path, |ftp| ftp.noop()).await?;
            let root = &self.session()?.root;
            return Ok(FileEntry::new(basename(root), "", 0, OffsetDateTime::now_utc()).directory(true));
        };
        let relative = normalize(path);
        let (remote, listing_dir) = (target.remote, target.listing_dir);
        // SIZE answers for plain files; anything else needs the listing.
        let answer = self
            .run(path, move |ftp| match ftp.size(&remote) {
                Ok(size) => Ok(Ok(size)),
                Err(_) => ftp.list(Some(listing_dir.as_str())).map(Err),
            })
            .await?;
        match answer {
            Ok(size) => Ok(FileEntry::new(target.name, relative, size as u64, OffsetDateTime::now_utc())),
            Err(lines) => lines
                .iter()
                .filter_map(|line| listed_file(line))
                .find(|file| file.name() == target.name)
                .map(|file| listing_entry(&file, &relative))
                .ok_or_raise(|| ErrorKind::NotFound(path.to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let Some(Lookup { name, remote, listing_dir }) = self.lookup(path)? else {
            return self.run(path, |ftp| ftp.noop()).await.map(|()| true);
        };
        self.run(path, move |ftp| {
            if ftp.size(&remote).is_ok() {
                return Ok(true);
            }
            match ftp.list(Some(listing_dir.as_str())) {
                Ok(lines) => Ok(lines.iter().filter_map(|line| listed_file(line)).any(|file| file.name() == name)),
                // The parent itself is missing
                Err(err) if is_unavailable(&err) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path)?;
        tracing::debug!(path = %remote, "DELE");
        self.run(path, move |ftp| ftp.rm(&remote)).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.remote_path(from)?;
        let target = self.remote_path(to)?;
        let ancestors = self.remote_ancestors(to)?;
        tracing::debug!(from = %source, to = %target, "copying via download and upload");
        let mut data = self.run(from, move |ftp| ftp.retr_as_buffer(&source)).await?;
        self.run_with(to, Unavailable::Refused, move |ftp| {
            make_dirs(ftp, &ancestors);
            ftp.put_file(&target, &mut data).map(|_| ())
        })
        .await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let remote = self.remote_path(path)?;
        tracing::debug!(path = %remote, "LIST");
        let lines = self
            .run(path, move |ftp| ftp.list((!remote.is_empty()).then_some(remote.as_str())))
            .await?;
        let dir = normalize(path);
        Ok(lines
            .iter()
            .filter_map(|line| listed_file(line))
            .map(|file| listing_entry(&file, &join_relative(&dir, file.name())))
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path)?;
        tracing::debug!(path = %remote, "MKD");
        self.run_with(path, Unavailable::Refused, move |ftp| ftp.mkdir(&remote)).await
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path)?;
        tracing::debug!(path = %remote, "RMD");
        self.run_with(path, Unavailable::Refused, move |ftp| ftp.rmdir(&remote)).await
    }
}
