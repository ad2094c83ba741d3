//! SMB client layers backed by `pavao` (libsmbclient).
//!
//! `pavao` keeps a single libsmbclient context per process: a second client
//! would silently reuse the first one's credentials, and dropping either
//! frees the context under the other. This module therefore allows one live
//! native connection at a time; dialing while another is open fails with
//! [`ResourceBusy`](io::ErrorKind::ResourceBusy).
//!
//! The layers map onto libsmbclient as follows:
//! - dial claims the process slot and opens a TCP connection to the server;
//! - authenticate creates the client and lists the server's shares, which
//!   forces libsmbclient to log in;
//! - mount stats the share root through that client.
//!
//! Every client call is blocking, runs on tokio's blocking pool, and holds
//! the client's lock for its duration.

use super::{SmbConfig, SmbDialer, SmbSession, SmbShare, SmbStat, SmbTransport};
use crate::path::join_relative;
use async_trait::async_trait;
use pavao::{SmbClient, SmbCredentials, SmbDirentType, SmbError, SmbMode, SmbOpenOptions, SmbOptions};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

static CLIENT_SLOT: Slot = Slot::new();

/// A process-wide "one at a time" flag.
struct Slot(AtomicBool);
impl Slot {
    const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn claim(&'static self) -> io::Result<Claim> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Claim(self))
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    "an SMB connection is already open; libsmbclient allows one per process",
                )
            })
    }
}

/// Held for as long as anything refers to the native client.
struct Claim(&'static Slot);
impl Drop for Claim {
    fn drop(&mut self) {
        self.0.0.store(false, Ordering::Release);
    }
}

/// The client plus the claim that makes it the only one. Field order
/// matters: the client (and libsmbclient's context) goes first.
struct Client {
    inner: Mutex<SmbClient>,
    _claim: Arc<Claim>,
}
impl Client {
    async fn call<T, F>(self: &Arc<Self>, call: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SmbClient) -> io::Result<T> + Send + 'static,
    {
        let client = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let inner = client.inner.lock().unwrap_or_else(PoisonError::into_inner);
            call(&inner)
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn to_io(err: SmbError) -> io::Error {
    let message = match err {
        // libsmbclient reports failures through errno
        SmbError::Io(err) => return err,
        other => other.to_string(),
    };
    let lower = message.to_ascii_lowercase();
    let kind = if lower.contains("no such file") || lower.contains("not found") {
        io::ErrorKind::NotFound
    } else if lower.contains("permission denied") || lower.contains("access denied") {
        io::ErrorKind::PermissionDenied
    } else if lower.contains("not empty") {
        io::ErrorKind::DirectoryNotEmpty
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, message)
}

fn released(layer: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("SMB {layer} already released"))
}

pub(super) struct NativeDialer;

#[async_trait]
impl SmbDialer for NativeDialer {
    async fn dial(&self, config: &SmbConfig) -> io::Result<Box<dyn SmbTransport>> {
        let claim = Arc::new(CLIENT_SLOT.claim()?);
        let socket = TcpStream::connect((config.host.as_str(), config.port)).await?;
        Ok(Box::new(NativeTransport {
            server: format!("smb://{}:{}", config.host, config.port),
            socket: Some(socket),
            claim: Some(claim),
        }))
    }
}

struct NativeTransport {
    server: String,
    socket: Option<TcpStream>,
    claim: Option<Arc<Claim>>,
}

#[async_trait]
impl SmbTransport for NativeTransport {
    async fn authenticate(&mut self, config: &SmbConfig) -> io::Result<Box<dyn SmbSession>> {
        let claim = self.claim.clone().ok_or_else(|| released("transport"))?;
        let credentials = SmbCredentials::default()
            .server(self.server.as_str())
            .username(config.username.as_str())
            .password(config.password.as_str())
            .workgroup(config.domain.as_str());
        let client = tokio::task::spawn_blocking(move || {
            let client = SmbClient::new(credentials, SmbOptions::default().one_share_per_server(true)).map_err(to_io)?;
            // Share enumeration needs a logged-in session
            client.list_dir("").map_err(to_io)?;
            Ok::<_, io::Error>(client)
        })
        .await
        .map_err(io::Error::other)??;
        let client = Arc::new(Client { inner: Mutex::new(client), _claim: claim });
        Ok(Box::new(NativeSession { client: Some(client) }))
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut socket = self.socket.take().ok_or_else(|| released("transport"))?;
        self.claim = None;
        socket.shutdown().await
    }
}

struct NativeSession {
    client: Option<Arc<Client>>,
}

#[async_trait]
impl SmbSession for NativeSession {
    async fn mount(&mut self, share: &str) -> io::Result<Box<dyn SmbShare>> {
        let client = self.client.clone().ok_or_else(|| released("session"))?;
        let root = share.trim_matches('/').to_string();
        if root.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no share name configured"));
        }
        let share_root = root.clone();
        client.call(move |client| client.stat(&share_root).map(|_| ()).map_err(to_io)).await?;
        Ok(Box::new(NativeShare { root, client: Mutex::new(Some(client)) }))
    }

    async fn logoff(&mut self) -> io::Result<()> {
        self.client.take().map(drop).ok_or_else(|| released("session"))
    }
}

struct NativeShare {
    /// Share name; client paths are `{root}/{path}` relative to the server
    root: String,
    client: Mutex<Option<Arc<Client>>>,
}
impl NativeShare {
    async fn blocking<T, F>(&self, path: &str, call: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SmbClient, String) -> io::Result<T> + Send + 'static,
    {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| released("share"))?;
        let remote = format!("{}{path}", self.root);
        client.call(move |client| call(client, remote)).await
    }
}

fn stat_of(client: &SmbClient, path: &str, name: String) -> io::Result<SmbStat> {
    let stat = client.stat(path).map_err(to_io)?;
    // libsmbclient's stat mode carries no file type; a directory is whatever
    // can be listed.
    let is_directory = client.list_dir(path).is_ok();
    Ok(SmbStat {
        name,
        size: if is_directory { 0 } else { stat.size },
        modified: Some(stat.modified),
        is_directory,
        mode: Some(u32::from(stat.mode) & 0o777),
    })
}

#[async_trait]
impl SmbShare for NativeShare {
    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.blocking(path, |client, remote| {
            let mut file = client.open_with(&remote, SmbOpenOptions::default().read(true)).map_err(to_io)?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Ok(data)
        })
        .await
    }

    async fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let data = data.to_vec();
        self.blocking(path, move |client, remote| {
            let options = SmbOpenOptions::default().create(true).write(true).truncate(true);
            let mut file = client.open_with(&remote, options).map_err(to_io)?;
            file.write_all(&data)?;
            file.flush()
        })
        .await
    }

    async fn stat(&self, path: &str) -> io::Result<SmbStat> {
        let name = crate::path::basename(path).to_string();
        self.blocking(path, move |client, remote| stat_of(client, &remote, name)).await
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<SmbStat>> {
        self.blocking(path, |client, remote| {
            let entries = client.list_dir(&remote).map_err(to_io)?;
            Ok(entries
                .iter()
                .filter(|entry| matches!(entry.get_type(), SmbDirentType::File | SmbDirentType::Dir))
                .filter_map(|entry| {
                    let child = join_relative(&remote, entry.name());
                    match stat_of(client, &child, entry.name().to_string()) {
                        Ok(stat) => Some(stat),
                        Err(err) => {
                            tracing::debug!(path = %child, error = %err, "skipping unreadable share entry");
                            None
                        },
                    }
                })
                .collect())
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> io::Result<()> {
        self.blocking(path, |client, remote| client.mkdir(&remote, SmbMode::from(0o755)).map_err(to_io)).await
    }

    async fn remove_file(&self, path: &str) -> io::Result<()> {
        self.blocking(path, |client, remote| client.unlink(&remote).map_err(to_io)).await
    }

    async fn remove_dir(&self, path: &str) -> io::Result<()> {
        self.blocking(path, |client, remote| client.rmdir(&remote).map_err(to_io)).await
    }

    async fn unmount(&self) -> io::Result<()> {
        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        client.map(drop).ok_or_else(|| released("share"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allows_one_claim_at_a_time() {
        static SLOT: Slot = Slot::new();
        let claim = SLOT.claim().unwrap();
        let err = SLOT.claim().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ResourceBusy);
        drop(claim);
        let shared = Arc::new(SLOT.claim().unwrap());
        let other = Arc::clone(&shared);
        drop(shared);
        assert!(SLOT.claim().is_err());
        drop(other);
        assert!(SLOT.claim().is_ok());
    }

    #[test]
    fn test_to_io_keeps_errno_kind() {
        let err = to_io(SmbError::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = to_io(SmbError::Io(io::Error::from_raw_os_error(2)));
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(to_io(SmbError::BadValue).kind(), io::ErrorKind::Other);
    }

    /// Dialing claims the process slot before touching the network, so a
    /// second dial is refused even when the server is unreachable.
    #[tokio::test]
    async fn test_second_dial_is_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = SmbConfig {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
            share: "share".into(),
            username: String::new(),
            password: String::new(),
            domain: SmbConfig::DEFAULT_DOMAIN.into(),
        };
        let mut first = NativeDialer.dial(&config).await.unwrap();
        let err = NativeDialer.dial(&config).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ResourceBusy);

        first.close().await.unwrap();
        assert_eq!(first.close().await.unwrap_err().kind(), io::ErrorKind::NotConnected);
        let mut second = NativeDialer.dial(&config).await.unwrap();
        second.close().await.unwrap();
    }
}
