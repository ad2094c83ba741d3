//! WebDAV storage backend.
//!
//! Every operation is a single HTTP request through `reqwest`; dropping an
//! operation's future aborts its request. Listings are depth-1 PROPFIND
//! requests parsed by [`multistatus`]. Streaming reads bridge the response
//! body to a blocking reader; streaming writes feed the body of a PUT that
//! runs on the runtime while the caller writes.
//!
//! The 30 second client timeout covers a whole request, body included, so
//! it also bounds how long a streamed transfer may take.

mod multistatus;
#[cfg(test)]
mod test_server;

use crate::backend::{BoxSyncRead, BoxSyncWrite};
use crate::error::{ConnectStep, Error, ErrorKind, Result};
use crate::models::{FileEntry, Protocol};
use crate::path::{basename, join_relative, normalize, resolve_url};
use crate::{BackendConfig, StorageBackend};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, LAST_MODIFIED};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode, Url};
use std::io::{self, Write};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Chunks a streamed upload may queue ahead of the request
const UPLOAD_BUFFER: usize = 8;
const DIRECTORY_CONTENT_TYPE: &str = "httpd/unix-directory";
const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:displayname/>
    <D:getcontentlength/>
    <D:getlastmodified/>
    <D:resourcetype/>
  </D:prop>
</D:propfind>"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebDavConfig {
    pub url: String,
    /// Empty means no authentication
    pub username: String,
    pub password: String,
    /// Replaces the URL's path when set (and not `/`)
    pub path: String,
}

pub struct WebDavBackend {
    name: String,
    config: WebDavConfig,
    /// Storage root: the configured URL with the path override applied
    base: Url,
    client: Option<Client>,
}
impl WebDavBackend {
    /// Create a disconnected backend.
    ///
    /// # Errors
    ///
    /// Returns [`Configuration`](ErrorKind::Configuration) if the URL can't
    /// be parsed.
    pub fn new(name: impl Into<String>, config: WebDavConfig) -> Result<Self> {
        let mut base = Url::parse(&config.url)
            .or_raise(|| ErrorKind::Configuration(format!("invalid WebDAV URL: {}", config.url)))?;
        if !config.path.is_empty() && config.path != "/" {
            base.set_path(&config.path);
        }
        Ok(Self { name: name.into(), config, base, client: None })
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_raise(|| ErrorKind::NotConnected)
    }

    fn url(&self, path: &str) -> Url {
        resolve_url(&self.base, path)
    }

    /// Like [`url()`](Self::url), with the trailing slash collections need.
    fn collection_url(&self, path: &str) -> Url {
        let mut url = self.url(path);
        if !url.path().ends_with('/') {
            let with_slash = format!("{}/", url.path());
            url.set_path(&with_slash);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.username.as_str() {
            "" => request,
            username => request.basic_auth(username, Some(&self.config.password)),
        }
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        tracing::debug!(method = %method, url = %url, "WebDAV request");
        Ok(self.authorized(self.client()?.request(method, url)))
    }

    /// Depth-0 PROPFIND of the storage root.
    async fn propfind_root(&self, client: &Client) -> Result<()> {
        let request = self.authorized(client.request(dav_method("PROPFIND")?, self.base.clone()));
        let response = send(request.header("Depth", "0")).await?;
        // 207 Multi-Status is a success code too
        if !response.status().is_success() {
            exn::bail!(status_error(response.status()));
        }
        Ok(())
    }
}

fn dav_method(name: &'static str) -> Result<Method> {
    Method::from_bytes(name.as_bytes()).or_raise(|| ErrorKind::Backend(format!("invalid HTTP method {name}")))
}

async fn send(request: RequestBuilder) -> Result<Response> {
    request.send().await.map_err(|err| {
        let kind = ErrorKind::Network(err.to_string());
        exn::Exn::from(err).raise(kind)
    })
}

fn status_error(status: StatusCode) -> ErrorKind {
    ErrorKind::Status { protocol: Protocol::WebDav, code: status.as_u16() }
}

/// Fail on anything but 2xx; 404 becomes [`NotFound`](ErrorKind::NotFound).
fn check(response: Response, path: &str) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => exn::bail!(ErrorKind::NotFound(path.to_string())),
        status => exn::bail!(status_error(status)),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn body_error(err: reqwest::Error) -> Error {
    let kind = ErrorKind::Network(err.to_string());
    exn::Exn::from(err).raise(kind)
}

/// A PUT whose body is fed chunk by chunk from blocking code. `flush()` ends
/// the body and waits for the server's answer.
struct Upload {
    chunks: Option<mpsc::Sender<io::Result<Vec<u8>>>>,
    request: Option<JoinHandle<Result<()>>>,
    runtime: Handle,
}
impl Write for Upload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunks = self
            .chunks
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "WebDAV upload already finished"))?;
        // The request task drops the receiver when the server answers early
        chunks
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WebDAV server stopped reading the upload"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        drop(self.chunks.take());
        let Some(request) = self.request.take() else {
            return Ok(());
        };
        match self.runtime.block_on(request) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(upload_error(&err)),
            Err(err) => Err(io::Error::other(err)),
        }
    }
}
impl Drop for Upload {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            tracing::warn!("WebDAV upload dropped without flush, aborting the request");
            request.abort();
        }
    }
}

fn upload_error(err: &Error) -> io::Error {
    let kind = match &**err {
        ErrorKind::NotFound(_) => io::ErrorKind::NotFound,
        ErrorKind::PermissionDenied(_) => io::ErrorKind::PermissionDenied,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

#[async_trait]
impl StorageBackend for WebDavBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        Protocol::WebDav
    }

    fn config(&self) -> BackendConfig {
        BackendConfig::WebDav(self.config.clone())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .or_raise(|| ErrorKind::Connection(ConnectStep::Handshake))?;
        self.propfind_root(&client)
            .await
            .or_raise(|| ErrorKind::Connection(ConnectStep::Handshake))?;
        tracing::info!(backend = %self.name, url = %self.base, "connected to WebDAV server");
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            tracing::info!(backend = %self.name, "disconnected from WebDAV server");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn test_connection(&self) -> Result<()> {
        self.propfind_root(self.client()?).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let response = send(self.request(Method::GET, self.url(path))?).await?;
        let body = check(response, path)?.bytes().await.map_err(body_error)?;
        Ok(body.to_vec())
    }

    async fn reader(&self, path: &str) -> Result<BoxSyncRead> {
        let response = check(send(self.request(Method::GET, self.url(path))?).await?, path)?;
        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(Box::new(SyncIoBridge::new(StreamReader::new(body))))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let request = self.request(Method::PUT, self.url(path))?.body(data.to_vec());
        check(send(request).await?, path)?;
        Ok(())
    }

    /// The PUT is sent right away; the server's verdict (a missing parent,
    /// say) only arrives once `flush()` has ended the body.
    async fn writer(&self, path: &str) -> Result<BoxSyncWrite> {
        let (chunks, receiver) = mpsc::channel(UPLOAD_BUFFER);
        let body = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|chunk| (chunk, receiver))
        });
        let request = self.request(Method::PUT, self.url(path))?.body(Body::wrap_stream(body));
        let target = path.to_string();
        let request = tokio::spawn(async move { check(send(request).await?, &target).map(drop) });
        Ok(Box::new(Upload { chunks: Some(chunks), request: Some(request), runtime: Handle::current() }))
    }

    /// HEAD carries no resource type, so a directory is recognised by the
    /// requested path ending in `/` (or the server redirecting there) or the
    /// content type Apache uses for collections.
    async fn stat(&self, path: &str) -> Result<FileEntry> {
        let response = check(send(self.request(Method::HEAD, self.url(path))?).await?, path)?;
        let headers = response.headers();
        let is_directory = path.ends_with('/')
            || response.url().path().ends_with('/')
            || header(headers, CONTENT_TYPE).is_some_and(|value| value.starts_with(DIRECTORY_CONTENT_TYPE));
        // `Response::content_length()` is the (empty) body's length for HEAD
        let size = match is_directory {
            true => 0,
            false => header(headers, CONTENT_LENGTH).and_then(|value| value.parse().ok()).unwrap_or(0),
        };
        let modified = header(headers, LAST_MODIFIED)
            .and_then(multistatus::parse_http_date)
            .unwrap_or_else(OffsetDateTime::now_utc);
        let relative = normalize(path);
        let name = match basename(&relative) {
            "" => self.base.path_segments().and_then(|mut s| s.rfind(|s| !s.is_empty())).unwrap_or_default(),
            name => name,
        };
        Ok(FileEntry::new(name, relative.as_str(), size, modified).directory(is_directory))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let response = send(self.request(Method::HEAD, self.url(path))?).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            status => exn::bail!(status_error(status)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        check(send(self.request(Method::DELETE, self.url(path))?).await?, path)?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let request = self
            .request(dav_method("COPY")?, self.url(from))?
            .header("Destination", self.url(to).as_str())
            .header("Overwrite", "T");
        check(send(request).await?, from)?;
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let url = self.collection_url(path);
        let request = self
            .request(dav_method("PROPFIND")?, url.clone())?
            .header("Depth", "1")
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let response = check(send(request).await?, path)?;
        if response.status() != StatusCode::MULTI_STATUS {
            exn::bail!(status_error(response.status()));
        }
        let body = response.text().await.map_err(body_error)?;
        let dir = normalize(path);
        Ok(multistatus::parse(&body, url.path())
            .into_iter()
            .map(|mut entry| {
                entry.path = join_relative(&dir, &entry.path);
                entry
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let request = self.request(dav_method("MKCOL")?, self.collection_url(path))?;
        check(send(request).await?, path)?;
        Ok(())
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        check(send(self.request(Method::DELETE, self.collection_url(path))?).await?, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::DavServer;
    use super::*;

    fn config(url: &str) -> WebDavConfig {
        WebDavConfig { url: url.into(), username: "admin".into(), password: "secret".into(), path: String::new() }
    }

    async fn connected(server: &DavServer) -> WebDavBackend {
        let mut backend = WebDavBackend::new("dav", config(&server.url())).unwrap();
        backend.connect().await.unwrap();
        backend
    }

    #[test]
    fn test_path_override() {
        let backend = WebDavBackend::new(
            "dav",
            WebDavConfig { path: "/remote.php/dav".into(), ..config("https://cloud.example.com/ignored") },
        )
        .unwrap();
        assert_eq!(backend.base.as_str(), "https://cloud.example.com/remote.php/dav");
        assert_eq!(backend.url("../../a b.txt").as_str(), "https://cloud.example.com/remote.php/dav/a%20b.txt");
        assert_eq!(backend.collection_url("docs").as_str(), "https://cloud.example.com/remote.php/dav/docs/");

        let backend = WebDavBackend::new("dav", WebDavConfig { path: "/".into(), ..config("https://h/dav/") }).unwrap();
        assert_eq!(backend.base.as_str(), "https://h/dav/");
    }

    #[test]
    fn test_invalid_url() {
        let err = WebDavBackend::new("dav", config("not a url")).err().unwrap();
        assert!(matches!(&*err, ErrorKind::Configuration(_)));
    }

    #[tokio::test]
    async fn test_connect_sends_credentials() {
        let server = DavServer::start(Some(("admin", "secret"))).await;
        let mut backend = connected(&server).await;
        assert!(backend.is_connected());
        let first = &server.requests()[0];
        assert_eq!(first.method, "PROPFIND");
        assert_eq!(first.header("depth"), Some("0"));
        assert_eq!(first.header("authorization"), Some("Basic YWRtaW46c2VjcmV0"));
        backend.disconnect().await.unwrap();
        backend.disconnect().await.unwrap();
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let server = DavServer::start(Some(("admin", "other"))).await;
        let mut backend = WebDavBackend::new("dav", config(&server.url())).unwrap();
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Connection(ConnectStep::Handshake)));
        assert!(!backend.is_connected());

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut backend = WebDavBackend::new("dav", config(&format!("http://127.0.0.1:{closed}/dav/"))).unwrap();
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Connection(ConnectStep::Handshake)));
    }

    #[tokio::test]
    async fn test_round_trip_and_listing() {
        let server = DavServer::start(None).await;
        let backend = connected(&server).await;
        backend.create_dir("a").await.unwrap();
        backend.write("a/b.txt", b"hello").await.unwrap();
        backend.create_dir("a/sub dir").await.unwrap();
        assert_eq!(backend.read("a/b.txt").await.unwrap(), b"hello");

        let mut entries = backend.list("a").await.unwrap();
        entries.sort_by(|x, y| x.name.cmp(&y.name));
        let summary: Vec<_> = entries.iter().map(|e| (e.path.as_str(), e.size, e.is_directory)).collect();
        assert_eq!(summary, [("a/b.txt", 5, false), ("a/sub dir", 0, true)]);

        let listing = server.requests().into_iter().find(|r| r.method == "PROPFIND" && r.path == "/dav/a/").unwrap();
        assert_eq!(listing.header("depth"), Some("1"));
        assert!(String::from_utf8_lossy(&listing.body).contains("getcontentlength"));
    }

    #[tokio::test]
    async fn test_stat_and_exists() {
        let server = DavServer::start(None).await;
        let backend = connected(&server).await;
        backend.write("file.txt", b"12345678").await.unwrap();
        backend.create_dir("dir").await.unwrap();

        let file = backend.stat("file.txt").await.unwrap();
        assert_eq!((file.name.as_str(), file.size, file.is_directory), ("file.txt", 8, false));
        // Last-Modified comes from the server, at whole-second resolution
        assert!((OffsetDateTime::now_utc() - file.modified).whole_seconds().abs() < 60);
        assert!(backend.stat("dir").await.unwrap().is_directory);
        let err = backend.stat("missing").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(path) if path == "missing"));

        assert!(backend.exists("file.txt").await.unwrap());
        assert!(!backend.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_delete_and_errors() {
        let server = DavServer::start(None).await;
        let backend = connected(&server).await;
        backend.write("source.txt", b"copy me").await.unwrap();
        backend.copy("source.txt", "copy.txt").await.unwrap();
        assert_eq!(backend.read("copy.txt").await.unwrap(), b"copy me");
        let copy = server.requests().into_iter().find(|r| r.method == "COPY").unwrap();
        assert_eq!(copy.header("destination"), Some(format!("{}copy.txt", server.url()).as_str()));

        backend.delete("source.txt").await.unwrap();
        let err = backend.read("source.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let err = backend.delete("source.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));

        // No implicit parent creation
        let err = backend.write("no/parent.txt", b"x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Status { protocol: Protocol::WebDav, code: 409 }));
        let err = backend.create_dir("x/y").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Status { code: 409, .. }));

        backend.create_dir("gone").await.unwrap();
        backend.delete_dir("gone").await.unwrap();
        assert!(!backend.exists("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_traversal_stays_below_base() {
        let server = DavServer::start(None).await;
        let backend = connected(&server).await;
        backend.write("../../escape.txt", b"caught").await.unwrap();
        let put = server.requests().into_iter().find(|r| r.method == "PUT").unwrap();
        assert_eq!(put.path, "/dav/escape.txt");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let backend = WebDavBackend::new("dav", config("http://127.0.0.1:1/dav/")).unwrap();
        let err = backend.read("file.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotConnected));
        let err = backend.test_connection().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotConnected));
        let err = backend.reader("file.txt").await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotConnected));
        let err = backend.writer("file.txt").await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn test_reported_paths_are_normalized() {
        let server = DavServer::start(None).await;
        let backend = connected(&server).await;
        backend.create_dir("b").await.unwrap();
        backend.write("b/c.txt", b"c").await.unwrap();

        let file = backend.stat("a/../b/./c.txt").await.unwrap();
        assert_eq!((file.name.as_str(), file.path.as_str()), ("c.txt", "b/c.txt"));
        let dir = backend.stat("a/../b").await.unwrap();
        assert_eq!((dir.name.as_str(), dir.path.as_str(), dir.is_directory), ("b", "b", true));
        let entries = backend.list("x/../b/").await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["b/c.txt"]);
    }

    #[tokio::test]
    async fn test_streaming_transfers() {
        let server = DavServer::start(None).await;
        let backend = connected(&server).await;

        let mut writer = backend.writer("stream.bin").await.unwrap();
        tokio::task::spawn_blocking(move || {
            for chunk in [b"first ".as_slice(), b"second ", b"third"] {
                writer.write_all(chunk).unwrap();
            }
            writer.flush().unwrap();
            assert_eq!(writer.write(b"late").unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        })
        .await
        .unwrap();
        assert_eq!(backend.read("stream.bin").await.unwrap(), b"first second third");

        let mut reader = backend.reader("stream.bin").await.unwrap();
        let data = tokio::task::spawn_blocking(move || {
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut reader, &mut data).map(|_| data)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(data, b"first second third");

        let err = backend.reader("missing.bin").await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::NotFound(path) if path == "missing.bin"));

        // The server's refusal surfaces when the body is finished
        let mut writer = backend.writer("no/parent.bin").await.unwrap();
        let err = tokio::task::spawn_blocking(move || {
            let _ = writer.write_all(b"x");
            writer.flush().unwrap_err()
        })
        .await
        .unwrap();
        assert!(err.to_string().contains("409"), "{err}");
    }

    /// Dropping an operation's future must tear down its HTTP request rather
    /// than leave it running until the client timeout.
    #[tokio::test]
    async fn test_dropped_request_closes_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        async fn read_request(socket: &mut tokio::net::TcpStream) {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") && socket.read(&mut byte).await.unwrap() == 1 {
                head.push(byte[0]);
            }
            let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0);
            let mut body = vec![0u8; length];
            socket.read_exact(&mut body).await.unwrap();
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/dav/", listener.local_addr().unwrap());
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            // Answer the connect handshake, then stall on the next request
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 207 Multi-Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            drop(socket);
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let mut rest = [0u8; 64];
            let closed = matches!(socket.read(&mut rest).await, Ok(0) | Err(_));
            let _ = closed_tx.send(closed);
        });

        let mut backend = WebDavBackend::new("dav", config(&url)).unwrap();
        backend.connect().await.unwrap();
        let stalled = tokio::time::timeout(Duration::from_millis(200), backend.read("slow.txt")).await;
        assert!(stalled.is_err());
        let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx).await.unwrap().unwrap();
        assert!(closed);
    }
}
