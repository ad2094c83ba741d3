//! WebDAV server for tests: `dav-server`'s in-memory file system mounted at
//! `/dav` behind a loopback hyper listener. Every request is recorded before
//! it's handled, and Basic credentials are enforced when configured.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dav_server::DavHandler;
use dav_server::body::Body;
use dav_server::fakels::FakeLs;
use dav_server::memfs::MemFs;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// A request as the server received it.
#[derive(Debug, Clone)]
pub(super) struct Request {
    pub(super) method: String,
    pub(super) path: String,
    pub(super) headers: Vec<(String, String)>,
    pub(super) body: Vec<u8>,
}
impl Request {
    pub(super) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone)]
struct Gate {
    handler: DavHandler,
    /// Expected `Authorization` header
    authorization: Option<String>,
    log: Arc<Mutex<Vec<Request>>>,
}
impl Gate {
    async fn handle(self, request: hyper::Request<Incoming>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let body = body.collect().await.map(|collected| collected.to_bytes()).unwrap_or_default();
        self.log.lock().unwrap().push(Request {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
                .collect(),
            body: body.to_vec(),
        });
        let presented = parts.headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
        if let Some(expected) = &self.authorization
            && presented != Some(expected.as_str())
        {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            return response;
        }
        self.handler.handle(hyper::Request::from_parts(parts, Full::new(body))).await
    }
}

pub(super) struct DavServer {
    address: SocketAddr,
    log: Arc<Mutex<Vec<Request>>>,
}
impl DavServer {
    pub(super) async fn start(credentials: Option<(&str, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Gate {
            handler: DavHandler::builder()
                .filesystem(MemFs::new())
                .locksystem(FakeLs::new())
                .strip_prefix("/dav")
                .autoindex(true)
                .build_handler(),
            authorization: credentials
                .map(|(username, password)| format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))),
            log: Arc::clone(&log),
        };
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let gate = gate.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let gate = gate.clone();
                        async move { Ok::<_, Infallible>(gate.handle(request).await) }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                        tracing::debug!(error = %err, "test WebDAV connection ended with an error");
                    }
                });
            }
        });
        Self { address, log }
    }

    /// Base URL of the DAV root, with its trailing slash.
    pub(super) fn url(&self) -> String {
        format!("http://{}/dav/", self.address)
    }

    /// Every request received so far, oldest first.
    pub(super) fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }
}
