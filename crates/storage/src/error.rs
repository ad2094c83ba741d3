//! Storage Error Types
//!
//! Errors are `exn` trees: the [`ErrorKind`] at the top says what the caller
//! can act on, child frames keep the underlying cause (an I/O error, an HTTP
//! failure, an FTP reply) along with the location it was raised at.

use crate::models::Protocol;
use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of connection establishment that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectStep {
    #[display("stat base path")]
    StatBasePath,
    #[display("create mount point")]
    CreateMountPoint,
    #[display("mount")]
    Mount,
    #[display("dial")]
    Dial,
    #[display("authenticate")]
    Authenticate,
    #[display("mount share")]
    MountShare,
    #[display("change directory")]
    ChangeDirectory,
    #[display("handshake")]
    Handshake,
}

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Operation attempted while disconnected; nothing was sent to the backend
    #[display("not connected")]
    NotConnected,
    /// Connection establishment failed; the cause is the child frame
    #[display("connection failed during {_0}")]
    Connection(#[error(not(source))] ConnectStep),
    /// File or directory does not exist
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Access denied (permissions or credentials)
    #[display("permission denied: {_0}")]
    PermissionDenied(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Non-success status from the backend (HTTP status, FTP reply code)
    #[display("{protocol} backend returned status {code}")]
    Status { protocol: Protocol, code: u16 },
    /// Transport-level failure talking to a remote backend
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    #[display("unsupported protocol: {_0}")]
    UnsupportedProtocol(#[error(not(source))] String),
    #[display("{_0} is not supported on this platform")]
    UnsupportedPlatform(#[error(not(source))] Protocol),
    /// Descriptor settings could not produce a usable backend configuration
    #[display("configuration error: {_0}")]
    Configuration(#[error(not(source))] String),
    /// Path (or URL) could not be used as a storage root
    #[display("invalid path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    /// One or more teardown steps failed (every step was still attempted)
    #[display("teardown failed: {}", _0.join("; "))]
    Teardown(#[error(not(source))] Vec<String>),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Map an I/O error for `path`, keeping not-found and permission failures
    /// distinguishable.
    pub fn from_io(err: IoError, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Network(_) | Self::Connection(_) | Self::Backend(_) => true,
            // 421: FTP "service not available, closing control connection"
            Self::Status { code, .. } => *code == 421 || (500..600).contains(code),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io() {
        let not_found = IoError::from(std::io::ErrorKind::NotFound);
        assert!(matches!(ErrorKind::from_io(not_found, "a/b"), ErrorKind::NotFound(p) if p == "a/b"));
        let denied = IoError::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(ErrorKind::from_io(denied, "a"), ErrorKind::PermissionDenied(_)));
        let other = IoError::other("boom");
        assert!(matches!(ErrorKind::from_io(other, "a"), ErrorKind::Io(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::Connection(ConnectStep::MountShare).to_string(), "connection failed during mount share");
        let status = ErrorKind::Status { protocol: Protocol::WebDav, code: 423 };
        assert_eq!(status.to_string(), "webdav backend returned status 423");
        let teardown = ErrorKind::Teardown(vec!["unmount: busy".into(), "logoff: reset".into()]);
        assert_eq!(teardown.to_string(), "teardown failed: unmount: busy; logoff: reset");
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Status { protocol: Protocol::WebDav, code: 503 }.is_retryable());
        assert!(ErrorKind::Status { protocol: Protocol::Ftp, code: 421 }.is_retryable());
        assert!(!ErrorKind::Status { protocol: Protocol::WebDav, code: 404 }.is_retryable());
        assert!(!ErrorKind::NotConnected.is_retryable());
        assert!(!ErrorKind::UnsupportedProtocol("bogus".into()).is_retryable());
    }
}
