//! Storage models.
//!
//! Types returned to callers of every backend, independent of protocol.

use crate::error::{Error, ErrorKind};
use derive_more::Display;
use std::str::FromStr;
use time::OffsetDateTime;

/// Permission bits reported by backends without native permission metadata.
pub const DEFAULT_MODE: u32 = 0o644;

/// Storage protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Protocol {
    #[display("smb")]
    Smb,
    #[display("ftp")]
    Ftp,
    #[display("nfs")]
    Nfs,
    #[display("webdav")]
    WebDav,
    #[display("local")]
    Local,
}
impl Protocol {
    /// Every protocol, in the order they are advertised.
    pub const ALL: [Protocol; 5] = [Self::Smb, Self::Ftp, Self::Nfs, Self::WebDav, Self::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Ftp => "ftp",
            Self::Nfs => "nfs",
            Self::WebDav => "webdav",
            Self::Local => "local",
        }
    }
}
impl FromStr for Protocol {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|protocol| protocol.as_str() == tag)
            .ok_or_else(|| ErrorKind::UnsupportedProtocol(tag.to_string()).into())
    }
}

/// Metadata for a single file or directory.
///
/// Produced fresh by every query; `path` is always relative to the storage
/// root the caller sees, never the backend's own root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Base name only
    pub name: String,
    /// Size in bytes (0 is permitted for directories)
    pub size: u64,
    /// Last modified timestamp, or the time of the query when the backend
    /// cannot report one
    pub modified: OffsetDateTime,
    pub is_directory: bool,
    /// Unix permission bits
    pub mode: u32,
    /// Caller-relative path
    pub path: String,
}
impl FileEntry {
    pub fn new(name: impl Into<String>, path: impl Into<String>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
            is_directory: false,
            mode: DEFAULT_MODE,
            path: path.into(),
        }
    }

    pub fn directory(mut self, is_directory: bool) -> Self {
        self.is_directory = is_directory;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}
