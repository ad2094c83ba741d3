//! Path sandboxing.
//!
//! Every backend maps a caller-relative path onto its own root (a directory,
//! a mounted export, a URL, an FTP directory or an SMB share). The relative
//! path is first normalized lexically, then every remaining `..` is removed
//! outright, and only then is it joined onto the root. The result can't
//! contain `..` and can't leave the root, whatever the caller passes in.

use reqwest::Url;
use std::path::{Path, PathBuf};

/// Lexically normalize a `/`-separated path: drop empty and `.` segments
/// and collapse `..` against the preceding segment. Leading `..` segments of
/// a relative path are kept (there's nothing to collapse them against).
fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {},
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                },
                _ if rooted => {},
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if rooted { format!("/{joined}") } else { joined }
}

/// Segments of `relative` that are safe to join onto a storage root.
///
/// # Examples
///
/// ```
/// use fsbridge_storage::path::sanitize;
/// assert_eq!(sanitize("a/./b//c"), ["a", "b", "c"]);
/// assert_eq!(sanitize("a/../b"), ["b"]);
/// assert_eq!(sanitize("../../etc/passwd"), ["etc", "passwd"]);
/// assert!(sanitize("..").is_empty());
/// ```
pub fn sanitize(relative: &str) -> Vec<String> {
    clean(relative)
        .replace("..", "")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .map(str::to_string)
        .collect()
}

/// Canonical caller-relative form of `relative`, as reported back in
/// [`FileEntry::path`](crate::FileEntry::path): sanitized segments joined
/// with `/`, no leading or trailing separator.
pub fn normalize(relative: &str) -> String {
    sanitize(relative).join("/")
}

/// Resolve a caller-relative path below a file system root.
pub fn resolve(base: &Path, relative: &str) -> PathBuf {
    let mut resolved = base.to_path_buf();
    resolved.extend(sanitize(relative));
    resolved
}

/// Resolve a caller-relative path below a base URL. Segments are
/// percent-encoded; a relative path with no segments yields the base as-is.
pub fn resolve_url(base: &Url, relative: &str) -> Url {
    let segments = sanitize(relative);
    let mut url = base.clone();
    if segments.is_empty() {
        return url;
    }
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(&segments);
    }
    url
}

/// Resolve a caller-relative path below a `/`-separated remote directory
/// (FTP working directory, SMB share root). An empty base keeps the result
/// relative to wherever the server session currently is.
pub fn resolve_remote(base: &str, relative: &str) -> String {
    let joined = sanitize(relative).join("/");
    let trimmed = base.trim_end_matches('/');
    if base.is_empty() {
        return joined;
    }
    match (trimmed.is_empty(), joined.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => trimmed.to_string(),
        _ => format!("{trimmed}/{joined}"),
    }
}

/// Caller-relative path of `name` inside the caller-relative directory `dir`.
pub fn join_relative(dir: &str, name: &str) -> String {
    match dir.trim_matches('/') {
        "" | "." => name.to_string(),
        dir => format!("{dir}/{name}"),
    }
}

/// Final non-empty segment of a `/`-separated path.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// Parent of a `/`-separated path, or `""` at the top.
pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) if path.starts_with('/') => "/",
        Some((parent, _)) => parent,
        None => "",
    }
}
