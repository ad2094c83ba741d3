//! In-memory SMB server for tests.
//!
//! A [`MemoryDialer`] hands out connections to one shared file tree. Faults
//! can be injected at every connection layer, and each successful layer
//! operation is recorded so tests can check what was opened and closed.

use super::{SmbConfig, SmbDialer, SmbSession, SmbShare, SmbStat, SmbTransport};
use crate::path::{basename, parent};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Connection layer operation to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFault {
    Dial,
    Authenticate,
    Mount,
    Unmount,
    Logoff,
    Close,
}

#[derive(Debug)]
struct State {
    files: BTreeMap<String, (Vec<u8>, SystemTime)>,
    dirs: BTreeSet<String>,
    faults: HashSet<MemoryFault>,
    events: Vec<String>,
}

type Shared = Arc<Mutex<State>>;

fn lock(state: &Shared) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record `event`, or fail if `fault` was injected.
fn step(state: &Shared, fault: MemoryFault, event: impl Into<String>) -> io::Result<()> {
    let mut state = lock(state);
    if state.faults.contains(&fault) {
        return Err(io::Error::other(format!("injected {fault:?} failure")));
    }
    state.events.push(event.into());
    Ok(())
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path}: no such file or directory"))
}

#[derive(Debug, Clone)]
pub struct MemoryDialer {
    state: Shared,
}
impl Default for MemoryDialer {
    fn default() -> Self {
        Self::new()
    }
}
impl MemoryDialer {
    /// An empty share containing only its root directory.
    pub fn new() -> Self {
        let state = State {
            files: BTreeMap::new(),
            dirs: BTreeSet::from(["/".to_string()]),
            faults: HashSet::new(),
            events: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn with_fault(self, fault: MemoryFault) -> Self {
        lock(&self.state).faults.insert(fault);
        self
    }

    /// Successful layer operations so far, oldest first.
    pub fn events(&self) -> Vec<String> {
        lock(&self.state).events.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).map(|(data, _)| data.clone())
    }
}

#[async_trait]
impl SmbDialer for MemoryDialer {
    async fn dial(&self, _config: &SmbConfig) -> io::Result<Box<dyn SmbTransport>> {
        step(&self.state, MemoryFault::Dial, "dial")?;
        Ok(Box::new(Memory(Arc::clone(&self.state))))
    }
}

/// Transport and session layers: the same view of the shared state.
struct Memory(Shared);

struct MemoryShare {
    state: Shared,
    mounted: AtomicBool,
}
impl MemoryShare {
    /// The tree, unless the share has been unmounted.
    fn state(&self) -> io::Result<MutexGuard<'_, State>> {
        match self.mounted.load(Ordering::Acquire) {
            true => Ok(lock(&self.state)),
            false => Err(io::Error::new(io::ErrorKind::NotConnected, "share unmounted")),
        }
    }
}

#[async_trait]
impl SmbTransport for Memory {
    async fn authenticate(&mut self, _config: &SmbConfig) -> io::Result<Box<dyn SmbSession>> {
        step(&self.0, MemoryFault::Authenticate, "authenticate")?;
        Ok(Box::new(Memory(Arc::clone(&self.0))))
    }

    async fn close(&mut self) -> io::Result<()> {
        step(&self.0, MemoryFault::Close, "close")
    }
}

#[async_trait]
impl SmbSession for Memory {
    async fn mount(&mut self, share: &str) -> io::Result<Box<dyn SmbShare>> {
        step(&self.0, MemoryFault::Mount, format!("mount {share}"))?;
        Ok(Box::new(MemoryShare { state: Arc::clone(&self.0), mounted: AtomicBool::new(true) }))
    }

    async fn logoff(&mut self) -> io::Result<()> {
        step(&self.0, MemoryFault::Logoff, "logoff")
    }
}

fn children(state: &State, dir: &str) -> Vec<SmbStat> {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
    let is_child = |path: &str| {
        path.strip_prefix(prefix.as_str())
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
    };
    let dirs = state.dirs.iter().filter(|path| is_child(path.as_str())).map(|path| directory_stat(path));
    let files = state
        .files
        .iter()
        .filter(|(path, _)| is_child(path.as_str()))
        .map(|(path, (data, modified))| file_stat(path, data, *modified));
    dirs.chain(files).collect()
}

fn directory_stat(path: &str) -> SmbStat {
    SmbStat { name: basename(path).to_string(), size: 0, modified: None, is_directory: true, mode: None }
}

fn file_stat(path: &str, data: &[u8], modified: SystemTime) -> SmbStat {
    SmbStat {
        name: basename(path).to_string(),
        size: data.len() as u64,
        modified: Some(modified),
        is_directory: false,
        mode: None,
    }
}

#[async_trait]
impl SmbShare for MemoryShare {
    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.state()?.files.get(path).map(|(data, _)| data.clone()).ok_or_else(|| not_found(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut state = self.state()?;
        if !state.dirs.contains(parent(path)) {
            return Err(not_found(parent(path)));
        }
        if state.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::IsADirectory, path.to_string()));
        }
        state.files.insert(path.to_string(), (data.to_vec(), SystemTime::now()));
        Ok(())
    }

    async fn stat(&self, path: &str) -> io::Result<SmbStat> {
        let state = self.state()?;
        if state.dirs.contains(path) {
            return Ok(directory_stat(path));
        }
        let (data, modified) = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(file_stat(path, data, *modified))
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<SmbStat>> {
        let state = self.state()?;
        if !state.dirs.contains(path) {
            return Err(not_found(path));
        }
        Ok(children(&state, path))
    }

    async fn mkdir(&self, path: &str) -> io::Result<()> {
        let mut state = self.state()?;
        if state.dirs.contains(path) || state.files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, path.to_string()));
        }
        if !state.dirs.contains(parent(path)) {
            return Err(not_found(parent(path)));
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> io::Result<()> {
        self.state()?.files.remove(path).map(|_| ()).ok_or_else(|| not_found(path))
    }

    async fn remove_dir(&self, path: &str) -> io::Result<()> {
        let mut state = self.state()?;
        if !state.dirs.contains(path) {
            return Err(not_found(path));
        }
        if !children(&state, path).is_empty() {
            return Err(io::Error::new(io::ErrorKind::DirectoryNotEmpty, path.to_string()));
        }
        state.dirs.remove(path);
        Ok(())
    }

    async fn unmount(&self) -> io::Result<()> {
        self.mounted.store(false, Ordering::Release);
        step(&self.state, MemoryFault::Unmount, "unmount")
    }
}
