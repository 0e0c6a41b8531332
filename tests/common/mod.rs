#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use remote_fs::config::FsConfig;
use remote_fs::entry::{Access, DirEntryList, EntryType, Stat};
use remote_fs::event::{EventKind, FileChangeListener, FsEvent};
use remote_fs::fs::RemoteFileSystem;
use remote_fs::path;
use remote_fs::transport::{ExecOutput, MoveResult, Transport, TransportError};

#[derive(Debug, Clone)]
pub enum MockKind {
    File(Bytes),
    Dir,
    Link(String),
}

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub kind: MockKind,
    pub mtime_ms: u64,
    pub access: Access,
}

/// Per-method call counters.
#[derive(Debug, Default)]
pub struct Calls {
    pub stat: AtomicUsize,
    pub lstat: AtomicUsize,
    pub read_directory: AtomicUsize,
    pub download: AtomicUsize,
    pub exec: AtomicUsize,
    pub mutations: AtomicUsize,
}

#[derive(Debug)]
struct MockState {
    tree: Mutex<BTreeMap<String, MockEntry>>,
    connected: AtomicBool,
    calls: Calls,
    /// Held exec calls wait here until a permit is added.
    exec_gate: tokio::sync::Semaphore,
    hold_exec: AtomicBool,
    server_copy: AtomicBool,
    refresh_fast: AtomicBool,
    polling: AtomicBool,
}

/// An in-memory remote tree with a connectivity switch.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

fn default_access(kind: &MockKind) -> Access {
    match kind {
        MockKind::Dir => Access::READ | Access::WRITE | Access::EXECUTE,
        MockKind::File(_) | MockKind::Link(_) => Access::READ | Access::WRITE,
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert(
            "/".to_owned(),
            MockEntry {
                kind: MockKind::Dir,
                mtime_ms: 1_000,
                access: default_access(&MockKind::Dir),
            },
        );
        Self {
            state: Arc::new(MockState {
                tree: Mutex::new(tree),
                connected: AtomicBool::new(true),
                calls: Calls::default(),
                exec_gate: tokio::sync::Semaphore::new(0),
                hold_exec: AtomicBool::new(false),
                server_copy: AtomicBool::new(false),
                refresh_fast: AtomicBool::new(false),
                polling: AtomicBool::new(false),
            }),
        }
    }

    pub fn calls(&self) -> &Calls {
        &self.state.calls
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes `exec` wait until [`release_exec`](Self::release_exec) is called.
    pub fn hold_exec(&self) {
        self.state.hold_exec.store(true, Ordering::SeqCst);
    }

    pub fn release_exec(&self) {
        self.state.hold_exec.store(false, Ordering::SeqCst);
        self.state.exec_gate.add_permits(64);
    }

    /// Lets the remote copy files on its own side.
    pub fn set_server_copy(&self, enabled: bool) {
        self.state.server_copy.store(enabled, Ordering::SeqCst);
    }

    /// Marks full listings as cheap.
    pub fn set_refresh_fast(&self, enabled: bool) {
        self.state.refresh_fast.store(enabled, Ordering::SeqCst);
    }

    /// Makes the remote require polling for changes.
    pub fn set_polling(&self, enabled: bool) {
        self.state.polling.store(enabled, Ordering::SeqCst);
    }

    fn put(&self, path: &str, kind: MockKind) {
        let access = default_access(&kind);
        self.state.tree.lock().unwrap().insert(
            path.to_owned(),
            MockEntry {
                kind,
                mtime_ms: 1_000,
                access,
            },
        );
    }

    pub fn add_dir(&self, path: &str) {
        self.put(path, MockKind::Dir);
    }

    pub fn add_file(&self, path: &str, content: &str) {
        self.put(path, MockKind::File(Bytes::copy_from_slice(content.as_bytes())));
    }

    pub fn add_link(&self, path: &str, target: &str) {
        self.put(path, MockKind::Link(target.to_owned()));
    }

    /// Replaces the content of a file and bumps its modification time.
    pub fn rewrite(&self, path: &str, content: &str) {
        let mut tree = self.state.tree.lock().unwrap();
        let entry = tree.get_mut(path).unwrap();
        entry.kind = MockKind::File(Bytes::copy_from_slice(content.as_bytes()));
        entry.mtime_ms += 60_000;
    }

    pub fn set_mtime(&self, path: &str, mtime_ms: u64) {
        self.state.tree.lock().unwrap().get_mut(path).unwrap().mtime_ms = mtime_ms;
    }

    pub fn set_access(&self, path: &str, access: Access) {
        self.state.tree.lock().unwrap().get_mut(path).unwrap().access = access;
    }

    /// Removes `path` and everything below it, behind the cache's back.
    pub fn remove(&self, path: &str) {
        self.state
            .tree
            .lock()
            .unwrap()
            .retain(|p, _| p != path && !path::is_descendant(p, path));
    }

    pub fn content(&self, path: &str) -> Option<Bytes> {
        match &self.state.tree.lock().unwrap().get(path)?.kind {
            MockKind::File(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.tree.lock().unwrap().contains_key(path)
    }

    fn check(&self, path: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected {
                host: self.display_name(),
            });
        }
        if !path.starts_with('/') {
            return Err(TransportError::Relative {
                path: path.to_owned(),
            });
        }
        Ok(())
    }

    fn record(path: &str, entry: &MockEntry) -> Stat {
        let name = match path::file_name(path) {
            "" => "/",
            name => name,
        };
        let (kind, size) = match &entry.kind {
            MockKind::File(bytes) => (EntryType::Regular, bytes.len() as u64),
            MockKind::Dir => (EntryType::Directory, 0),
            MockKind::Link(target) => (EntryType::SymbolicLink, target.len() as u64),
        };
        let stat = Stat::new(name, kind)
            .with_size(size)
            .with_mtime(UNIX_EPOCH + Duration::from_millis(entry.mtime_ms))
            .with_access(entry.access);
        match &entry.kind {
            MockKind::Link(target) => stat.with_link_target(target.clone()),
            _ => stat,
        }
    }

    fn lookup(&self, path: &str, follow: bool) -> Result<Stat, TransportError> {
        let tree = self.state.tree.lock().unwrap();
        let mut current = path::normalize(path).unwrap();
        for _ in 0..40 {
            let entry = tree
                .get(&current)
                .ok_or_else(|| TransportError::NotFound {
                    path: path.to_owned(),
                })?;
            match &entry.kind {
                MockKind::Link(target) if follow => {
                    current = path::resolve_link_target(&current, target).ok_or_else(|| {
                        TransportError::NotFound {
                            path: path.to_owned(),
                        }
                    })?;
                }
                _ => return Ok(Self::record(path, entry)),
            }
        }
        Err(TransportError::Remote {
            path: path.to_owned(),
            message: "too many levels of symbolic links".to_owned(),
        })
    }

    fn listing(&self, dir: &str) -> Result<DirEntryList, TransportError> {
        let tree = self.state.tree.lock().unwrap();
        match tree.get(dir).map(|e| &e.kind) {
            Some(MockKind::Dir) => {}
            Some(_) => {
                return Err(TransportError::Remote {
                    path: dir.to_owned(),
                    message: "not a directory".to_owned(),
                });
            }
            None => {
                return Err(TransportError::NotFound {
                    path: dir.to_owned(),
                });
            }
        }
        let entries = tree
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && path::parent(p) == Some(dir))
            .map(|(p, e)| Self::record(p, e))
            .collect();
        Ok(DirEntryList::captured_now(entries))
    }

    fn parent_listing(&self, path: &str) -> Result<DirEntryList, TransportError> {
        self.listing(path::parent(path).unwrap_or("/"))
    }
}

impl Transport for MockTransport {
    fn display_name(&self) -> String {
        "mock".to_owned()
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn stat(&self, path: &str) -> Result<Stat, TransportError> {
        self.state.calls.stat.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.lookup(path, true)
    }

    async fn lstat(&self, path: &str) -> Result<Stat, TransportError> {
        self.state.calls.lstat.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.lookup(path, false)
    }

    async fn read_directory(&self, path: &str) -> Result<DirEntryList, TransportError> {
        self.state.calls.read_directory.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.listing(path)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<MoveResult, TransportError> {
        self.state.calls.mutations.fetch_add(1, Ordering::SeqCst);
        self.check(from)?;
        self.check(to)?;
        {
            let mut tree = self.state.tree.lock().unwrap();
            if !tree.contains_key(from) {
                return Err(TransportError::NotFound {
                    path: from.to_owned(),
                });
            }
            let moved: Vec<(String, MockEntry)> = tree
                .iter()
                .filter(|(p, _)| p.as_str() == from || path::is_descendant(p, from))
                .map(|(p, e)| (p.clone(), e.clone()))
                .collect();
            for (old, entry) in moved {
                tree.remove(&old);
                let new = if old == from {
                    to.to_owned()
                } else {
                    path::rebase(&old, from, to).unwrap()
                };
                tree.insert(new, entry);
            }
        }
        Ok(MoveResult {
            from: self.parent_listing(from)?,
            to: self.parent_listing(to)?,
        })
    }

    async fn delete(&self, path: &str, _is_directory: bool) -> Result<DirEntryList, TransportError> {
        self.state.calls.mutations.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        if !self.exists(path) {
            return Err(TransportError::NotFound {
                path: path.to_owned(),
            });
        }
        self.remove(path);
        self.parent_listing(path)
    }

    async fn upload_and_rename(
        &self,
        local: &Path,
        tmp_remote: &str,
        final_remote: &str,
    ) -> Result<DirEntryList, TransportError> {
        self.state.calls.mutations.fetch_add(1, Ordering::SeqCst);
        self.check(tmp_remote)?;
        self.check(final_remote)?;
        let content = tokio::fs::read(local).await?;
        {
            let mut tree = self.state.tree.lock().unwrap();
            let mtime_ms = tree.get(final_remote).map_or(1_000, |e| e.mtime_ms) + 60_000;
            tree.insert(
                final_remote.to_owned(),
                MockEntry {
                    kind: MockKind::File(Bytes::from(content)),
                    mtime_ms,
                    access: Access::READ | Access::WRITE,
                },
            );
        }
        self.parent_listing(final_remote)
    }

    async fn create(&self, path: &str, directory: bool) -> Result<DirEntryList, TransportError> {
        self.state.calls.mutations.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        if directory {
            self.add_dir(path);
        } else {
            self.add_file(path, "");
        }
        self.parent_listing(path)
    }

    async fn copy_path(&self, from: &str, to: &str) -> Result<DirEntryList, TransportError> {
        self.state.calls.mutations.fetch_add(1, Ordering::SeqCst);
        self.check(from)?;
        self.check(to)?;
        {
            let mut tree = self.state.tree.lock().unwrap();
            let entry = tree.get(from).cloned().ok_or_else(|| TransportError::NotFound {
                path: from.to_owned(),
            })?;
            tree.insert(to.to_owned(), entry);
        }
        self.parent_listing(to)
    }

    fn can_copy(&self) -> bool {
        self.state.server_copy.load(Ordering::SeqCst)
    }

    fn can_refresh_fast(&self) -> bool {
        self.state.refresh_fast.load(Ordering::SeqCst)
    }

    fn needs_client_side_polling_refresh(&self) -> bool {
        self.state.polling.load(Ordering::SeqCst)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.state.calls.download.fetch_add(1, Ordering::SeqCst);
        self.check(remote)?;
        let content = self.content(remote).ok_or_else(|| TransportError::NotFound {
            path: remote.to_owned(),
        })?;
        tokio::fs::write(local, &content).await?;
        Ok(())
    }

    async fn exec(&self, dir: &str, _script: &str) -> Result<ExecOutput, TransportError> {
        self.state.calls.exec.fetch_add(1, Ordering::SeqCst);
        self.check(dir)?;
        if self.state.hold_exec.load(Ordering::SeqCst) {
            let permit = self.state.exec_gate.acquire().await.unwrap();
            permit.forget();
        }
        Ok(ExecOutput {
            stdout: "ZIP=/tmp/.rfs_tmp_0.zip\nRC=12\n".to_owned(),
            exit_code: 0,
        })
    }
}

/// Records every event it receives.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<FsEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FsEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(kind, file path)` of every event, in order.
    pub fn summary(&self) -> Vec<(EventKind, String)> {
        self.events()
            .into_iter()
            .map(|e| (e.kind, e.file.path))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl FileChangeListener for Recorder {
    fn on_event(&self, event: &FsEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A filesystem over `transport` caching into a fresh temporary directory.
pub fn filesystem(transport: &MockTransport) -> (RemoteFileSystem<MockTransport>, tempfile::TempDir) {
    let cache = tempfile::tempdir().unwrap();
    let fs = RemoteFileSystem::new(transport.clone(), FsConfig::with_cache_dir(cache.path()));
    (fs, cache)
}

pub fn epoch_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}
