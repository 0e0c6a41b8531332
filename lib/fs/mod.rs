//! The consumer-facing view of a remote tree.
//!
//! [`RemoteFileSystem`] ties the pieces together: nodes come from the [`NodeFactory`], listings
//! from each directory's [`DirectoryStorage`](crate::storage::DirectoryStorage), and whatever is
//! missing from the [`Transport`], driven through the connection's [`ConnectionExecutor`].

mod content;
mod error;
mod links;
mod lock;
mod ops;
mod refresh;
mod suspend;

pub use error::FsError;
pub use lock::FileLock;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument, trace};

use crate::config::FsConfig;
use crate::entry::Stat;
use crate::event::FileChangeListener;
use crate::factory::NodeFactory;
use crate::node::{NodeKind, RemoteNode};
use crate::path;
use crate::transport::{ConnectionExecutor, Transport, TransportError, with_deadline};
use crate::zipper::Zipper;

/// How [`RemoteFileSystem::warmup`] prefetches a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupMode {
    /// Download file contents as one archive.
    FilesContent,
    /// List every directory below the starting point.
    RecursiveLs,
}

/// What a warmup request turned into.
#[derive(Debug)]
pub enum Warmup {
    /// An archive download is running in the background.
    Scheduled(tokio::task::JoinHandle<()>),
    /// The same archive is already being produced.
    Coalesced,
    /// Archive warmup is turned off in the configuration.
    Disabled,
    /// The subtree was listed; carries the number of directories refreshed.
    Listed { directories: usize },
}

struct Shared<T> {
    transport: T,
    executor: ConnectionExecutor,
    factory: Arc<NodeFactory>,
    zipper: Zipper<T>,
    config: FsConfig,
    root: Arc<RemoteNode>,
    locks: Arc<scc::HashMap<String, ()>>,
    /// Suspended directories and the dummy nodes created below each.
    suspended: Mutex<FxHashMap<String, Vec<Arc<RemoteNode>>>>,
}

/// A cached, identity-preserving view of the tree behind a [`Transport`].
///
/// Cheap to clone; clones share all state.
pub struct RemoteFileSystem<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for RemoteFileSystem<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> RemoteFileSystem<T> {
    /// Creates a filesystem over `transport`, caching below `config.cache_dir`.
    #[must_use]
    pub fn new(transport: T, config: FsConfig) -> Self {
        let executor = ConnectionExecutor::new(config.transport_parallelism);
        let factory = Arc::new(NodeFactory::new(config.identity_cache_capacity));
        let root = factory.create_root(config.cache_dir.clone());
        let zipper = Zipper::new(transport.clone(), executor.clone());
        debug!(
            remote = %transport.display_name(),
            cache_dir = %config.cache_dir.display(),
            "remote filesystem created"
        );
        Self {
            inner: Arc::new(Shared {
                transport,
                executor,
                factory,
                zipper,
                config,
                root,
                locks: Arc::new(scc::HashMap::new()),
                suspended: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// The node of the remote root directory.
    #[must_use]
    pub fn root(&self) -> Arc<RemoteNode> {
        Arc::clone(&self.inner.root)
    }

    /// The transport every remote call goes through.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// The identity cache handing out nodes.
    #[must_use]
    pub fn factory(&self) -> &Arc<NodeFactory> {
        &self.inner.factory
    }

    /// Settings this filesystem was created with.
    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.inner.config
    }

    /// Runs a transport call under the connection's concurrency bound.
    async fn call<F: Future>(&self, fut: F) -> F::Output {
        self.inner.executor.run(fut).await
    }

    fn ensure_valid(node: &RemoteNode) -> Result<(), FsError> {
        if node.is_valid() {
            Ok(())
        } else {
            Err(FsError::Invalidated { path: node.path() })
        }
    }

    fn ensure_connected(&self) -> Result<(), FsError> {
        if self.inner.transport.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                host: self.inner.transport.display_name(),
            }
            .into())
        }
    }

    /// Looks up the node at `path`, walking from the root.
    ///
    /// Through a symbolic link to a directory the walk continues in link-child nodes, so the
    /// returned node keeps the path it was asked for.
    #[instrument(name = "RemoteFileSystem::find", skip(self))]
    pub async fn find(&self, path: &str) -> Result<Option<Arc<RemoteNode>>, FsError> {
        let normalized = path::normalize(path).ok_or_else(|| TransportError::Relative {
            path: path.to_owned(),
        })?;
        let mut current = self.root();
        for name in path::components(&normalized) {
            match self.child(&current, name).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Looks up the child `name` of `dir`.
    pub async fn child(
        &self,
        dir: &Arc<RemoteNode>,
        name: &str,
    ) -> Result<Option<Arc<RemoteNode>>, FsError> {
        Self::ensure_valid(dir)?;
        match dir.kind() {
            NodeKind::Directory(_) => self.directory_child(dir, name).await,
            NodeKind::Symlink(_) | NodeKind::LinkChild { .. } => {
                let Some(delegate) = self.delegate_directory(dir, "lookup").await? else {
                    return Ok(None);
                };
                Ok(self
                    .directory_child(&delegate, name)
                    .await?
                    .map(|target| self.inner.factory.create_remote_link_child(dir, name, target)))
            }
            NodeKind::PlainFile { .. } | NodeKind::Special { .. } => {
                Err(FsError::NotADirectory { path: dir.path() })
            }
        }
    }

    /// Child lookup in a real directory: identity cache, then the listing, then the remote.
    async fn directory_child(
        &self,
        dir: &Arc<RemoteNode>,
        name: &str,
    ) -> Result<Option<Arc<RemoteNode>>, FsError> {
        let child_path = path::join(&dir.path(), name);
        if let Some(cached) = self.inner.factory.get_cached_file_object(&child_path)
            && cached.parent_id() == dir.id()
        {
            trace!(path = %child_path, "child served from identity cache");
            return Ok(Some(cached));
        }
        let storage = self.refresh_directory(dir, Some(name), false, false).await?;
        Ok(storage
            .get_valid_entry(name)
            .map(|stat| self.inner.factory.create_file_object(dir, &stat, false)))
    }

    /// Resolves a link or link-child to the directory it stands for.
    ///
    /// Returns `None` when it resolves to something that is not a directory.
    async fn delegate_directory(
        &self,
        node: &Arc<RemoteNode>,
        operation: &'static str,
    ) -> Result<Option<Arc<RemoteNode>>, FsError> {
        let delegate = self.content_target(node, operation).await?;
        Ok(delegate.is_directory().then_some(delegate))
    }

    /// Lists the children of `dir`, from the cached listing when there is one.
    #[instrument(name = "RemoteFileSystem::children", skip(self, dir), fields(dir = %dir))]
    pub async fn children(&self, dir: &Arc<RemoteNode>) -> Result<Vec<Arc<RemoteNode>>, FsError> {
        Self::ensure_valid(dir)?;
        match dir.kind() {
            NodeKind::Directory(_) => self.directory_children(dir).await,
            NodeKind::Symlink(_) | NodeKind::LinkChild { .. } => {
                let Some(delegate) = self.delegate_directory(dir, "list").await? else {
                    return Err(FsError::NotADirectory { path: dir.path() });
                };
                Ok(self
                    .directory_children(&delegate)
                    .await?
                    .into_iter()
                    .map(|child| {
                        let name = child.name();
                        self.inner
                            .factory
                            .create_remote_link_child(dir, &name, child)
                    })
                    .collect())
            }
            NodeKind::PlainFile { .. } | NodeKind::Special { .. } => {
                Err(FsError::NotADirectory { path: dir.path() })
            }
        }
    }

    async fn directory_children(
        &self,
        dir: &Arc<RemoteNode>,
    ) -> Result<Vec<Arc<RemoteNode>>, FsError> {
        let eager = self.inner.transport.can_refresh_fast() && self.inner.transport.is_connected();
        let storage = self.refresh_directory(dir, None, eager, false).await?;
        let mut children: Vec<Arc<RemoteNode>> = storage
            .list_valid()
            .iter()
            .map(|stat| self.inner.factory.create_file_object(dir, stat, false))
            .collect();
        for dummy in self.dummy_children(dir) {
            if !children.iter().any(|child| Arc::ptr_eq(child, &dummy)) {
                children.push(dummy);
            }
        }
        Ok(children)
    }

    /// Re-lists `dir` from the remote, firing change events for whatever differs.
    ///
    /// When the transport cannot push changes, every directory below `dir` whose listing is
    /// loaded is re-listed too.
    #[instrument(name = "RemoteFileSystem::refresh", skip(self, dir), fields(dir = %dir))]
    pub async fn refresh(&self, dir: &Arc<RemoteNode>) -> Result<(), FsError> {
        Self::ensure_valid(dir)?;
        let dir = if dir.is_directory() {
            Arc::clone(dir)
        } else {
            self.delegate_directory(dir, "refresh")
                .await?
                .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?
        };
        self.refresh_directory(&dir, None, true, false).await?;
        if !self.inner.transport.needs_client_side_polling_refresh() {
            return Ok(());
        }
        for sub in self.inner.factory.cached_descendants(&dir) {
            let loaded = sub
                .as_directory()
                .is_some_and(|state| !state.storage().is_empty_sentinel());
            if !loaded || !sub.is_valid() {
                continue;
            }
            match self.refresh_directory(&sub, None, true, false).await {
                Ok(_) => {}
                Err(e) if e.is_not_connected() => return Err(e),
                Err(e) => debug!(dir = %sub, error = %e, "could not poll directory"),
            }
        }
        Ok(())
    }

    /// Stats `path` on the remote, following a final link. Nothing is cached.
    #[instrument(name = "RemoteFileSystem::stat", skip(self))]
    pub async fn stat(&self, path: &str) -> Result<Stat, FsError> {
        let path = path::normalize(path).ok_or_else(|| TransportError::Relative {
            path: path.to_owned(),
        })?;
        let deadline = self.inner.config.stat_timeout();
        Ok(self
            .call(with_deadline(
                "stat",
                &path,
                deadline,
                self.inner.transport.stat(&path),
            ))
            .await?)
    }

    /// Stats `path` on the remote without following a final link. Nothing is cached.
    #[instrument(name = "RemoteFileSystem::lstat", skip(self))]
    pub async fn lstat(&self, path: &str) -> Result<Stat, FsError> {
        let path = path::normalize(path).ok_or_else(|| TransportError::Relative {
            path: path.to_owned(),
        })?;
        let deadline = self.inner.config.stat_timeout();
        Ok(self
            .call(with_deadline(
                "lstat",
                &path,
                deadline,
                self.inner.transport.lstat(&path),
            ))
            .await?)
    }

    /// The cached metadata of `node`, as recorded in its parent's listing.
    pub async fn metadata(&self, node: &Arc<RemoteNode>) -> Result<Stat, FsError> {
        Self::ensure_valid(node)?;
        if let Some(delegate) = node.link_child_delegate() {
            let delegate = Arc::clone(delegate);
            Self::ensure_valid(&delegate)?;
            return Ok(self.real_metadata(&delegate).await?.renamed(node.name()));
        }
        self.real_metadata(node).await
    }

    async fn real_metadata(&self, node: &Arc<RemoteNode>) -> Result<Stat, FsError> {
        let Some(parent) = self.parent_of(node).await? else {
            return self.stat(path::ROOT).await;
        };
        let name = node.name();
        let storage = self.refresh_directory(&parent, Some(&name), false, false).await?;
        storage
            .get_valid_entry(&name)
            .ok_or_else(|| FsError::not_found("stat", node.path()))
    }

    /// The live parent directory of `node`, `None` for the root.
    async fn parent_of(&self, node: &RemoteNode) -> Result<Option<Arc<RemoteNode>>, FsError> {
        let Some(parent_path) = node.parent_path() else {
            return Ok(None);
        };
        if let Some(parent) = self.inner.factory.get_cached_file_object(&parent_path)
            && parent.id() == node.parent_id()
        {
            return Ok(Some(parent));
        }
        let parent = self
            .find(&parent_path)
            .await?
            .ok_or_else(|| FsError::not_found("find parent of", node.path()))?;
        Ok(Some(parent))
    }

    /// Subscribes `listener` to changes of `path`.
    ///
    /// When nothing is materialized at `path` yet, the listener is queued and attached as soon
    /// as the node is created.
    pub async fn add_listener(
        &self,
        path: &str,
        listener: Arc<dyn FileChangeListener>,
    ) -> Result<bool, FsError> {
        let path = path::normalize(path).ok_or_else(|| TransportError::Relative {
            path: path.to_owned(),
        })?;
        let attached = self.inner.factory.add_listener(&path, listener);
        if attached
            && let Some(node) = self.inner.factory.get_cached_file_object(&path)
            && node.is_link()
        {
            self.sync_link_forwarding(&node).await?;
        }
        Ok(attached)
    }

    /// Unsubscribes `listener` from `path`. Returns whether it was subscribed.
    pub fn remove_listener(&self, path: &str, listener: &Arc<dyn FileChangeListener>) -> bool {
        let Some(path) = path::normalize(path) else {
            return false;
        };
        let removed = self.inner.factory.remove_listener(&path, listener);
        if let Some(node) = self.inner.factory.get_cached_file_object(&path)
            && node.listeners().is_empty()
            && let Some(state) = node.as_link()
            && let Some(forwarding) = state.take_forwarding()
        {
            self.drop_forwarding(&forwarding);
        }
        removed
    }

    /// Takes the in-process lock of `node`'s path.
    pub fn lock(&self, node: &RemoteNode) -> Result<FileLock, FsError> {
        Self::ensure_valid(node)?;
        FileLock::acquire(&self.inner.locks, node.path())
    }

    /// Prefetches the subtree at `dir`.
    #[instrument(name = "RemoteFileSystem::warmup", skip(self, dir), fields(dir = %dir))]
    pub async fn warmup(
        &self,
        dir: &Arc<RemoteNode>,
        mode: WarmupMode,
        extensions: &[String],
    ) -> Result<Warmup, FsError> {
        Self::ensure_valid(dir)?;
        let dir = if dir.is_directory() {
            Arc::clone(dir)
        } else {
            self.delegate_directory(dir, "warm up")
                .await?
                .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?
        };
        match mode {
            WarmupMode::FilesContent => {
                if !self.inner.config.zip_enabled {
                    return Ok(Warmup::Disabled);
                }
                self.ensure_connected()?;
                let Some(cache_dir) = dir.cache_path() else {
                    return Err(FsError::NotADirectory { path: dir.path() });
                };
                Ok(self
                    .inner
                    .zipper
                    .schedule(&dir.path(), cache_dir, extensions)
                    .map_or(Warmup::Coalesced, Warmup::Scheduled))
            }
            WarmupMode::RecursiveLs => {
                let mut queue = std::collections::VecDeque::from([dir]);
                let mut directories = 0usize;
                while let Some(current) = queue.pop_front() {
                    self.refresh_directory(&current, None, true, false).await?;
                    directories += 1;
                    // Links are not followed, so cycles cannot keep the walk going.
                    queue.extend(
                        self.directory_children(&current)
                            .await?
                            .into_iter()
                            .filter(|child| child.is_directory()),
                    );
                }
                Ok(Warmup::Listed { directories })
            }
        }
    }

    /// Records that `path` was deleted locally and the remote has not confirmed it yet.
    pub fn mark_unconfirmed_delete(&self, path: &str) {
        self.inner.factory.mark_unconfirmed_delete(path);
    }

    /// Forgets a pending deletion of `path`. Returns whether one was recorded.
    pub fn unmark_unconfirmed_delete(&self, path: &str) -> bool {
        self.inner.factory.unmark_unconfirmed_delete(path)
    }

    /// See [`NodeFactory::is_unconfirmed_delete`].
    #[must_use]
    pub fn is_unconfirmed_delete(&self, path: &str) -> bool {
        self.inner.factory.is_unconfirmed_delete(path)
    }

    /// Reclaims unreferenced nodes from the identity cache, unless a sweep is already running.
    pub fn sweep(&self) -> Option<usize> {
        self.inner.factory.sweep()
    }
}
