//! File object nodes.
//!
//! A [`RemoteNode`] stands for one remote path. Nodes are owned by the identity cache in the
//! [`NodeFactory`](crate::factory::NodeFactory) and handed out as `Arc`s; the parent is kept only
//! as a non-owning id, and links point at their delegate through the filesystem rather than a
//! stored pointer (except link-children, which wrap the delegate they were created for).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bitflags::bitflags;

use crate::event::{FileChangeListener, ListenerList, NodeRef};
use crate::path;
use crate::storage::DirectoryStorage;

bitflags! {
    /// Transient per-node state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u8 {
        /// Created locally while uploads are suspended; not on the remote yet.
        const DUMMY             = 1 << 0;
        /// The last listing attempt failed because the connection dropped.
        const CONNECTION_ISSUES = 1 << 1;
        /// A local write is being uploaded.
        const PENDING_DELIVERY  = 1 << 2;
    }
}

/// The kind tag of a node, without its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// A regular file.
    PlainFile,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A [`NodeKind::LinkChild`] wrapper.
    LinkChild,
    /// Pipes, sockets and devices.
    Special,
}

/// State of a directory node.
#[derive(Debug)]
pub struct DirectoryState {
    cache_dir: PathBuf,
    storage: RwLock<Arc<DirectoryStorage>>,
    /// Serializes listing refreshes of this directory.
    pub(crate) refresh_lock: tokio::sync::Mutex<()>,
}

impl DirectoryState {
    /// State for a directory cached below `cache_dir`, with no listing loaded.
    #[must_use]
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            storage: RwLock::new(DirectoryStorage::empty()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Local directory holding cached children and the listing file.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The in-memory listing; the empty sentinel until first loaded.
    #[must_use]
    pub fn storage(&self) -> Arc<DirectoryStorage> {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_storage(&self, storage: Arc<DirectoryStorage>) {
        *self.storage.write().unwrap_or_else(PoisonError::into_inner) = storage;
    }
}

/// A listener registered on a link's delegate that re-dispatches events on the link.
///
/// Holding the delegate keeps it, and the listener attached to it, out of cache sweeps.
pub(crate) struct Forwarding {
    pub(crate) delegate: Arc<RemoteNode>,
    pub(crate) listener: Arc<dyn FileChangeListener>,
}

/// State of a symbolic-link node.
pub struct LinkState {
    target: RwLock<String>,
    forwarding: Mutex<Option<Forwarding>>,
}

impl std::fmt::Debug for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkState")
            .field("target", &self.target())
            .finish_non_exhaustive()
    }
}

impl LinkState {
    /// State for a link pointing at the raw `target`.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: RwLock::new(target.into()),
            forwarding: Mutex::new(None),
        }
    }

    /// The raw target string, as stored on the remote.
    #[must_use]
    pub fn target(&self) -> String {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the target, returning the previous one.
    pub(crate) fn set_target(&self, target: String) -> String {
        std::mem::replace(
            &mut *self.target.write().unwrap_or_else(PoisonError::into_inner),
            target,
        )
    }

    pub(crate) fn take_forwarding(&self) -> Option<Forwarding> {
        self.forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Installs `forwarding`, returning the one it replaces.
    pub(crate) fn replace_forwarding(&self, forwarding: Forwarding) -> Option<Forwarding> {
        self.forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(forwarding)
    }

    /// Path of the node events are currently forwarded from.
    #[must_use]
    pub fn forwarded_from(&self) -> Option<String> {
        self.forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.delegate.path())
    }
}

/// The node-specific part of a [`RemoteNode`].
#[derive(Debug)]
pub enum NodeKind {
    /// A regular file with its local content cache.
    PlainFile { cache_file: PathBuf },
    /// A directory with its local cache directory and listing.
    Directory(DirectoryState),
    /// A symbolic link and its current target.
    Symlink(LinkState),
    /// The node reached by walking through a link into its target's subtree.
    LinkChild { delegate: Arc<RemoteNode> },
    /// Pipes, sockets and devices. They have no content.
    Special { cache_file: PathBuf },
}

/// One remote path.
#[derive(Debug)]
pub struct RemoteNode {
    id: u64,
    path: RwLock<String>,
    parent_id: AtomicU64,
    kind: NodeKind,
    valid: AtomicBool,
    flags: AtomicU8,
    listeners: ListenerList,
}

impl RemoteNode {
    pub(crate) fn new(id: u64, path: String, parent_id: u64, kind: NodeKind) -> Self {
        Self {
            id,
            path: RwLock::new(path),
            parent_id: AtomicU64::new(parent_id),
            kind,
            valid: AtomicBool::new(true),
            flags: AtomicU8::new(0),
            listeners: ListenerList::default(),
        }
    }

    /// Unique id of this node instance. Never reused.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current absolute path.
    #[must_use]
    pub fn path(&self) -> String {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_path(&self, path: String) {
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path;
    }

    /// Last path component, empty for the root.
    #[must_use]
    pub fn name(&self) -> String {
        path::file_name(&self.path()).to_owned()
    }

    /// Parent directory path, `None` for the root.
    #[must_use]
    pub fn parent_path(&self) -> Option<String> {
        path::parent(&self.path()).map(str::to_owned)
    }

    /// Id of the parent node, `0` for the root.
    #[must_use]
    pub fn parent_id(&self) -> u64 {
        self.parent_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_parent_id(&self, parent_id: u64) {
        self.parent_id.store(parent_id, Ordering::Release);
    }

    /// The kind of node, with its kind-specific state.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The kind tag, without the per-kind state.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::PlainFile { .. } => NodeType::PlainFile,
            NodeKind::Directory(_) => NodeType::Directory,
            NodeKind::Symlink(_) => NodeType::Symlink,
            NodeKind::LinkChild { .. } => NodeType::LinkChild,
            NodeKind::Special { .. } => NodeType::Special,
        }
    }

    /// Directory state, for directories only.
    #[must_use]
    pub fn as_directory(&self) -> Option<&DirectoryState> {
        match &self.kind {
            NodeKind::Directory(state) => Some(state),
            _ => None,
        }
    }

    /// Link state, for symbolic links only.
    #[must_use]
    pub fn as_link(&self) -> Option<&LinkState> {
        match &self.kind {
            NodeKind::Symlink(state) => Some(state),
            _ => None,
        }
    }

    /// The delegate a link-child wraps.
    #[must_use]
    pub fn link_child_delegate(&self) -> Option<&Arc<RemoteNode>> {
        match &self.kind {
            NodeKind::LinkChild { delegate } => Some(delegate),
            _ => None,
        }
    }

    /// Local cache location: the content file for files, the cache directory for directories.
    #[must_use]
    pub fn cache_path(&self) -> Option<&Path> {
        match &self.kind {
            NodeKind::PlainFile { cache_file } | NodeKind::Special { cache_file } => {
                Some(cache_file)
            }
            NodeKind::Directory(state) => Some(state.cache_dir()),
            NodeKind::Symlink(_) | NodeKind::LinkChild { .. } => None,
        }
    }

    /// Whether this is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    /// Whether this is a symbolic link. Link-children are not.
    #[must_use]
    pub fn is_link(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink(_))
    }

    /// Whether the node still stands for its path. Invalid nodes never become valid again.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the node invalid. Returns whether it was valid before.
    pub(crate) fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Current state bits.
    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: NodeFlags) -> bool {
        self.flags().contains(flag)
    }

    pub(crate) fn set_flag(&self, flag: NodeFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    /// Listeners notified of changes to this node.
    #[must_use]
    pub fn listeners(&self) -> &ListenerList {
        &self.listeners
    }

    /// A non-owning reference to this node as it is now.
    #[must_use]
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.path(), self.id)
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.path(), self.id)?;
        if !self.is_valid() {
            write!(f, " (invalid)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_toggle_independently() {
        let node = RemoteNode::new(
            1,
            "/a".to_owned(),
            0,
            NodeKind::PlainFile {
                cache_file: PathBuf::from("/tmp/a"),
            },
        );
        node.set_flag(NodeFlags::DUMMY, true);
        node.set_flag(NodeFlags::PENDING_DELIVERY, true);
        node.set_flag(NodeFlags::DUMMY, false);
        assert_eq!(node.flags(), NodeFlags::PENDING_DELIVERY);
    }

    #[test]
    fn invalidate_reports_previous_state() {
        let node = RemoteNode::new(
            2,
            "/d".to_owned(),
            0,
            NodeKind::Directory(DirectoryState::new(PathBuf::from("/tmp/d"))),
        );
        assert!(node.invalidate());
        assert!(!node.invalidate());
        assert!(!node.is_valid());
        assert!(node.as_directory().unwrap().storage().is_empty_sentinel());
    }

    #[test]
    fn link_target_can_be_replaced() {
        let state = LinkState::new("old");
        assert_eq!(state.set_target("new".to_owned()), "old");
        assert_eq!(state.target(), "new");
    }
}
