//! The only place nodes are created.
//!
//! [`NodeFactory`] keeps the identity cache consistent: for every path at most one valid node
//! is reachable. "Look up, else build and install" runs under a single factory lock, and a node
//! that loses an installation race is invalidated before it is handed back.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::cache::identity::IdentityCache;
use crate::entry::{EntryType, Stat};
use crate::event::FileChangeListener;
use crate::node::{DirectoryState, LinkState, NodeFlags, NodeKind, NodeType, RemoteNode};
use crate::path;

/// Creates, caches, re-keys and invalidates [`RemoteNode`]s.
pub struct NodeFactory {
    cache: IdentityCache<String, RemoteNode>,
    lock: Mutex<()>,
    next_id: AtomicU64,
    pending_listeners: scc::HashMap<String, Vec<Arc<dyn FileChangeListener>>>,
    unconfirmed_deletions: scc::HashMap<String, ()>,
}

impl NodeFactory {
    /// Creates a factory whose identity cache reclaims unreferenced nodes beyond `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: IdentityCache::new(capacity),
            lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            pending_listeners: scc::HashMap::new(),
            unconfirmed_deletions: scc::HashMap::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates and registers the root directory node, cached under `cache_root`.
    pub fn create_root(&self, cache_root: PathBuf) -> Arc<RemoteNode> {
        let root = Arc::new(RemoteNode::new(
            self.next_id(),
            path::ROOT.to_owned(),
            0,
            NodeKind::Directory(DirectoryState::new(cache_root)),
        ));
        self.register(&root);
        root
    }

    /// Returns the valid node cached at `path`, if any.
    #[must_use]
    pub fn get_cached_file_object(&self, path: &str) -> Option<Arc<RemoteNode>> {
        self.cache.get(path).filter(|node| node.is_valid())
    }

    /// Returns the node for `stat` below `parent`, creating it when needed.
    ///
    /// A cached node is reused only if it is valid, of the same kind, has the same parent and
    /// the same local cache location. Links are always routed through installation since their
    /// target may have changed. When `parent` is not a valid directory the node is created
    /// invalid and never cached.
    pub fn create_file_object(
        &self,
        parent: &Arc<RemoteNode>,
        stat: &Stat,
        dummy: bool,
    ) -> Arc<RemoteNode> {
        let child_path = path::join(&parent.path(), stat.name());
        let cache_path = parent
            .as_directory()
            .map(|dir| dir.cache_dir().join(stat.cache()));

        let (kind, expected_type) = match (stat.kind(), cache_path) {
            (_, None) => {
                debug!(path = %child_path, parent = %parent, "parent is not a directory");
                let orphan = Arc::new(RemoteNode::new(
                    self.next_id(),
                    child_path,
                    parent.id(),
                    NodeKind::Special {
                        cache_file: PathBuf::new(),
                    },
                ));
                orphan.invalidate();
                return orphan;
            }
            (EntryType::SymbolicLink, Some(_)) => (
                NodeKind::Symlink(LinkState::new(stat.link_target().unwrap_or_default())),
                NodeType::Symlink,
            ),
            (EntryType::Directory, Some(cache_dir)) => (
                NodeKind::Directory(DirectoryState::new(cache_dir)),
                NodeType::Directory,
            ),
            (EntryType::Regular, Some(cache_file)) => {
                (NodeKind::PlainFile { cache_file }, NodeType::PlainFile)
            }
            (EntryType::Other, Some(cache_file)) => {
                (NodeKind::Special { cache_file }, NodeType::Special)
            }
        };

        if expected_type != NodeType::Symlink
            && let Some(existing) = self.cache.get(child_path.as_str())
            && existing.is_valid()
            && existing.node_type() == expected_type
            && existing.parent_id() == parent.id()
            && existing.cache_path() == kind_cache_path(&kind)
        {
            trace!(path = %child_path, "identity cache hit");
            return existing;
        }

        let node = Arc::new(RemoteNode::new(
            self.next_id(),
            child_path,
            parent.id(),
            kind,
        ));
        if dummy {
            node.set_flag(NodeFlags::DUMMY, true);
        }
        let installed = self.put_if_absent(parent, node);
        if let (Some(state), Some(target)) = (installed.as_link(), stat.link_target())
            && state.target() != target
        {
            state.set_target(target.to_owned());
        }
        installed
    }

    /// Returns the node reached by following `link` (or a link-child) into the child `name`
    /// of the link's resolved target, `delegate` being that target-side child.
    ///
    /// A cached wrapper is reused only while it still wraps the same delegate instance.
    pub fn create_remote_link_child(
        &self,
        parent: &Arc<RemoteNode>,
        name: &str,
        delegate: Arc<RemoteNode>,
    ) -> Arc<RemoteNode> {
        let child_path = path::join(&parent.path(), name);
        if let Some(existing) = self.cache.get(child_path.as_str())
            && existing.is_valid()
            && existing.parent_id() == parent.id()
            && existing
                .link_child_delegate()
                .is_some_and(|current| Arc::ptr_eq(current, &delegate))
        {
            return existing;
        }

        let node = Arc::new(RemoteNode::new(
            self.next_id(),
            child_path,
            parent.id(),
            NodeKind::LinkChild { delegate },
        ));
        self.put_if_absent(parent, node)
    }

    /// Installs `node` unless a compatible valid node is already cached at its path.
    fn put_if_absent(&self, parent: &Arc<RemoteNode>, node: Arc<RemoteNode>) -> Arc<RemoteNode> {
        if !parent.is_valid() {
            debug!(node = %node, "parent already invalid, leaving node out of the cache");
            node.invalidate();
            return node;
        }

        let _guard = self.lock.lock();
        let key = node.path();
        if let Some(existing) = self.cache.get(key.as_str()) {
            if existing.is_valid() && is_same_incarnation(&existing, &node) {
                trace!(path = %key, "lost installation race");
                node.invalidate();
                return existing;
            }
            debug!(stale = %existing, "replacing stale node");
            self.invalidate_tree_locked(&existing);
        }

        self.cache.put(key.clone(), Arc::clone(&node));
        if let Some((_, listeners)) = self.pending_listeners.remove_sync(&key) {
            trace!(path = %key, count = listeners.len(), "attaching pending listeners");
            for listener in listeners {
                node.listeners().add(listener);
            }
        }
        node
    }

    /// Installs `node` unconditionally, invalidating whatever was cached at its path.
    pub fn register(&self, node: &Arc<RemoteNode>) {
        let _guard = self.lock.lock();
        if let Some(previous) = self.cache.put(node.path(), Arc::clone(node))
            && !Arc::ptr_eq(&previous, node)
        {
            self.invalidate_tree_locked(&previous);
        }
    }

    /// Invalidates `node` and every live descendant, evicting them from the cache.
    pub fn invalidate(&self, node: &Arc<RemoteNode>) {
        let _guard = self.lock.lock();
        self.invalidate_tree_locked(node);
    }

    /// Removes whatever is cached at `path`, invalidating it and its live descendants.
    ///
    /// Returns the removed node so callers can notify its listeners.
    pub fn invalidate_path(&self, path: &str) -> Option<Arc<RemoteNode>> {
        let _guard = self.lock.lock();
        let node = self.cache.remove(path)?;
        self.invalidate_tree_locked(&node);
        Some(node)
    }

    fn invalidate_tree_locked(&self, node: &Arc<RemoteNode>) {
        let by_parent = self.children_index();
        let mut stack = vec![Arc::clone(node)];
        while let Some(current) = stack.pop() {
            current.invalidate();
            self.cache.remove_if_same(current.path().as_str(), &current);
            if let Some(children) = by_parent.get(&current.id()) {
                stack.extend(children.iter().cloned());
            }
        }
    }

    /// Moves `node` from `old_path` to `new_path` and re-keys its live descendants.
    ///
    /// Descendants that were never materialized are not touched; they will simply be created at
    /// their new path when first looked up.
    pub fn rename(&self, old_path: &str, new_path: &str, node: &Arc<RemoteNode>) {
        let _guard = self.lock.lock();
        let by_parent = self.children_index();

        self.cache.remove_if_same(old_path, node);
        node.set_path(new_path.to_owned());
        if let Some(previous) = self.cache.put(new_path.to_owned(), Arc::clone(node))
            && !Arc::ptr_eq(&previous, node)
        {
            debug!(stale = %previous, "rename target was occupied");
            self.invalidate_tree_locked(&previous);
        }

        let mut stack: Vec<Arc<RemoteNode>> =
            by_parent.get(&node.id()).cloned().unwrap_or_default();
        let mut moved = 0usize;
        while let Some(child) = stack.pop() {
            let child_old = child.path();
            let Some(child_new) = path::rebase(&child_old, old_path, new_path) else {
                debug!(child = %child, "child outside renamed subtree, invalidating");
                child.invalidate();
                self.cache.remove_if_same(child_old.as_str(), &child);
                continue;
            };
            self.cache.remove_if_same(child_old.as_str(), &child);
            child.set_path(child_new.clone());
            self.cache.put(child_new, Arc::clone(&child));
            moved += 1;
            if let Some(grandchildren) = by_parent.get(&child.id()) {
                stack.extend(grandchildren.iter().cloned());
            }
        }
        debug!(from = old_path, to = new_path, descendants = moved, "renamed node");
    }

    /// Updates the target of the link cached at `link_path`.
    ///
    /// Returns the link when its target was changed. If the cached node turned out not to be a
    /// link under `parent`, it is invalidated instead.
    pub fn set_link(
        &self,
        parent: &Arc<RemoteNode>,
        link_path: &str,
        new_target: &str,
    ) -> Option<Arc<RemoteNode>> {
        let _guard = self.lock.lock();
        let node = self.cache.get(link_path).filter(|n| n.is_valid())?;
        match node.as_link() {
            Some(state) if node.parent_id() == parent.id() => {
                let old = state.set_target(new_target.to_owned());
                debug!(path = link_path, old = %old, new = new_target, "link target changed");
                Some(node)
            }
            _ => {
                debug!(node = %node, "expected a link, invalidating");
                self.invalidate_tree_locked(&node);
                None
            }
        }
    }

    /// Replaces the node at `parent/old.name` after its type changed from `old` to `new`.
    pub fn change_implementor(
        &self,
        parent: &Arc<RemoteNode>,
        old: &Stat,
        new: &Stat,
    ) -> Arc<RemoteNode> {
        let child_path = path::join(&parent.path(), old.name());
        debug!(
            path = %child_path,
            from = ?old.kind(),
            to = ?new.kind(),
            "entry changed type"
        );
        if let Some(previous) = self.invalidate_path(&child_path) {
            for listener in previous.listeners().drain() {
                self.add_pending_listener(&child_path, listener);
            }
        }
        self.create_file_object(parent, new, false)
    }

    /// Valid cached nodes whose parent is `node`.
    #[must_use]
    pub fn cached_children(&self, node: &RemoteNode) -> Vec<Arc<RemoteNode>> {
        let id = node.id();
        self.cache
            .values()
            .into_iter()
            .filter(|n| n.parent_id() == id && n.is_valid())
            .collect()
    }

    /// Valid cached nodes below `node`, parents before children.
    #[must_use]
    pub fn cached_descendants(&self, node: &RemoteNode) -> Vec<Arc<RemoteNode>> {
        let by_parent = self.children_index();
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::from([node.id()]);
        while let Some(id) = queue.pop_front() {
            for child in by_parent.get(&id).into_iter().flatten() {
                queue.push_back(child.id());
                out.push(Arc::clone(child));
            }
        }
        out
    }

    fn children_index(&self) -> FxHashMap<u64, Vec<Arc<RemoteNode>>> {
        let mut index: FxHashMap<u64, Vec<Arc<RemoteNode>>> = FxHashMap::default();
        for node in self.cache.values() {
            if node.is_valid() && node.parent_id() != 0 {
                index.entry(node.parent_id()).or_default().push(node);
            }
        }
        index
    }

    /// Attaches `listener` to the node at `path`, or queues it until that node is created.
    ///
    /// Returns `true` when the listener was attached to a live node right away.
    pub fn add_listener(&self, path: &str, listener: Arc<dyn FileChangeListener>) -> bool {
        let _guard = self.lock.lock();
        if let Some(node) = self.get_cached_file_object(path) {
            node.listeners().add(listener);
            return true;
        }
        self.add_pending_listener(path, listener);
        false
    }

    fn add_pending_listener(&self, path: &str, listener: Arc<dyn FileChangeListener>) {
        match self.pending_listeners.entry_sync(path.to_owned()) {
            scc::hash_map::Entry::Occupied(mut occ) => occ.get_mut().push(listener),
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(vec![listener]);
            }
        }
    }

    /// Detaches `listener` from the node at `path` or from the pending queue.
    pub fn remove_listener(&self, path: &str, listener: &Arc<dyn FileChangeListener>) -> bool {
        let _guard = self.lock.lock();
        if let Some(node) = self.get_cached_file_object(path)
            && node.listeners().remove(listener)
        {
            return true;
        }
        let mut removed = false;
        if let scc::hash_map::Entry::Occupied(mut occ) =
            self.pending_listeners.entry_sync(path.to_owned())
        {
            let queued = occ.get_mut();
            let before = queued.len();
            queued.retain(|l| !Arc::ptr_eq(l, listener));
            removed = queued.len() != before;
            if queued.is_empty() {
                let _ = occ.remove();
            }
        }
        removed
    }

    /// Number of listeners waiting for `path` to materialize.
    #[must_use]
    pub fn pending_listener_count(&self, path: &str) -> usize {
        self.pending_listeners
            .read_sync(path, |_, listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Records that `path` was deleted locally but the remote has not confirmed it yet.
    pub fn mark_unconfirmed_delete(&self, path: &str) {
        let _ = self.unconfirmed_deletions.insert_sync(path.to_owned(), ());
    }

    /// Clears the unconfirmed-deletion mark of `path`.
    pub fn unmark_unconfirmed_delete(&self, path: &str) -> bool {
        self.unconfirmed_deletions.remove_sync(path).is_some()
    }

    /// Whether `path` was deleted locally and the remote has not confirmed it yet.
    #[must_use]
    pub fn is_unconfirmed_delete(&self, path: &str) -> bool {
        self.unconfirmed_deletions.read_sync(path, |_, _| ()).is_some()
    }

    /// Number of cached nodes, valid or not yet swept.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Opportunistically reclaims unreferenced nodes. See
    /// [`IdentityCache::try_clean_dead_entries`].
    ///
    /// Directories with cached children stay, so a child's parent id keeps naming a live node.
    pub fn sweep(&self) -> Option<usize> {
        let parents: rustc_hash::FxHashSet<u64> = self
            .cache
            .values()
            .iter()
            .map(|node| node.parent_id())
            .collect();
        self.cache
            .try_clean_dead_entries_except(|node| parents.contains(&node.id()))
    }
}

fn kind_cache_path(kind: &NodeKind) -> Option<&std::path::Path> {
    match kind {
        NodeKind::PlainFile { cache_file } | NodeKind::Special { cache_file } => Some(cache_file),
        NodeKind::Directory(state) => Some(state.cache_dir()),
        NodeKind::Symlink(_) | NodeKind::LinkChild { .. } => None,
    }
}

fn is_same_incarnation(existing: &RemoteNode, candidate: &RemoteNode) -> bool {
    if existing.node_type() != candidate.node_type()
        || existing.parent_id() != candidate.parent_id()
    {
        return false;
    }
    match (existing.kind(), candidate.kind()) {
        (NodeKind::LinkChild { delegate: a }, NodeKind::LinkChild { delegate: b }) => {
            Arc::ptr_eq(a, b)
        }
        (NodeKind::Symlink(_), NodeKind::Symlink(_)) => true,
        _ => existing.cache_path() == candidate.cache_path(),
    }
}
