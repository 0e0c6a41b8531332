//! Keeping directory listings in step with the remote.
//!
//! A refresh reads the current entries, diffs them against the cached listing, persists the
//! result, installs it and only then notifies listeners of what changed.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, instrument, trace, warn};

use super::{FsError, RemoteFileSystem};
use crate::entry::{DirEntry, DirEntryList, Stat};
use crate::event::{EventKind, FsEvent, NodeRef};
use crate::node::{NodeFlags, RemoteNode};
use crate::path;
use crate::storage::{DirectoryStorage, STORAGE_FILE_NAME, StorageError, report_format_error};
use crate::transport::{Transport, TransportError};

/// Prefix of the temporary remote names uploads go through.
pub(super) const UPLOAD_PREFIX: &str = ".rfs_tmp_";

/// The name an in-progress upload will be renamed to, if `name` is such an upload.
fn pending_upload_base(name: &str) -> Option<&str> {
    let (base, millis) = name.strip_prefix(UPLOAD_PREFIX)?.rsplit_once('_')?;
    (!base.is_empty() && !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit()))
        .then_some(base)
}

/// Picks a cache name that no other entry of the directory uses, ignoring case.
fn unique_cache_name(base: &str, taken: &mut FxHashSet<String>) -> String {
    if taken.insert(base.to_lowercase()) {
        return base.to_owned();
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}_{n}");
        if taken.insert(candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

pub(super) async fn blocking<R: Send + 'static>(
    f: impl FnOnce() -> R + Send + 'static,
) -> Result<R, FsError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::Io(io::Error::other(e)))
}

/// Loads a listing file, discarding it when it cannot be used.
///
/// `Ok(None)` means there is nothing usable on disk.
fn load_or_discard(file: &Path) -> Result<Option<DirectoryStorage>, StorageError> {
    match DirectoryStorage::load(file) {
        Ok(storage) => Ok(Some(storage)),
        Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.requires_discard() => {
            match &e {
                StorageError::Format { source, .. } => report_format_error(file, source),
                other => debug!(path = %file.display(), error = %other, "discarding listing cache"),
            }
            if let Err(remove_err) = std::fs::remove_file(file) {
                debug!(path = %file.display(), error = %remove_err, "could not remove listing cache");
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Removes a local cache file or directory, if present.
fn remove_local(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "could not drop local cache");
    }
}

/// An event and the node whose listeners receive it.
struct Notice {
    target: Arc<RemoteNode>,
    event: FsEvent,
}

/// An installed listing and the follow-up work that has to wait for the refresh lock.
#[must_use]
struct Applied {
    storage: Arc<DirectoryStorage>,
    relinked: Vec<Arc<RemoteNode>>,
    notices: Vec<Notice>,
}

impl<T: Transport> RemoteFileSystem<T> {
    /// The in-memory listing of `dir`, loading it from disk on first use.
    ///
    /// Returns the empty sentinel when nothing usable is on disk.
    pub(super) async fn load_storage(
        &self,
        dir: &RemoteNode,
    ) -> Result<Arc<DirectoryStorage>, FsError> {
        let state = dir
            .as_directory()
            .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?;
        let current = state.storage();
        if !current.is_empty_sentinel() {
            return Ok(current);
        }
        let file = state.cache_dir().join(STORAGE_FILE_NAME);
        match blocking(move || load_or_discard(&file)).await?? {
            Some(storage) => {
                let storage = Arc::new(storage);
                state.set_storage(Arc::clone(&storage));
                Ok(storage)
            }
            None => Ok(current),
        }
    }

    /// The record of `dir` in its parent's listing, without touching the remote.
    fn cached_stat(&self, dir: &RemoteNode) -> Option<Stat> {
        let parent = self
            .inner
            .factory
            .get_cached_file_object(&dir.parent_path()?)?;
        parent
            .as_directory()?
            .storage()
            .get_valid_entry(&dir.name())
    }

    /// Brings the listing of `dir` up to date.
    ///
    /// Without `force`, a listing that is loaded and knows `requested` is returned as-is.
    #[instrument(name = "RemoteFileSystem::refresh_directory", skip(self, dir), fields(dir = %dir))]
    pub(super) async fn refresh_directory(
        &self,
        dir: &Arc<RemoteNode>,
        requested: Option<&str>,
        force: bool,
        expected: bool,
    ) -> Result<Arc<DirectoryStorage>, FsError> {
        let state = dir
            .as_directory()
            .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?;
        if dir.has_flag(NodeFlags::DUMMY) {
            trace!("held-back directory has no remote listing");
            return Ok(state.storage());
        }
        if force {
            self.ensure_connected()?;
        }
        let old = self.load_storage(dir).await?;
        let is_fresh = |storage: &DirectoryStorage| {
            !storage.is_empty_sentinel() && requested.is_none_or(|name| storage.is_known(name))
        };
        if !force && is_fresh(&old) {
            return Ok(old);
        }

        self.ensure_connected()?;
        let applied = {
            let _guard = state.refresh_lock.lock().await;
            let current = state.storage();
            if !force && !Arc::ptr_eq(&current, &old) && is_fresh(&current) {
                trace!("listing refreshed concurrently");
                return Ok(current);
            }
            match self.read_entries(dir, &current, requested, force).await {
                Ok(entries) => {
                    let cause = if expected { requested } else { None };
                    self.apply_entries(dir, &current, entries, cause).await?
                }
                Err(e) => self.refresh_failed(dir, &current, e).await?,
            }
        };
        Ok(self.publish(applied).await)
    }

    /// Handles a failed listing. A directory that is gone on the remote loses all of its
    /// children and falls back to the empty sentinel.
    async fn refresh_failed(
        &self,
        dir: &Arc<RemoteNode>,
        current: &DirectoryStorage,
        err: TransportError,
    ) -> Result<Applied, FsError> {
        if !self.inner.transport.is_connected() {
            debug!(dir = %dir, error = %err, "listing failed, connection lost");
            dir.set_flag(NodeFlags::CONNECTION_ISSUES, true);
            return Err(TransportError::NotConnected {
                host: self.inner.transport.display_name(),
            }
            .into());
        }
        if !err.is_not_found() {
            return Err(err.into());
        }

        debug!(dir = %dir, "directory vanished on the remote");
        let mut applied = self.apply_entries(dir, current, Vec::new(), None).await?;
        for orphan in self.inner.factory.cached_children(dir) {
            let descendants = self.inner.factory.cached_descendants(&orphan);
            if let Some(node) = self.inner.factory.invalidate_path(&orphan.path()) {
                for gone in descendants.iter().chain(std::iter::once(&node)) {
                    applied.notices.push(Notice {
                        target: Arc::clone(gone),
                        event: FsEvent::new(EventKind::Deleted, gone.node_ref(), gone.node_ref(), false),
                    });
                }
            }
        }
        let empty = DirectoryStorage::empty();
        if let Some(state) = dir.as_directory() {
            state.set_storage(Arc::clone(&empty));
            let file = state.cache_dir().join(STORAGE_FILE_NAME);
            if let Err(e) = tokio::fs::remove_file(&file).await
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %file.display(), error = %e, "could not drop listing cache");
            }
        }
        applied.storage = empty;
        Ok(applied)
    }

    async fn read_entries(
        &self,
        dir: &RemoteNode,
        old: &DirectoryStorage,
        requested: Option<&str>,
        force: bool,
    ) -> Result<Vec<DirEntry>, TransportError> {
        let dir_path = dir.path();
        let transport = &self.inner.transport;
        let readable = self.cached_stat(dir).is_none_or(|stat| stat.can_read());

        if readable {
            let listing = self.call(transport.read_directory(&dir_path)).await?;
            let mut entries: Vec<DirEntry> = listing
                .into_entries()
                .into_iter()
                .map(DirEntry::Valid)
                .collect();
            if let Some(name) = requested
                && !entries.iter().any(|e| e.name() == name)
            {
                entries.push(DirEntry::placeholder(name));
            }
            return Ok(entries);
        }

        trace!(dir = %dir_path, "directory is not readable, probing names");
        let mut names: Vec<String> = old
            .list_valid()
            .iter()
            .map(|stat| stat.name().to_owned())
            .collect();
        if let Some(name) = requested
            && !names.iter().any(|n| n == name)
        {
            names.push(name.to_owned());
        }
        let mut entries = Vec::with_capacity(names.len());
        for name in &names {
            let child = path::join(&dir_path, name);
            match self.call(transport.lstat(&child)).await {
                Ok(stat) => entries.push(DirEntry::Valid(stat)),
                Err(e) if e.is_not_found() => entries.push(DirEntry::placeholder(name.clone())),
                Err(e) => return Err(e),
            }
        }
        if !force {
            entries.extend(
                old.list_all()
                    .into_iter()
                    .filter(|entry| !names.iter().any(|n| n == entry.name())),
            );
        }
        Ok(entries)
    }

    /// Replaces the listing of `dir` with a snapshot returned by a mutating transport call.
    pub(super) async fn apply_listing(
        &self,
        dir: &Arc<RemoteNode>,
        listing: DirEntryList,
        cause: Option<&str>,
    ) -> Result<Arc<DirectoryStorage>, FsError> {
        let state = dir
            .as_directory()
            .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?;
        self.load_storage(dir).await?;
        let entries = listing
            .into_entries()
            .into_iter()
            .map(DirEntry::Valid)
            .collect();
        let applied = {
            let _guard = state.refresh_lock.lock().await;
            let old = state.storage();
            self.apply_entries(dir, &old, entries, cause).await?
        };
        Ok(self.publish(applied).await)
    }

    /// Re-targets the forwarding of changed links and fires the collected events.
    ///
    /// Must run without any refresh lock held: resolving a link target may list the very
    /// directory that was just refreshed.
    async fn publish(&self, applied: Applied) -> Arc<DirectoryStorage> {
        let Applied {
            storage,
            relinked,
            notices,
        } = applied;
        for link in relinked {
            if let Err(e) = self.sync_link_forwarding(&link).await {
                debug!(link = %link, error = %e, "could not re-target link forwarding");
            }
        }
        for notice in notices {
            notice.target.listeners().fire(&notice.event);
        }
        storage
    }

    /// Diffs `fresh` against `old`, updates nodes, then installs and persists the new listing.
    /// `cause` names the entry an operation of ours touched. Events are returned, not fired.
    async fn apply_entries(
        &self,
        dir: &Arc<RemoteNode>,
        old: &DirectoryStorage,
        fresh: Vec<DirEntry>,
        cause: Option<&str>,
    ) -> Result<Applied, FsError> {
        let state = dir
            .as_directory()
            .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?;
        let factory = &self.inner.factory;
        let cache_dir = state.cache_dir().to_path_buf();
        let dir_path = dir.path();
        let dir_ref = dir.node_ref();
        let loaded = !old.is_empty_sentinel();
        let had_issues = dir.has_flag(NodeFlags::CONNECTION_ISSUES);

        let live_child = |name: &str| {
            factory
                .get_cached_file_object(&path::join(&dir_path, name))
                .filter(|node| node.parent_id() == dir.id())
        };
        let dir_event = |kind: EventKind, name: &str, node: Option<&Arc<RemoteNode>>| Notice {
            target: Arc::clone(dir),
            event: FsEvent::new(
                kind,
                dir_ref.clone(),
                node.map_or_else(
                    || NodeRef::unmaterialized(path::join(&dir_path, name)),
                    |n| n.node_ref(),
                ),
                cause == Some(name),
            ),
        };
        let self_event = |kind: EventKind, node: &Arc<RemoteNode>| Notice {
            target: Arc::clone(node),
            event: FsEvent::new(kind, node.node_ref(), node.node_ref(), cause == Some(&*node.name())),
        };

        let mut changed = !loaded;
        let mut notices: Vec<Notice> = Vec::new();
        let mut stale_local: Vec<PathBuf> = Vec::new();
        let mut relinked: Vec<Arc<RemoteNode>> = Vec::new();
        let mut result: BTreeMap<String, DirEntry> = BTreeMap::new();
        let mut taken: FxHashSet<String> = FxHashSet::default();
        let mut added: Vec<Stat> = Vec::new();
        let mut retyped: Vec<(Stat, Stat)> = Vec::new();

        for entry in fresh {
            let stat = match entry {
                DirEntry::Placeholder(name) => {
                    changed |= !old.is_known(&name) || old.get_valid_entry(&name).is_some();
                    result.insert(name.clone(), DirEntry::Placeholder(name));
                    continue;
                }
                DirEntry::Valid(stat) => stat,
            };
            if let Some(base) = pending_upload_base(stat.name())
                && live_child(base).is_some_and(|n| n.has_flag(NodeFlags::PENDING_DELIVERY))
            {
                trace!(name = stat.name(), "skipping in-flight upload");
                continue;
            }

            let Some(prev) = old.get_valid_entry(stat.name()) else {
                added.push(stat);
                changed = true;
                continue;
            };
            if !prev.same_type(&stat) {
                retyped.push((prev, stat));
                changed = true;
                continue;
            }

            let stat = stat.with_cache(prev.cache());
            taken.insert(prev.cache().to_lowercase());
            let name = stat.name().to_owned();
            let node = live_child(&name);
            let mut child_changed = false;

            if stat.is_plain_file()
                && (prev.size() != stat.size() || !prev.same_last_modified(&stat))
            {
                child_changed = true;
                if !node
                    .as_ref()
                    .is_some_and(|n| n.has_flag(NodeFlags::PENDING_DELIVERY))
                {
                    stale_local.push(cache_dir.join(stat.cache()));
                }
            }
            if stat.is_link() && prev.link_target() != stat.link_target() {
                child_changed = true;
                let target = stat.link_target().unwrap_or_default();
                if let Some(link) = factory.set_link(dir, &path::join(&dir_path, &name), target) {
                    relinked.push(link);
                }
            }
            if !prev.same_access(&stat) {
                child_changed = true;
                if let Some(node) = &node {
                    notices.push(self_event(EventKind::AttributeChanged, node));
                }
                notices.push(dir_event(EventKind::AttributeChanged, &name, node.as_ref()));
            }
            if !prev.same_inode(&stat) {
                child_changed = true;
            }
            if child_changed {
                if let Some(node) = &node {
                    notices.push(self_event(EventKind::Changed, node));
                }
                notices.push(dir_event(EventKind::Changed, &name, node.as_ref()));
            }
            changed |= child_changed || prev != stat;
            result.insert(name, DirEntry::Valid(stat));
        }

        for stat in added {
            let cache = unique_cache_name(stat.cache(), &mut taken);
            let stat = stat.with_cache(cache);
            let name = stat.name().to_owned();
            if loaded || had_issues || cause == Some(name.as_str()) {
                notices.push(dir_event(EventKind::Created, &name, live_child(&name).as_ref()));
            }
            result.insert(name, DirEntry::Valid(stat));
        }

        let mut retyped_nodes = Vec::new();
        for (prev, stat) in retyped {
            stale_local.push(cache_dir.join(prev.cache()));
            let cache = unique_cache_name(&crate::entry::escape_cache_name(stat.name()), &mut taken);
            let stat = stat.with_cache(cache);
            let name = stat.name().to_owned();
            if live_child(&name).is_some() {
                retyped_nodes.push((prev, stat.clone()));
            }
            notices.push(dir_event(EventKind::Changed, &name, None));
            result.insert(name, DirEntry::Valid(stat));
        }
        for (prev, stat) in retyped_nodes {
            let node = factory.change_implementor(dir, &prev, &stat);
            trace!(node = %node, "replaced node after type change");
        }

        for prev in old.list_valid() {
            if result.get(prev.name()).is_some_and(DirEntry::is_valid) {
                continue;
            }
            changed = true;
            stale_local.push(cache_dir.join(prev.cache()));
            let child_path = path::join(&dir_path, prev.name());
            let removed = live_child(prev.name()).and_then(|node| {
                let descendants = factory.cached_descendants(&node);
                factory.invalidate_path(&child_path).map(|n| (n, descendants))
            });
            match removed {
                Some((node, descendants)) => {
                    debug!(node = %node, descendants = descendants.len(), "entry deleted on the remote");
                    for descendant in &descendants {
                        notices.push(self_event(EventKind::Deleted, descendant));
                    }
                    notices.push(self_event(EventKind::Deleted, &node));
                    notices.push(dir_event(EventKind::Deleted, prev.name(), Some(&node)));
                }
                None => notices.push(dir_event(EventKind::Deleted, prev.name(), None)),
            }
        }
        changed |= old.list_all().iter().any(|e| !e.is_valid() && !result.contains_key(e.name()));

        let storage = Arc::new(DirectoryStorage::new(
            cache_dir.join(STORAGE_FILE_NAME),
            result.into_values(),
        ));
        let persisted = Arc::clone(&storage);
        let persist = blocking(move || {
            for path in &stale_local {
                remove_local(path);
            }
            if changed {
                persisted.store()
            } else {
                persisted.touch()
            }
        })
        .await?;
        if let Err(e) = persist {
            warn!(dir = %dir, error = %e, "could not persist listing cache");
        }
        state.set_storage(Arc::clone(&storage));
        dir.set_flag(NodeFlags::CONNECTION_ISSUES, false);
        debug!(dir = %dir, entries = storage.len(), changed, "listing installed");
        Ok(Applied {
            storage,
            relinked,
            notices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_are_recognized() {
        assert_eq!(pending_upload_base(".rfs_tmp_notes.txt_1700000000000"), Some("notes.txt"));
        assert_eq!(pending_upload_base(".rfs_tmp_a_b_12"), Some("a_b"));
        assert_eq!(pending_upload_base(".rfs_tmp_notes.txt_"), None);
        assert_eq!(pending_upload_base(".rfs_tmp_x_12a"), None);
        assert_eq!(pending_upload_base("notes.txt"), None);
    }

    #[test]
    fn cache_names_dedup_case_insensitively() {
        let mut taken = FxHashSet::default();
        assert_eq!(unique_cache_name("Readme", &mut taken), "Readme");
        assert_eq!(unique_cache_name("README", &mut taken), "README_1");
        assert_eq!(unique_cache_name("readme", &mut taken), "readme_2");
        assert_eq!(unique_cache_name("other", &mut taken), "other");
    }
}
