//! Held-back uploads.
//!
//! While uploads below a directory are suspended, new files and directories exist only in the
//! local cache as dummy nodes. Resuming creates them on the remote, uploads their content and
//! re-lists the directories they landed in.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, instrument, trace};

use super::content::upload_name;
use super::{FsError, RemoteFileSystem};
use crate::entry::{EntryType, Stat};
use crate::node::{NodeFlags, RemoteNode};
use crate::path;
use crate::transport::Transport;

impl<T: Transport> RemoteFileSystem<T> {
    /// Starts holding back creations below `dir` until [`resume_uploads`](Self::resume_uploads).
    ///
    /// Returns `false` when `dir` already lies in a suspended subtree. Suspended subtrees below
    /// `dir` are folded into it.
    #[instrument(name = "RemoteFileSystem::suspend_uploads", skip(self, dir), fields(dir = %dir))]
    pub fn suspend_uploads(&self, dir: &Arc<RemoteNode>) -> Result<bool, FsError> {
        Self::ensure_valid(dir)?;
        if !dir.is_directory() {
            return Err(FsError::NotADirectory { path: dir.path() });
        }
        let key = dir.path();
        let mut suspended = self.inner.suspended.lock();
        if suspended
            .keys()
            .any(|root| *root == key || path::is_descendant(&key, root))
        {
            return Ok(false);
        }
        let nested: Vec<String> = suspended
            .keys()
            .filter(|root| path::is_descendant(root, &key))
            .cloned()
            .collect();
        let mut held = Vec::new();
        for root in nested {
            held.extend(suspended.remove(&root).unwrap_or_default());
        }
        debug!(folded = held.len(), "uploads suspended");
        suspended.insert(key, held);
        Ok(true)
    }

    /// Whether creations in `dir` are currently held back.
    #[must_use]
    pub fn is_upload_suspended(&self, dir: &RemoteNode) -> bool {
        self.suspended_root(&dir.path()).is_some()
    }

    /// The suspended directory `dir_path` lies in, if any.
    pub(super) fn suspended_root(&self, dir_path: &str) -> Option<String> {
        self.inner
            .suspended
            .lock()
            .keys()
            .find(|root| root.as_str() == dir_path || path::is_descendant(dir_path, root))
            .cloned()
    }

    /// Held-back nodes whose parent is `dir`.
    pub(super) fn dummy_children(&self, dir: &RemoteNode) -> Vec<Arc<RemoteNode>> {
        let id = dir.id();
        self.inner
            .suspended
            .lock()
            .values()
            .flatten()
            .filter(|node| node.parent_id() == id && node.is_valid())
            .cloned()
            .collect()
    }

    /// Creates `name` in `dir` in the local cache only, recording it under `root`.
    pub(super) async fn create_dummy(
        &self,
        dir: &Arc<RemoteNode>,
        name: &str,
        directory: bool,
        root: &str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        let kind = if directory {
            EntryType::Directory
        } else {
            EntryType::Regular
        };
        let stat = Stat::new(name, kind).with_mtime(SystemTime::now());
        let node = self.inner.factory.create_file_object(dir, &stat, true);
        Self::ensure_valid(&node)?;
        if !node.has_flag(NodeFlags::DUMMY) {
            debug!(node = %node, "entry already known, nothing to hold back");
            return Ok(node);
        }

        if let Some(local) = node.cache_path() {
            if directory {
                tokio::fs::create_dir_all(local).await?;
            } else {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(local, b"").await?;
                node.set_flag(NodeFlags::PENDING_DELIVERY, true);
            }
        }
        match self.inner.suspended.lock().get_mut(root) {
            Some(held) => held.push(Arc::clone(&node)),
            None => debug!(node = %node, "uploads resumed while creating"),
        }
        debug!(node = %node, "created while uploads are suspended");
        Ok(node)
    }

    /// Sends everything held back below `dir` to the remote and re-lists the directories it
    /// landed in. Returns the number of entries delivered.
    ///
    /// The suspension ends even when a delivery fails; the nodes then stop being dummies.
    #[instrument(name = "RemoteFileSystem::resume_uploads", skip(self, dir), fields(dir = %dir))]
    pub async fn resume_uploads(&self, dir: &Arc<RemoteNode>) -> Result<usize, FsError> {
        self.ensure_connected()?;
        let Some(mut held) = self.inner.suspended.lock().remove(&dir.path()) else {
            return Ok(0);
        };
        held.retain(|node| node.is_valid());
        held.sort_by_key(|node| node.path().matches('/').count());

        let delivered = self.deliver(&held).await;
        for node in &held {
            node.set_flag(NodeFlags::DUMMY | NodeFlags::PENDING_DELIVERY, false);
        }
        let delivered = delivered?;

        self.refresh_directory(dir, None, true, false).await?;
        for node in held.iter().filter(|n| n.is_directory() && n.is_valid()) {
            self.refresh_directory(node, None, true, false).await?;
        }
        info!(delivered, "held-back uploads delivered");
        Ok(delivered)
    }

    /// Creates held-back nodes on the remote, parents first.
    async fn deliver(&self, held: &[Arc<RemoteNode>]) -> Result<usize, FsError> {
        let transport = &self.inner.transport;
        let mut delivered = 0;
        for node in held {
            let target = node.path();
            if node.is_directory() {
                self.call(transport.create(&target, true)).await?;
            } else if let Some(local) = node.cache_path() {
                let parent = node.parent_path().unwrap_or_else(|| "/".to_owned());
                let tmp = path::join(&parent, &upload_name(&node.name()));
                self.call(transport.upload_and_rename(local, &tmp, &target))
                    .await?;
            }
            delivered += 1;
            trace!(node = %node, "delivered");
        }
        Ok(delivered)
    }
}
