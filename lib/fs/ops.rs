//! Mutations: create, delete, rename and move.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::{FsError, RemoteFileSystem};
use crate::entry::DirEntry;
use crate::event::{EventKind, FsEvent};
use crate::node::RemoteNode;
use crate::path;
use crate::transport::{Transport, TransportError};

impl<T: Transport> RemoteFileSystem<T> {
    /// Creates an empty regular file `name` in `dir`.
    pub async fn create_file(
        &self,
        dir: &Arc<RemoteNode>,
        name: &str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        self.create_entry(dir, name, false).await
    }

    /// Creates an empty directory `name` in `dir`.
    pub async fn create_directory(
        &self,
        dir: &Arc<RemoteNode>,
        name: &str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        self.create_entry(dir, name, true).await
    }

    #[instrument(name = "RemoteFileSystem::create_entry", skip(self, dir), fields(dir = %dir))]
    async fn create_entry(
        &self,
        dir: &Arc<RemoteNode>,
        name: &str,
        directory: bool,
    ) -> Result<Arc<RemoteNode>, FsError> {
        Self::ensure_valid(dir)?;
        let real_dir = if dir.is_directory() {
            Arc::clone(dir)
        } else {
            self.delegate_directory(dir, "create in")
                .await?
                .ok_or_else(|| FsError::NotADirectory { path: dir.path() })?
        };
        let created = match self.suspended_root(&real_dir.path()) {
            Some(root) => self.create_dummy(&real_dir, name, directory, &root).await?,
            None => {
                self.ensure_connected()?;
                let target = path::join(&real_dir.path(), name);
                let listing = self
                    .call(self.inner.transport.create(&target, directory))
                    .await?;
                let storage = self.apply_listing(&real_dir, listing, Some(name)).await?;
                let stat = storage
                    .get_valid_entry(name)
                    .ok_or_else(|| FsError::not_found("create", target.clone()))?;
                let created = self.inner.factory.create_file_object(&real_dir, &stat, false);
                debug!(node = %created, "created");
                created
            }
        };
        if Arc::ptr_eq(&real_dir, dir) {
            Ok(created)
        } else {
            Ok(self
                .inner
                .factory
                .create_remote_link_child(dir, name, created))
        }
    }

    /// Deletes `node` on the remote, recursively for directories.
    ///
    /// Deleting through a link-child deletes the entry it stands for.
    #[instrument(name = "RemoteFileSystem::delete", skip(self, node), fields(node = %node))]
    pub async fn delete(&self, node: &Arc<RemoteNode>) -> Result<(), FsError> {
        Self::ensure_valid(node)?;
        let real = Self::real_node(node)?;
        self.ensure_connected()?;
        let parent = self.required_parent(&real, "delete").await?;
        let target = real.path();
        let listing = self
            .call(self.inner.transport.delete(&target, real.is_directory()))
            .await?;
        self.apply_listing(&parent, listing, Some(&real.name())).await?;
        if real.is_valid() {
            self.inner.factory.invalidate(&real);
        }
        if !Arc::ptr_eq(&real, node) {
            self.inner.factory.invalidate(node);
        }
        self.inner.factory.unmark_unconfirmed_delete(&target);
        Ok(())
    }

    /// Renames `node` within its directory. Returns the node at its new name; for a plain
    /// rename this is `node` itself, moved together with its live descendants.
    pub async fn rename(
        &self,
        node: &Arc<RemoteNode>,
        new_name: &str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        Self::ensure_valid(node)?;
        let real = Self::real_node(node)?;
        let parent = self.required_parent(&real, "rename").await?;
        let renamed = self.move_to(&real, &parent, new_name).await?;
        if Arc::ptr_eq(&real, node) {
            return Ok(renamed);
        }
        let link_parent = self.required_parent(node, "rename").await?;
        Ok(self
            .inner
            .factory
            .create_remote_link_child(&link_parent, new_name, renamed))
    }

    /// Moves `node` into `new_parent` under `new_name`.
    ///
    /// Within one directory the node keeps its identity. Across directories the old node is
    /// invalidated and the node found at the destination is returned.
    #[instrument(name = "RemoteFileSystem::move_to", skip(self, node, new_parent), fields(node = %node, to = %new_parent))]
    pub async fn move_to(
        &self,
        node: &Arc<RemoteNode>,
        new_parent: &Arc<RemoteNode>,
        new_name: &str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        Self::ensure_valid(node)?;
        Self::ensure_valid(new_parent)?;
        let node = Self::real_node(node)?;
        let destination = if new_parent.is_directory() {
            Arc::clone(new_parent)
        } else {
            self.delegate_directory(new_parent, "move into")
                .await?
                .ok_or_else(|| FsError::NotADirectory {
                    path: new_parent.path(),
                })?
        };
        if !self.inner.transport.can_move() {
            return Err(TransportError::Remote {
                path: node.path(),
                message: format!("{} cannot move files", self.inner.transport.display_name()),
            }
            .into());
        }
        self.ensure_connected()?;
        let parent = self.required_parent(&node, "move").await?;
        let old_name = node.name();
        let from = node.path();
        let to = path::join(&destination.path(), new_name);
        if from == to {
            return Ok(node);
        }

        let moved = self
            .call(self.inner.transport.move_path(&from, &to))
            .await?;

        if Arc::ptr_eq(&parent, &destination) {
            // Carry the old record over so the entry keeps its local cache name.
            if let Some(state) = parent.as_directory() {
                let storage = state.storage();
                if !storage.is_empty_sentinel()
                    && let Some(stat) = storage.get_valid_entry(&old_name)
                {
                    storage.remove(&old_name)?;
                    storage.upsert(DirEntry::Valid(stat.renamed(new_name)))?;
                }
            }
            self.inner.factory.rename(&from, &to, &node);
            self.apply_listing(&parent, moved.to, Some(new_name)).await?;

            let kind = EventKind::Renamed {
                old_name: old_name.clone(),
            };
            let on_node = FsEvent::new(kind.clone(), node.node_ref(), node.node_ref(), true);
            let on_parent = FsEvent::new(kind, parent.node_ref(), node.node_ref(), true);
            node.listeners().fire(&on_node);
            parent.listeners().fire(&on_parent);
            debug!(from = %from, to = %to, "renamed in place");
            return Ok(node);
        }

        self.inner.factory.invalidate(&node);
        self.apply_listing(&parent, moved.from, Some(&old_name)).await?;
        self.apply_listing(&destination, moved.to, Some(new_name)).await?;
        debug!(from = %from, to = %to, "moved across directories");
        self.directory_child(&destination, new_name)
            .await?
            .ok_or_else(|| FsError::not_found("move", to))
    }

    /// The node a link-child stands for, or `node` itself.
    fn real_node(node: &Arc<RemoteNode>) -> Result<Arc<RemoteNode>, FsError> {
        match node.link_child_delegate() {
            Some(delegate) => {
                Self::ensure_valid(delegate)?;
                Ok(Arc::clone(delegate))
            }
            None => Ok(Arc::clone(node)),
        }
    }

    async fn required_parent(
        &self,
        node: &RemoteNode,
        operation: &'static str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        self.parent_of(node)
            .await?
            .ok_or_else(|| FsError::not_found(operation, node.path()))
    }
}
