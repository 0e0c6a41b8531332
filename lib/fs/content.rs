//! File content: local cache files, archive extraction and uploads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use super::refresh::{UPLOAD_PREFIX, blocking};
use super::{FsError, RemoteFileSystem};
use crate::entry::{EntryType, Stat};
use crate::node::{NodeFlags, NodeKind, RemoteNode};
use crate::path;
use crate::transport::Transport;
use crate::zipper::{ARCHIVE_NAME, extract_matching};

/// Remote name an upload of `name` goes through before it is renamed into place.
pub(super) fn upload_name(name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    format!("{UPLOAD_PREFIX}{name}_{millis}")
}

fn plain_cache_file(node: &RemoteNode) -> Result<PathBuf, FsError> {
    match node.kind() {
        NodeKind::PlainFile { cache_file } => Ok(cache_file.clone()),
        _ => Err(FsError::NotAFile { path: node.path() }),
    }
}

impl<T: Transport> RemoteFileSystem<T> {
    /// Reads the content of `node`, fetching it into the local cache first if needed.
    #[instrument(name = "RemoteFileSystem::read", skip(self, node), fields(node = %node))]
    pub async fn read(&self, node: &Arc<RemoteNode>) -> Result<Bytes, FsError> {
        let file = self.content_target(node, "read").await?;
        let cache_file = plain_cache_file(&file)?;
        self.ensure_child_sync(&file, &cache_file).await?;
        Ok(Bytes::from(tokio::fs::read(&cache_file).await?))
    }

    /// Path of the up to date local copy of `node`.
    pub async fn local_copy(&self, node: &Arc<RemoteNode>) -> Result<PathBuf, FsError> {
        let file = self.content_target(node, "read").await?;
        let cache_file = plain_cache_file(&file)?;
        self.ensure_child_sync(&file, &cache_file).await?;
        Ok(cache_file)
    }

    /// Makes sure `cache_file` holds the current content of `file`.
    ///
    /// Refreshes drop cache files whose remote record changed, so an existing file is current.
    async fn ensure_child_sync(
        &self,
        file: &Arc<RemoteNode>,
        cache_file: &Path,
    ) -> Result<(), FsError> {
        if tokio::fs::try_exists(cache_file).await? {
            trace!(file = %file, "content served from local cache");
            return Ok(());
        }
        self.ensure_connected()?;
        let parent = self
            .parent_of(file)
            .await?
            .ok_or_else(|| FsError::NotAFile { path: file.path() })?;
        let name = file.name();
        let stat = self
            .refresh_directory(&parent, Some(&name), false, false)
            .await?
            .get_valid_entry(&name)
            .ok_or_else(|| FsError::not_found("read", file.path()))?;
        if let Some(dir) = cache_file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        if self.inner.config.zip_enabled && self.extract_from_archive(file, &stat, cache_file).await {
            debug!(file = %file, "content extracted from warmup archive");
            return Ok(());
        }

        let remote = file.path();
        let downloaded = self
            .call(self.inner.transport.download(&remote, cache_file))
            .await;
        if let Err(e) = downloaded {
            let _ = tokio::fs::remove_file(cache_file).await;
            return Err(e.into());
        }
        debug!(file = %file, size = stat.size(), "content downloaded");
        Ok(())
    }

    /// Looks for `file` in the warmup archives of its cached ancestors.
    async fn extract_from_archive(&self, file: &RemoteNode, stat: &Stat, dest: &Path) -> bool {
        let file_path = file.path();
        let mut ancestor = path::parent(&file_path).map(str::to_owned);
        while let Some(dir_path) = ancestor {
            if let Some(dir) = self.inner.factory.get_cached_file_object(&dir_path)
                && let Some(cache_dir) = dir.cache_path()
                && dir.is_directory()
            {
                let archive = cache_dir.join(ARCHIVE_NAME);
                let entry_name = file_path
                    .strip_prefix(dir_path.as_str())
                    .map(|rest| rest.trim_start_matches('/').to_owned());
                if let Some(entry_name) = entry_name
                    && tokio::fs::try_exists(&archive).await.unwrap_or(false)
                {
                    let (expected, dest_buf) = (stat.clone(), dest.to_path_buf());
                    match blocking(move || extract_matching(&archive, &entry_name, &expected, &dest_buf)).await {
                        Ok(Ok(true)) => return true,
                        Ok(Ok(false)) => {}
                        Ok(Err(e)) => debug!(dir = %dir_path, error = %e, "warmup archive unreadable"),
                        Err(e) => debug!(dir = %dir_path, error = %e, "archive extraction aborted"),
                    }
                }
            }
            ancestor = path::parent(&dir_path).map(str::to_owned);
        }
        false
    }

    /// Replaces the content of `node` locally and on the remote.
    ///
    /// The upload goes through a temporary remote name; refreshes ignore that name while the
    /// file is pending delivery.
    #[instrument(name = "RemoteFileSystem::write", skip(self, node, content), fields(node = %node, len = content.len()))]
    pub async fn write(&self, node: &Arc<RemoteNode>, content: Bytes) -> Result<Stat, FsError> {
        let file = self.content_target(node, "write").await?;
        let cache_file = plain_cache_file(&file)?;
        if file.has_flag(NodeFlags::DUMMY) {
            tokio::fs::write(&cache_file, &content).await?;
            trace!(file = %file, "held back until uploads resume");
            return Ok(Stat::new(file.name(), EntryType::Regular)
                .with_size(u64::try_from(content.len()).unwrap_or(u64::MAX))
                .with_mtime(SystemTime::now()));
        }
        self.ensure_connected()?;
        let parent = self
            .parent_of(&file)
            .await?
            .ok_or_else(|| FsError::NotAFile { path: file.path() })?;
        if let Some(dir) = cache_file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&cache_file, &content).await?;

        file.set_flag(NodeFlags::PENDING_DELIVERY, true);
        let name = file.name();
        let parent_path = parent.path();
        let tmp = path::join(&parent_path, &upload_name(&name));
        let target = file.path();
        let outcome = async {
            let listing = self
                .call(self.inner.transport.upload_and_rename(&cache_file, &tmp, &target))
                .await?;
            let storage = self.apply_listing(&parent, listing, Some(&name)).await?;
            storage
                .get_valid_entry(&name)
                .ok_or_else(|| FsError::not_found("write", target.clone()))
        }
        .await;
        file.set_flag(NodeFlags::PENDING_DELIVERY, false);
        outcome
    }

    /// Copies the regular file behind `node` into `dest_dir` as `new_name` and returns the copy.
    ///
    /// Transports that can copy on their own side do so; otherwise the content is fetched into
    /// the local cache and uploaded again.
    #[instrument(name = "RemoteFileSystem::copy", skip(self, node, dest_dir), fields(node = %node, to = %dest_dir))]
    pub async fn copy(
        &self,
        node: &Arc<RemoteNode>,
        dest_dir: &Arc<RemoteNode>,
        new_name: &str,
    ) -> Result<Arc<RemoteNode>, FsError> {
        Self::ensure_valid(dest_dir)?;
        let file = self.content_target(node, "copy").await?;
        plain_cache_file(&file)?;
        let destination = if dest_dir.is_directory() {
            Arc::clone(dest_dir)
        } else {
            self.delegate_directory(dest_dir, "copy into")
                .await?
                .ok_or_else(|| FsError::NotADirectory {
                    path: dest_dir.path(),
                })?
        };
        self.ensure_connected()?;
        let dest_path = destination.path();
        let target = path::join(&dest_path, new_name);
        let listing = if self.inner.transport.can_copy() {
            self.call(self.inner.transport.copy_path(&file.path(), &target))
                .await?
        } else {
            let local = self.local_copy(&file).await?;
            let tmp = path::join(&dest_path, &upload_name(new_name));
            self.call(self.inner.transport.upload_and_rename(&local, &tmp, &target))
                .await?
        };
        self.apply_listing(&destination, listing, Some(new_name)).await?;
        debug!(from = %file, to = %target, "copied");
        self.directory_child(&destination, new_name)
            .await?
            .ok_or_else(|| FsError::not_found("copy", target))
    }
}
