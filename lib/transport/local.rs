//! A [`Transport`] over a directory of the local machine.
//!
//! Remote paths are interpreted relative to a root directory. Useful for the CLI and for
//! exercising the cache layer against a real file system.

use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument, trace};

use super::{ExecOutput, MoveResult, Transport, TransportError, require_absolute};
use crate::entry::{Access, DirEntryList, EntryType, Stat};
use crate::path;

/// Environment variable pointing scripts at the root the transport serves.
pub const ROOT_ENV: &str = "RFS_ROOT";

/// Serves the tree below `root` as if it were a remote host.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: Arc<PathBuf>,
    connected: Arc<AtomicBool>,
}

impl LocalTransport {
    /// Serves the tree below `root` as the remote `/`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Local directory standing for the remote `/`.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Simulates losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        debug!(connected, root = %self.root.display(), "connectivity switched");
        self.connected.store(connected, Ordering::Release);
    }

    fn check(&self, path: &str) -> Result<PathBuf, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected {
                host: self.display_name(),
            });
        }
        require_absolute(path)?;
        let normalized = path::normalize(path).ok_or_else(|| TransportError::Relative {
            path: path.to_owned(),
        })?;
        Ok(path::components(&normalized).fold(self.root.to_path_buf(), |acc, c| acc.join(c)))
    }

    async fn stat_local(
        &self,
        remote: &str,
        follow: bool,
    ) -> Result<Stat, TransportError> {
        let local = self.check(remote)?;
        let meta = if follow {
            tokio::fs::metadata(&local).await
        } else {
            tokio::fs::symlink_metadata(&local).await
        }
        .map_err(|e| remote_error(remote, e))?;

        let name = match path::file_name(remote) {
            "" => path::ROOT,
            name => name,
        };
        let kind = if meta.is_dir() {
            EntryType::Directory
        } else if meta.file_type().is_symlink() {
            EntryType::SymbolicLink
        } else if meta.is_file() {
            EntryType::Regular
        } else {
            EntryType::Other
        };

        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let mut stat = Stat::new(name, kind)
            .with_size(meta.len())
            .with_access(Access::from_bits_truncate(((meta.mode() >> 6) & 0o7) as u8))
            .with_identity(meta.dev() as i64, meta.ino() as i64);
        if let Ok(mtime) = meta.modified() {
            stat = stat.with_mtime(mtime);
        }
        if kind == EntryType::SymbolicLink {
            let target = tokio::fs::read_link(&local)
                .await
                .map_err(|e| remote_error(remote, e))?;
            stat = stat.with_link_target(target.to_string_lossy());
        }
        Ok(stat)
    }

    async fn list(&self, remote: &str) -> Result<DirEntryList, TransportError> {
        let local = self.check(remote)?;
        let mut reader = tokio::fs::read_dir(&local)
            .await
            .map_err(|e| remote_error(remote, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| remote_error(remote, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = path::join(remote, &name);
            match self.stat_local(&child, false).await {
                Ok(stat) => entries.push(stat),
                // Raced with a concurrent delete.
                Err(TransportError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        trace!(path = remote, count = entries.len(), "listed directory");
        Ok(DirEntryList::captured_now(entries))
    }

    async fn list_parent(&self, remote: &str) -> Result<DirEntryList, TransportError> {
        self.list(path::parent(remote).unwrap_or(path::ROOT)).await
    }
}

fn remote_error(path: &str, err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::NotFound {
        TransportError::NotFound {
            path: path.to_owned(),
        }
    } else {
        TransportError::Remote {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }
}

impl Transport for LocalTransport {
    fn display_name(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn stat(&self, path: &str) -> Result<Stat, TransportError> {
        self.stat_local(path, true).await
    }

    async fn lstat(&self, path: &str) -> Result<Stat, TransportError> {
        self.stat_local(path, false).await
    }

    #[instrument(name = "LocalTransport::read_directory", skip(self))]
    async fn read_directory(&self, path: &str) -> Result<DirEntryList, TransportError> {
        self.list(path).await
    }

    #[instrument(name = "LocalTransport::move_path", skip(self))]
    async fn move_path(&self, from: &str, to: &str) -> Result<MoveResult, TransportError> {
        let local_from = self.check(from)?;
        let local_to = self.check(to)?;
        tokio::fs::rename(&local_from, &local_to)
            .await
            .map_err(|e| remote_error(from, e))?;
        Ok(MoveResult {
            from: self.list_parent(from).await?,
            to: self.list_parent(to).await?,
        })
    }

    #[instrument(name = "LocalTransport::delete", skip(self))]
    async fn delete(&self, path: &str, is_directory: bool) -> Result<DirEntryList, TransportError> {
        let local = self.check(path)?;
        if is_directory {
            tokio::fs::remove_dir_all(&local).await
        } else {
            tokio::fs::remove_file(&local).await
        }
        .map_err(|e| remote_error(path, e))?;
        self.list_parent(path).await
    }

    #[instrument(name = "LocalTransport::upload_and_rename", skip(self, local))]
    async fn upload_and_rename(
        &self,
        local: &Path,
        tmp_remote: &str,
        final_remote: &str,
    ) -> Result<DirEntryList, TransportError> {
        let tmp = self.check(tmp_remote)?;
        let dest = self.check(final_remote)?;
        tokio::fs::copy(local, &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(remote_error(final_remote, e));
        }
        self.list_parent(final_remote).await
    }

    #[instrument(name = "LocalTransport::create", skip(self))]
    async fn create(&self, path: &str, directory: bool) -> Result<DirEntryList, TransportError> {
        let local = self.check(path)?;
        if directory {
            tokio::fs::create_dir(&local)
                .await
                .map_err(|e| remote_error(path, e))?;
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&local)
                .await
                .map_err(|e| remote_error(path, e))?;
        }
        self.list_parent(path).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let source = self.check(remote)?;
        tokio::fs::copy(&source, local)
            .await
            .map_err(|e| remote_error(remote, e))?;
        Ok(())
    }

    #[instrument(name = "LocalTransport::exec", skip(self, script))]
    async fn exec(&self, dir: &str, script: &str) -> Result<ExecOutput, TransportError> {
        let cwd = self.check(dir)?;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&cwd)
            .env(ROOT_ENV, self.root.as_os_str())
            .output()
            .await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    #[instrument(name = "LocalTransport::copy_path", skip(self))]
    async fn copy_path(&self, from: &str, to: &str) -> Result<DirEntryList, TransportError> {
        let source = self.check(from)?;
        let dest = self.check(to)?;
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| remote_error(from, e))?;
        self.list_parent(to).await
    }

    fn can_copy(&self) -> bool {
        true
    }

    fn can_move(&self) -> bool {
        true
    }

    fn can_refresh_fast(&self) -> bool {
        true
    }
}
