//! The contract a remote protocol has to satisfy.
//!
//! The cache layer never talks to the wire itself. It drives a [`Transport`] through the
//! [`ConnectionExecutor`], which bounds how many calls are in flight against one connection.

/// A transport over a local directory tree.
pub mod local;

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::entry::{DirEntryList, Stat};

/// Default number of concurrent transport calls per connection.
pub const DEFAULT_PARALLELISM: usize = 2;

/// Errors reported by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is down.
    #[error("not connected to {host}")]
    NotConnected { host: String },

    /// The call did not finish within its deadline.
    #[error("{operation} on {path} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        path: String,
        after: Duration,
    },

    /// The path does not exist on the remote.
    #[error("{path} does not exist")]
    NotFound { path: String },

    /// Paths handed to a transport must be absolute.
    #[error("{path} is not an absolute path")]
    Relative { path: String },

    /// The remote refused the call.
    #[error("remote error on {path}: {message}")]
    Remote { path: String, message: String },

    /// Local I/O on our side failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the same call may succeed later without any change on our side.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Timeout { .. })
    }

    /// Whether the path does not exist on the remote.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the connection was down.
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

/// Rejects anything but absolute remote paths.
pub fn require_absolute(path: &str) -> Result<(), TransportError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(TransportError::Relative {
            path: path.to_owned(),
        })
    }
}

/// Runs `fut`, failing with [`TransportError::Timeout`] once `after` elapses.
///
/// The inner future is dropped on timeout, which cancels the transport call.
pub async fn with_deadline<T>(
    operation: &'static str,
    path: &str,
    after: Option<Duration>,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    let Some(after) = after else {
        return fut.await;
    };
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TransportError::Timeout {
            operation,
            path: path.to_owned(),
            after,
        })?
}

/// Listings of both parents affected by a move.
#[derive(Debug, Clone)]
pub struct MoveResult {
    /// Listing of the source directory.
    pub from: DirEntryList,
    /// Listing of the destination directory.
    pub to: DirEntryList,
}

/// Result of a remote shell invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the script wrote to standard output.
    pub stdout: String,
    /// Exit status, `-1` when killed by a signal.
    pub exit_code: i32,
}

/// A remote-protocol implementation.
///
/// Every path is an absolute, normalized remote path. Calls that produce a new state of a
/// directory return its fresh listing so the caller can update its cache without a second round
/// trip.
pub trait Transport: Clone + Send + Sync + 'static {
    /// A human-readable name of the remote end, used in error messages.
    fn display_name(&self) -> String;

    /// Whether calls can currently reach the remote. Cached data stays usable while this is
    /// false.
    fn is_connected(&self) -> bool;

    /// Stats `path`, following a final symbolic link.
    fn stat(&self, path: &str) -> impl Future<Output = Result<Stat, TransportError>> + Send;

    /// Stats `path` without following a final symbolic link.
    fn lstat(&self, path: &str) -> impl Future<Output = Result<Stat, TransportError>> + Send;

    /// Lists the immediate children of the directory at `path`.
    fn read_directory(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<DirEntryList, TransportError>> + Send;

    /// Renames `from` to `to`.
    fn move_path(
        &self,
        from: &str,
        to: &str,
    ) -> impl Future<Output = Result<MoveResult, TransportError>> + Send;

    /// Deletes `path`, recursively for directories. Returns the listing of its parent.
    fn delete(
        &self,
        path: &str,
        is_directory: bool,
    ) -> impl Future<Output = Result<DirEntryList, TransportError>> + Send;

    /// Uploads `local` to `tmp_remote`, then renames it to `final_remote`. Returns the listing of
    /// the final parent.
    fn upload_and_rename(
        &self,
        local: &Path,
        tmp_remote: &str,
        final_remote: &str,
    ) -> impl Future<Output = Result<DirEntryList, TransportError>> + Send;

    /// Creates an empty file or directory at `path`. Returns the listing of its parent.
    fn create(
        &self,
        path: &str,
        directory: bool,
    ) -> impl Future<Output = Result<DirEntryList, TransportError>> + Send;

    /// Copies the remote file at `remote` to the local file `local`.
    fn download(
        &self,
        remote: &str,
        local: &Path,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Runs a shell `script` with `dir` as working directory.
    fn exec(
        &self,
        dir: &str,
        script: &str,
    ) -> impl Future<Output = Result<ExecOutput, TransportError>> + Send;

    /// Copies the regular file `from` to `to` without the content leaving the remote. Returns
    /// the listing of the destination's parent.
    ///
    /// Only called when [`can_copy`](Self::can_copy) holds.
    fn copy_path(
        &self,
        from: &str,
        to: &str,
    ) -> impl Future<Output = Result<DirEntryList, TransportError>> + Send {
        let err = TransportError::Remote {
            path: from.to_owned(),
            message: format!("{} cannot copy to {to} on its own", self.display_name()),
        };
        async move { Err(err) }
    }

    /// Whether [`copy_path`](Self::copy_path) is supported. Otherwise copies go through a
    /// download and an upload.
    fn can_copy(&self) -> bool {
        false
    }

    /// Whether [`move_path`](Self::move_path) is supported.
    fn can_move(&self) -> bool {
        true
    }

    /// Whether a full listing is cheap enough to refresh eagerly.
    fn can_refresh_fast(&self) -> bool {
        false
    }

    /// Whether the remote cannot push change notifications, so changes must be polled.
    fn needs_client_side_polling_refresh(&self) -> bool {
        true
    }
}

/// Bounds the number of in-flight transport calls for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionExecutor {
    permits: Arc<Semaphore>,
    parallelism: usize,
}

impl ConnectionExecutor {
    /// Allows `parallelism` calls at once, at least one.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    /// The configured bound.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Calls currently allowed to start without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `fut` once a permit is available.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        // The semaphore is never closed.
        let _permit = self.permits.acquire().await.ok();
        fut.await
    }
}

impl Default for ConnectionExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_surfaces_as_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TransportError>(())
        };
        let err = with_deadline("stat", "/slow", Some(Duration::from_millis(10)), slow)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransportError::Timeout { operation: "stat", .. }),
            "got {err:?}"
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn no_deadline_runs_to_completion() {
        let out = with_deadline("stat", "/x", None, async { Ok::<_, TransportError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(require_absolute("/a").is_ok());
        assert!(matches!(
            require_absolute("a/b"),
            Err(TransportError::Relative { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn executor_bounds_concurrency() {
        let executor = ConnectionExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let executor = executor.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                executor
                    .run(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "at most two calls in flight");
        assert_eq!(executor.available(), 2);
    }
}
