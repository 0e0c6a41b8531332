use thiserror::Error;

use crate::storage::StorageError;
use crate::transport::TransportError;

/// Errors surfaced by [`RemoteFileSystem`](super::RemoteFileSystem) operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The listing cache could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The path does not exist on the remote.
    #[error("cannot {operation} {path}: no such file")]
    NotFound { operation: &'static str, path: String },

    /// The node was replaced or removed since it was handed out.
    #[error("{path} is no longer valid")]
    Invalidated { path: String },

    /// A link chain loops, or its target cannot be resolved.
    #[error("{path} is a cyclic symbolic link")]
    CyclicLink { path: String },

    /// A directory operation was applied to something else.
    #[error("{path} is not a directory")]
    NotADirectory { path: String },

    /// A content operation was applied to something other than a regular file.
    #[error("{path} is not a regular file")]
    NotAFile { path: String },

    /// A link operation was applied to something other than a link.
    #[error("{path} is not a symbolic link")]
    NotALink { path: String },

    /// Another holder has the advisory lock on this path.
    #[error("{path} is already locked")]
    FileAlreadyLocked { path: String },

    /// Local cache I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    pub(crate) fn not_found(operation: &'static str, path: impl Into<String>) -> Self {
        Self::NotFound {
            operation,
            path: path.into(),
        }
    }

    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_retryable())
    }

    /// Whether the remote was unreachable.
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_not_connected())
    }
}

impl From<&FsError> for i32 {
    fn from(e: &FsError) -> Self {
        match e {
            FsError::Transport(TransportError::NotConnected { .. }) => libc::ENOTCONN,
            FsError::Transport(TransportError::Timeout { .. }) => libc::ETIMEDOUT,
            FsError::Transport(TransportError::NotFound { .. }) | FsError::NotFound { .. } => {
                libc::ENOENT
            }
            FsError::Transport(TransportError::Relative { .. })
            | FsError::NotAFile { .. }
            | FsError::NotALink { .. } => libc::EINVAL,
            FsError::Transport(TransportError::Io(io_err)) | FsError::Io(io_err) => {
                io_err.raw_os_error().unwrap_or(libc::EIO)
            }
            FsError::Transport(TransportError::Remote { .. }) | FsError::Storage(_) => libc::EIO,
            FsError::Invalidated { .. } => libc::ESTALE,
            FsError::CyclicLink { .. } => libc::ELOOP,
            FsError::NotADirectory { .. } => libc::ENOTDIR,
            FsError::FileAlreadyLocked { .. } => libc::EWOULDBLOCK,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn errno_mapping() {
        let disconnected = FsError::from(TransportError::NotConnected {
            host: "h".to_owned(),
        });
        assert_eq!(i32::from(&disconnected), libc::ENOTCONN);
        assert!(disconnected.is_retryable());

        let timeout = FsError::from(TransportError::Timeout {
            operation: "stat",
            path: "/x".to_owned(),
            after: Duration::from_secs(1),
        });
        assert_eq!(i32::from(&timeout), libc::ETIMEDOUT);
        assert!(!timeout.is_not_connected());

        assert_eq!(
            i32::from(&FsError::CyclicLink {
                path: "/l".to_owned()
            }),
            libc::ELOOP
        );
        assert!(!FsError::not_found("read", "/x").is_retryable());
    }
}
