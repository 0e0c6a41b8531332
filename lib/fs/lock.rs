use std::sync::Arc;

use tracing::trace;

use super::FsError;

/// An exclusive in-process lock on one remote path. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    locks: Arc<scc::HashMap<String, ()>>,
    path: String,
}

impl FileLock {
    pub(super) fn acquire(
        locks: &Arc<scc::HashMap<String, ()>>,
        path: String,
    ) -> Result<Self, FsError> {
        if locks.insert_sync(path.clone(), ()).is_err() {
            return Err(FsError::FileAlreadyLocked { path });
        }
        trace!(%path, "locked");
        Ok(Self {
            locks: Arc::clone(locks),
            path,
        })
    }

    /// The locked remote path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.locks.remove_sync(&self.path);
        trace!(path = %self.path, "unlocked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = Arc::new(scc::HashMap::new());
        let first = FileLock::acquire(&locks, "/a".to_owned()).unwrap();
        assert!(matches!(
            FileLock::acquire(&locks, "/a".to_owned()),
            Err(FsError::FileAlreadyLocked { .. })
        ));
        let other = FileLock::acquire(&locks, "/b".to_owned()).unwrap();
        drop(first);
        let again = FileLock::acquire(&locks, "/a".to_owned()).unwrap();
        assert_eq!(again.path(), "/a");
        assert_eq!(other.path(), "/b");
    }
}
