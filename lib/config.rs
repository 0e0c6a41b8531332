//! Tunables of a [`RemoteFileSystem`](crate::fs::RemoteFileSystem).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::DEFAULT_PARALLELISM;

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(|| PathBuf::from("/tmp/rfs/cache"), |d| d.join("rfs"))
}

fn default_transport_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_stat_timeout_ms() -> u64 {
    10_000
}

fn default_identity_cache_capacity() -> usize {
    4096
}

fn default_zip_enabled() -> bool {
    true
}

/// Filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FsConfig {
    /// Local directory mirroring the remote tree.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Transport calls allowed in flight at once.
    #[serde(default = "default_transport_parallelism")]
    pub transport_parallelism: usize,

    /// Deadline for direct stat calls. `0` disables it.
    #[serde(default = "default_stat_timeout_ms")]
    pub stat_timeout_ms: u64,

    /// Unreferenced nodes the identity cache keeps around before sweeping them.
    #[serde(default = "default_identity_cache_capacity")]
    pub identity_cache_capacity: usize,

    /// Whether warmup may fetch directory contents as one archive.
    #[serde(default = "default_zip_enabled")]
    pub zip_enabled: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            transport_parallelism: default_transport_parallelism(),
            stat_timeout_ms: default_stat_timeout_ms(),
            identity_cache_capacity: default_identity_cache_capacity(),
            zip_enabled: default_zip_enabled(),
        }
    }
}

impl FsConfig {
    /// A default configuration caching into `cache_dir`.
    #[must_use]
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Deadline of uncached stat calls, `None` when disabled.
    #[must_use]
    pub fn stat_timeout(&self) -> Option<Duration> {
        (self.stat_timeout_ms > 0).then(|| Duration::from_millis(self.stat_timeout_ms))
    }

    /// Checks the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.transport_parallelism == 0 {
            errors.push("transport-parallelism must be at least 1.".to_owned());
        }
        if !self.cache_dir.is_absolute() {
            errors.push(format!(
                "cache-dir '{}' must be an absolute path.",
                self.cache_dir.display()
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
