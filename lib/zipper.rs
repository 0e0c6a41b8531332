//! Bulk download of a remote subtree as one archive.
//!
//! Fetching many small files one by one costs a round trip each. The zipper asks the remote to
//! archive a directory, downloads that archive once and drops it next to the directory's local
//! cache, where content lookups can pick individual files out of it. Everything here is an
//! optimization: failures are logged and swallowed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::entry::Stat;
use crate::transport::{ConnectionExecutor, Transport, TransportError};

/// Name of the warmup archive inside a directory's local cache directory.
pub const ARCHIVE_NAME: &str = ".rfs_cache.zip";

const PARTIAL_SUFFIX: &str = ".part";

/// Seconds of slack when comparing archive timestamps, which only have two-second resolution.
const TIMESTAMP_SLACK_SECS: u64 = 2;

const HOUR_SECS: u64 = 3600;
const DAY_SECS: u64 = 24 * HOUR_SECS;

#[derive(Debug, Error)]
enum ZipJobError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("archive script exited with {0}")]
    Script(i32),

    #[error("archive script output lacks ZIP=/RC= lines")]
    MalformedOutput,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// What the archive script reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipReport {
    /// Remote path of the archive that was written.
    pub archive: String,
    /// Exit code of `zip`; 12 means nothing matched.
    pub exit_code: i32,
}

/// Extracts the archive path and exit code from the script's output.
///
/// The last `ZIP=` line before an `RC=` line wins; anything else the remote prints (motd,
/// warnings from `zip`) is ignored.
#[must_use]
pub fn parse_zip_output(stdout: &str) -> Option<ZipReport> {
    let mut archive: Option<&str> = None;
    for line in stdout.lines().map(str::trim) {
        if let Some(path) = line.strip_prefix("ZIP=") {
            archive = Some(path);
        } else if let Some(code) = line.strip_prefix("RC=")
            && let Some(path) = archive
        {
            let exit_code = code.trim().parse().ok()?;
            return Some(ZipReport {
                archive: path.to_owned(),
                exit_code,
            });
        }
    }
    None
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The remote script archiving the working directory into `archive`.
///
/// `archive` is relative to `$RFS_ROOT`, which is unset on real remotes.
#[must_use]
pub fn archive_script(archive: &str, extensions: &[String]) -> String {
    let mut zip = format!("zip -rq \"${{RFS_ROOT}}\"{} .", shell_quote(archive));
    for ext in extensions {
        zip.push_str(" -i ");
        zip.push_str(&shell_quote(&format!("*.{ext}")));
    }
    let tmp_dir = crate::path::parent(archive).unwrap_or(crate::path::ROOT);
    format!(
        "mkdir -p \"${{RFS_ROOT}}\"{} 2>/dev/null\n{zip}\nRC=$?\necho ZIP={archive}\necho RC=$RC\n",
        shell_quote(tmp_dir)
    )
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

type ZipKey = (String, Vec<String>);

struct ZipperInner<T> {
    transport: T,
    executor: ConnectionExecutor,
    in_flight: scc::HashMap<ZipKey, ()>,
}

/// Schedules archive downloads, at most one per directory and extension set.
pub struct Zipper<T> {
    inner: Arc<ZipperInner<T>>,
}

impl<T> Clone for Zipper<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Zipper<T> {
    /// A zipper issuing its calls through `executor`.
    #[must_use]
    pub fn new(transport: T, executor: ConnectionExecutor) -> Self {
        Self {
            inner: Arc::new(ZipperInner {
                transport,
                executor,
                in_flight: scc::HashMap::new(),
            }),
        }
    }

    /// Whether an archive of `remote_dir` for `extensions` is being produced right now.
    #[must_use]
    pub fn is_in_flight(&self, remote_dir: &str, extensions: &[String]) -> bool {
        let key = (remote_dir.to_owned(), normalize_extensions(extensions));
        self.inner.in_flight.read_sync(&key, |_, _| ()).is_some()
    }

    /// Starts archiving `remote_dir` into `local_cache_dir`.
    ///
    /// Returns `None` when the same request is already running; it is not queued again.
    pub fn schedule(
        &self,
        remote_dir: &str,
        local_cache_dir: &Path,
        extensions: &[String],
    ) -> Option<tokio::task::JoinHandle<()>> {
        let key = (remote_dir.to_owned(), normalize_extensions(extensions));
        if self.inner.in_flight.insert_sync(key.clone(), ()).is_err() {
            trace!(dir = remote_dir, "archive already in flight");
            return None;
        }

        let this = self.clone();
        let local_cache_dir = local_cache_dir.to_path_buf();
        Some(tokio::spawn(async move {
            let outcome = this
                .inner
                .executor
                .run(this.run_job(&key.0, &local_cache_dir, &key.1))
                .await;
            match outcome {
                Ok(archive) => info!(dir = %key.0, archive = %archive.display(), "warmup archive ready"),
                Err(ZipJobError::Transport(e)) if e.is_retryable() => {
                    debug!(dir = %key.0, error = %e, "warmup archive skipped");
                }
                Err(e) => warn!(dir = %key.0, error = %e, "warmup archive failed"),
            }
            this.inner.in_flight.remove_sync(&key);
        }))
    }

    #[instrument(name = "Zipper::run_job", skip(self, local_cache_dir))]
    async fn run_job(
        &self,
        remote_dir: &str,
        local_cache_dir: &Path,
        extensions: &[String],
    ) -> Result<PathBuf, ZipJobError> {
        let transport = &self.inner.transport;
        let remote_archive = format!("/tmp/.rfs_tmp_{}.zip", epoch_millis());
        let output = transport
            .exec(remote_dir, &archive_script(&remote_archive, extensions))
            .await?;
        let report = parse_zip_output(&output.stdout).ok_or(ZipJobError::MalformedOutput)?;
        if report.exit_code != 0 {
            self.remove_remote_archive(remote_dir, &report.archive).await;
            return Err(ZipJobError::Script(report.exit_code));
        }

        let result = self
            .fetch_archive(&report.archive, local_cache_dir)
            .await;
        self.remove_remote_archive(remote_dir, &report.archive).await;
        result
    }

    async fn fetch_archive(
        &self,
        remote_archive: &str,
        local_cache_dir: &Path,
    ) -> Result<PathBuf, ZipJobError> {
        tokio::fs::create_dir_all(local_cache_dir).await?;
        let target = local_cache_dir.join(ARCHIVE_NAME);
        let partial = local_cache_dir.join(format!("{ARCHIVE_NAME}{PARTIAL_SUFFIX}"));
        if let Err(e) = self.inner.transport.download(remote_archive, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }

    async fn remove_remote_archive(&self, remote_dir: &str, archive: &str) {
        let script = format!("rm -f \"${{RFS_ROOT}}\"{}", shell_quote(archive));
        if let Err(e) = self.inner.transport.exec(remote_dir, &script).await {
            debug!(archive, error = %e, "could not remove remote archive");
        }
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut exts: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_owned())
        .filter(|e| !e.is_empty())
        .collect();
    exts.sort();
    exts.dedup();
    exts
}

/// Seconds since the epoch of an archive timestamp read as if it were UTC.
fn archive_time_secs(dt: zip::DateTime) -> Option<i64> {
    let stamp = NaiveDate::from_ymd_opt(i32::from(dt.year()), u32::from(dt.month()), u32::from(dt.day()))?
        .and_hms_opt(u32::from(dt.hour()), u32::from(dt.minute()), u32::from(dt.second()))?;
    Some(stamp.and_utc().timestamp())
}

/// Whether an archive timestamp (local time of the remote, unknown zone) describes `mtime_secs`.
fn timestamps_agree(archive_secs: i64, mtime_secs: i64) -> bool {
    let diff = archive_secs.abs_diff(mtime_secs);
    if diff <= TIMESTAMP_SLACK_SECS {
        return true;
    }
    let off_hour = diff % HOUR_SECS;
    diff < DAY_SECS && (off_hour <= TIMESTAMP_SLACK_SECS || HOUR_SECS - off_hour <= TIMESTAMP_SLACK_SECS)
}

/// Copies `entry_name` out of the archive at `archive` into `dest` when it matches `expected`.
///
/// Returns `false` when the archive has no such entry or the entry is stale. Blocking.
pub fn extract_matching(
    archive: &Path,
    entry_name: &str,
    expected: &Stat,
    dest: &Path,
) -> io::Result<bool> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(io::Error::other)?;
    let mut entry = match zip.by_name(entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(false),
        Err(e) => return Err(io::Error::other(e)),
    };
    if entry.size() != expected.size() {
        trace!(entry_name, "archive entry size differs");
        return Ok(false);
    }
    if let Some(secs) = entry.last_modified().and_then(archive_time_secs)
        && !timestamps_agree(secs, expected.mtime_millis().div_euclid(1000))
    {
        trace!(entry_name, "archive entry is stale");
        return Ok(false);
    }

    let partial = dest.with_extension("rfs_part");
    let mut out = std::fs::File::create(&partial)?;
    if let Err(e) = io::copy(&mut entry, &mut out) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, dest)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::time::Duration;

    use super::*;
    use crate::entry::EntryType;

    #[test]
    fn output_parsing_tolerates_noise() {
        let stdout = "Welcome to host\nZIP=/tmp/old.zip\nzip warning: name not matched\nZIP=/tmp/.rfs_tmp_1.zip\nRC=0\ntrailing\n";
        assert_eq!(
            parse_zip_output(stdout),
            Some(ZipReport {
                archive: "/tmp/.rfs_tmp_1.zip".to_owned(),
                exit_code: 0
            })
        );
    }

    #[test]
    fn output_parsing_requires_both_lines() {
        assert_eq!(parse_zip_output("RC=0\n"), None);
        assert_eq!(parse_zip_output("ZIP=/tmp/a.zip\n"), None);
        assert_eq!(
            parse_zip_output("ZIP=/tmp/a.zip\nRC=12\n").map(|r| r.exit_code),
            Some(12)
        );
    }

    #[test]
    fn script_filters_extensions() {
        let script = archive_script("/tmp/.rfs_tmp_5.zip", &["rs".to_owned(), "md".to_owned()]);
        assert!(script.contains("-i '*.rs'"));
        assert!(script.contains("-i '*.md'"));
        assert!(script.contains("echo ZIP=/tmp/.rfs_tmp_5.zip"));
        assert!(script.contains("echo RC=$RC"));
    }

    #[test]
    fn extensions_are_normalized_for_dedup() {
        assert_eq!(
            normalize_extensions(&[".rs".to_owned(), "md".to_owned(), "rs".to_owned()]),
            vec!["md".to_owned(), "rs".to_owned()]
        );
    }

    #[test]
    fn timestamps_allow_zone_offsets() {
        assert!(timestamps_agree(1000, 1001));
        assert!(timestamps_agree(1000 + 2 * 3600 + 1, 1000));
        assert!(!timestamps_agree(1000 + 1800, 1000));
        assert!(!timestamps_agree(1000 + 25 * 3600, 1000));
    }

    #[test]
    fn extraction_checks_size_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join(ARCHIVE_NAME);
        let stamp = zip::DateTime::from_date_and_time(2024, 1, 2, 3, 4, 6).unwrap();
        {
            let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
            writer
                .start_file(
                    "sub/a.txt",
                    zip::write::SimpleFileOptions::default().last_modified_time(stamp),
                )
                .unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }
        let dest = dir.path().join("a.txt");
        assert_eq!(archive_time_secs(stamp), Some(1_704_164_646));
        let secs = u64::try_from(archive_time_secs(stamp).unwrap()).unwrap();
        let mtime = UNIX_EPOCH + Duration::from_secs(secs);

        let wrong_size = Stat::new("a.txt", EntryType::Regular)
            .with_size(99)
            .with_mtime(mtime);
        assert!(!extract_matching(&archive, "sub/a.txt", &wrong_size, &dest).unwrap());
        assert!(!dest.exists());

        let missing = Stat::new("b.txt", EntryType::Regular).with_size(5);
        assert!(!extract_matching(&archive, "sub/b.txt", &missing, &dest).unwrap());

        let stale = Stat::new("a.txt", EntryType::Regular)
            .with_size(5)
            .with_mtime(mtime + Duration::from_secs(600));
        assert!(!extract_matching(&archive, "sub/a.txt", &stale, &dest).unwrap());

        let other_zone = Stat::new("a.txt", EntryType::Regular)
            .with_size(5)
            .with_mtime(mtime - Duration::from_secs(3 * 3600));
        assert!(extract_matching(&archive, "sub/a.txt", &other_zone, &dest).unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }
}
