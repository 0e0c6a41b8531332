//! Persistent per-directory listing cache.
//!
//! Each cached remote directory owns one [`DirectoryStorage`]: an in-memory map from child name
//! to [`DirEntry`], mirrored to a small versioned text file inside the directory's local cache
//! directory.
//!
//! ```text
//! VERSION=7
//! dummies=1
//! ghost
//! foo.txt foo.txt - 12 1700000000000 rw- 64769 1234
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::entry::{DirEntry, FormatError, Stat, decode_field, encode_field};

/// Newest listing-file version this build reads and the one it writes.
pub const STORAGE_VERSION: u32 = 7;

/// A legacy version whose layout cannot be read; such files are discarded and refetched.
pub const LEGACY_INCOMPATIBLE_VERSION: u32 = 6;

/// Name of the listing file inside a directory's local cache directory.
pub const STORAGE_FILE_NAME: &str = ".rfs_cache";

/// Occurrences of format errors from one file before they are surfaced as a warning.
pub const FORMAT_WARN_THRESHOLD: u32 = 3;

const VERSION_PREFIX: &str = "VERSION=";
const DUMMIES_PREFIX: &str = "dummies=";

/// Format errors seen so far, per listing file.
static FORMAT_REPORTS: LazyLock<scc::HashMap<PathBuf, u32>> = LazyLock::new(scc::HashMap::new);

static EMPTY: LazyLock<Arc<DirectoryStorage>> = LazyLock::new(|| {
    Arc::new(DirectoryStorage {
        file: None,
        entries: RwLock::new(BTreeMap::new()),
        write_lock: Mutex::new(()),
    })
});

/// Errors produced while loading or persisting a [`DirectoryStorage`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// Written by a newer build; must not be overwritten.
    #[error("listing cache {path} has version {found}, newer than supported {supported}")]
    TooNew {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// An old format that is thrown away and fetched again.
    #[error("listing cache {path} has incompatible legacy version {version}")]
    Discard { path: PathBuf, version: u32 },

    /// The file could not be parsed.
    #[error("malformed listing cache {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    /// Reading or writing the file failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A write was attempted on the shared empty sentinel.
    #[error("the empty directory storage cannot be modified")]
    Sentinel,
}

impl StorageError {
    /// A fatal error must not be retried by refetching: the file comes from a newer build.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TooNew { .. })
    }

    /// The cache file is unusable and should be deleted, then rebuilt from the transport.
    #[must_use]
    pub fn requires_discard(&self) -> bool {
        matches!(self, Self::Discard { .. } | Self::Format { .. })
    }
}

/// Logs a format error from `file`, escalating to a warning once the same file has produced
/// [`FORMAT_WARN_THRESHOLD`] of them.
pub fn report_format_error(file: &Path, err: &FormatError) {
    let count = match FORMAT_REPORTS.entry_sync(file.to_path_buf()) {
        scc::hash_map::Entry::Occupied(mut occ) => {
            *occ.get_mut() += 1;
            *occ.get()
        }
        scc::hash_map::Entry::Vacant(vac) => {
            vac.insert_entry(1);
            1
        }
    };

    if count == FORMAT_WARN_THRESHOLD {
        warn!(path = %file.display(), count, %err, "listing cache keeps failing to parse");
    } else if err.is_expected() {
        trace!(path = %file.display(), count, %err, "skipping unreadable listing cache data");
    } else {
        debug!(path = %file.display(), count, %err, "skipping malformed listing cache data");
    }
}

fn parse_header(line: Option<&str>, prefix: &str, path: &Path) -> Result<u32, StorageError> {
    let format_err = |message: String| StorageError::Format {
        path: path.to_path_buf(),
        source: FormatError::new(message),
    };
    let line = line.ok_or_else(|| format_err(format!("missing {prefix} header")))?;
    let value = line
        .strip_prefix(prefix)
        .ok_or_else(|| format_err(format!("expected {prefix} header, got {line:?}")))?;
    value
        .trim()
        .parse()
        .map_err(|e| format_err(format!("bad {prefix} header {line:?}: {e}")))
}

fn write_atomically(file: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = file.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, file)
}

/// The cached listing of a single remote directory.
///
/// Every key equals the name of the entry it maps to. Reads take a shared lock and perform no
/// I/O; `store` and `touch` serialize on a separate writer lock.
#[derive(Debug)]
pub struct DirectoryStorage {
    /// `None` only for the shared empty sentinel.
    file: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, DirEntry>>,
    write_lock: Mutex<()>,
}

impl DirectoryStorage {
    /// Creates a storage backed by `file` holding `entries`. Nothing is written until
    /// [`store`](Self::store) is called.
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, entries: impl IntoIterator<Item = DirEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.name().to_owned(), e))
            .collect();
        Self {
            file: Some(file.into()),
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    /// The shared "not yet loaded" sentinel. It is always empty and rejects mutation.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::clone(&EMPTY)
    }

    /// Whether this is the shared empty sentinel.
    #[must_use]
    pub fn is_empty_sentinel(&self) -> bool {
        self.file.is_none()
    }

    /// Backing file, `None` for the sentinel.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Loads a listing file.
    ///
    /// Malformed record lines are reported and skipped. A version newer than
    /// [`STORAGE_VERSION`] fails with [`StorageError::TooNew`]; the legacy incompatible version
    /// fails with [`StorageError::Discard`].
    pub fn load(file: &Path) -> Result<Self, StorageError> {
        let content = fs::read_to_string(file)?;
        let mut lines = content.lines();

        let version = parse_header(lines.next(), VERSION_PREFIX, file)?;
        if version > STORAGE_VERSION {
            return Err(StorageError::TooNew {
                path: file.to_path_buf(),
                found: version,
                supported: STORAGE_VERSION,
            });
        }
        if version == LEGACY_INCOMPATIBLE_VERSION {
            return Err(StorageError::Discard {
                path: file.to_path_buf(),
                version,
            });
        }

        let dummies = parse_header(lines.next(), DUMMIES_PREFIX, file)?;
        let mut entries = BTreeMap::new();
        for _ in 0..dummies {
            let Some(line) = lines.next() else {
                return Err(StorageError::Format {
                    path: file.to_path_buf(),
                    source: FormatError::new(format!("expected {dummies} placeholder lines")),
                });
            };
            match decode_field(line.trim_end(), "placeholder name") {
                Ok(name) if !name.is_empty() => {
                    entries.insert(name.clone(), DirEntry::Placeholder(name));
                }
                Ok(_) => report_format_error(file, &FormatError::new("empty placeholder name")),
                Err(e) => report_format_error(file, &e),
            }
        }

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match Stat::parse_line(line) {
                Ok(stat) => {
                    entries.insert(stat.name().to_owned(), DirEntry::Valid(stat));
                }
                Err(e) => report_format_error(file, &e),
            }
        }

        trace!(path = %file.display(), count = entries.len(), "loaded listing cache");
        Ok(Self {
            file: Some(file.to_path_buf()),
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        })
    }

    /// Writes `entries` to `file` in the listing format, placeholders first.
    pub fn write<'a>(
        file: &Path,
        entries: impl IntoIterator<Item = &'a DirEntry>,
    ) -> io::Result<()> {
        let (placeholders, valid): (Vec<&DirEntry>, Vec<&DirEntry>) =
            entries.into_iter().partition(|e| !e.is_valid());

        let mut content = format!(
            "{VERSION_PREFIX}{STORAGE_VERSION}\n{DUMMIES_PREFIX}{}\n",
            placeholders.len()
        );
        for entry in placeholders {
            content.push_str(&encode_field(entry.name()));
            content.push('\n');
        }
        for stat in valid.into_iter().filter_map(DirEntry::as_valid) {
            content.push_str(&stat.to_line());
            content.push('\n');
        }
        write_atomically(file, &content)
    }

    /// Persists the current entries to the backing file.
    pub fn store(&self) -> Result<(), StorageError> {
        let file = self.file.as_deref().ok_or(StorageError::Sentinel)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.list_all();
        Self::write(file, &snapshot)?;
        trace!(path = %file.display(), count = snapshot.len(), "stored listing cache");
        Ok(())
    }

    /// Marks the backing file as fresh.
    ///
    /// A missing backing file means something removed it behind our back; it is rewritten.
    pub fn touch(&self) -> Result<(), StorageError> {
        let file = self.file.as_deref().ok_or(StorageError::Sentinel)?;
        {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match fs::File::options().write(true).open(file) {
                Ok(handle) => {
                    handle.set_modified(SystemTime::now())?;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        error!(path = %file.display(), "listing cache vanished while in use, rewriting it");
        self.store()
    }

    /// Replaces every entry.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = DirEntry>) -> Result<(), StorageError> {
        if self.is_empty_sentinel() {
            return Err(StorageError::Sentinel);
        }
        let fresh: BTreeMap<_, _> = entries
            .into_iter()
            .map(|e| (e.name().to_owned(), e))
            .collect();
        *self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    /// Inserts or replaces one entry.
    pub fn upsert(&self, entry: DirEntry) -> Result<(), StorageError> {
        if self.is_empty_sentinel() {
            return Err(StorageError::Sentinel);
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.name().to_owned(), entry);
        Ok(())
    }

    /// Removes one entry, returning it.
    pub fn remove(&self, name: &str) -> Result<Option<DirEntry>, StorageError> {
        if self.is_empty_sentinel() {
            return Err(StorageError::Sentinel);
        }
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name))
    }

    /// Looks up `name`, ignoring placeholders.
    #[must_use]
    pub fn get_valid_entry(&self, name: &str) -> Option<Stat> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(DirEntry::as_valid)
            .cloned()
    }

    /// Whether any record, valid or placeholder, exists for `name`.
    #[must_use]
    pub fn is_known(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Every record, placeholders included, in name order.
    #[must_use]
    pub fn list_all(&self) -> Vec<DirEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The entries that exist on the remote, in name order.
    #[must_use]
    pub fn list_valid(&self) -> Vec<Stat> {
        self.list_valid_except(None)
    }

    /// Valid entries other than `exclude`.
    #[must_use]
    pub fn list_valid_except(&self, exclude: Option<&str>) -> Vec<Stat> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(DirEntry::as_valid)
            .filter(|stat| exclude != Some(stat.name()))
            .cloned()
            .collect()
    }

    /// Number of records, placeholders included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::entry::{Access, EntryType};

    fn file_entry(name: &str, size: u64) -> DirEntry {
        Stat::new(name, EntryType::Regular)
            .with_size(size)
            .with_mtime(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
            .with_access(Access::READ | Access::WRITE)
            .with_identity(1, 42)
            .into()
    }

    #[test]
    fn loads_placeholders_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        fs::write(
            &path,
            "VERSION=7\ndummies=1\nghost\nfoo.txt foo.txt - 12 1700000000000 rw- 1 2\n",
        )
        .unwrap();

        let storage = DirectoryStorage::load(&path).unwrap();
        assert!(storage.get_valid_entry("ghost").is_none());
        assert!(storage.is_known("ghost"));
        let foo = storage.get_valid_entry("foo.txt").unwrap();
        assert_eq!(foo.size(), 12);
        assert!(foo.can_write());
        assert!(!foo.can_execute());
    }

    #[test]
    fn store_then_load_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        let entries = vec![
            file_entry("a.txt", 3),
            DirEntry::placeholder("missing one"),
            Stat::new("lib", EntryType::Directory).into(),
            Stat::new("cur", EntryType::SymbolicLink)
                .with_link_target("lib")
                .into(),
        ];
        DirectoryStorage::new(&path, entries.clone()).store().unwrap();

        let loaded = DirectoryStorage::load(&path).unwrap();
        let expected: HashSet<_> = entries.into_iter().collect();
        let actual: HashSet<_> = loaded.list_all().into_iter().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn placeholders_are_written_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        let entries = [file_entry("a", 1), DirEntry::placeholder("z")];
        DirectoryStorage::write(&path, &entries).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "VERSION=7");
        assert_eq!(lines[1], "dummies=1");
        assert_eq!(lines[2], "z");
        assert!(lines[3].starts_with("a a - 1 "));
    }

    #[test]
    fn newer_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        fs::write(&path, "VERSION=8\ndummies=0\n").unwrap();
        let err = DirectoryStorage::load(&path).unwrap_err();
        assert!(err.is_fatal(), "got {err}");
        assert!(!err.requires_discard());
    }

    #[test]
    fn legacy_version_requires_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        fs::write(&path, format!("VERSION={LEGACY_INCOMPATIBLE_VERSION}\ndummies=0\n")).unwrap();
        let err = DirectoryStorage::load(&path).unwrap_err();
        assert!(err.requires_discard(), "got {err}");
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_header_requires_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        fs::write(&path, "a a - 1 2 rw- 0 0\n").unwrap();
        assert!(DirectoryStorage::load(&path).unwrap_err().requires_discard());
    }

    #[test]
    fn bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        fs::write(
            &path,
            "VERSION=7\ndummies=0\nbroken line\n\ngood good - 5 0 r-- 0 0\n",
        )
        .unwrap();
        let storage = DirectoryStorage::load(&path).unwrap();
        assert_eq!(storage.len(), 1);
        assert!(storage.get_valid_entry("good").is_some());
    }

    #[test]
    fn touch_rewrites_a_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORAGE_FILE_NAME);
        let storage = DirectoryStorage::new(&path, [file_entry("x", 1)]);
        storage.store().unwrap();
        fs::remove_file(&path).unwrap();

        storage.touch().unwrap();
        let reloaded = DirectoryStorage::load(&path).unwrap();
        assert!(reloaded.get_valid_entry("x").is_some());
    }

    #[test]
    fn sentinel_rejects_mutation() {
        let empty = DirectoryStorage::empty();
        assert!(empty.is_empty_sentinel());
        assert!(matches!(
            empty.upsert(DirEntry::placeholder("x")),
            Err(StorageError::Sentinel)
        ));
        assert!(matches!(empty.store(), Err(StorageError::Sentinel)));
        assert!(matches!(empty.touch(), Err(StorageError::Sentinel)));
        assert!(empty.is_empty());
    }

    #[test]
    fn list_valid_except_skips_named_entry() {
        let storage = DirectoryStorage::new(
            "/nonexistent/.rfs_cache",
            [file_entry("a", 1), file_entry("b", 2), DirEntry::placeholder("c")],
        );
        let names: Vec<_> = storage
            .list_valid_except(Some("a"))
            .into_iter()
            .map(|s| s.name().to_owned())
            .collect();
        assert_eq!(names, vec!["b".to_owned()]);
        assert_eq!(storage.list_valid().len(), 2);
    }
}
