//! Metadata records for remote directory entries.
//!
//! A [`Stat`] is the immutable snapshot of one remote path. A [`DirEntry`] is either a valid
//! [`Stat`] or a placeholder that only remembers a name known not to resolve. Records are
//! exchanged with the on-disk listing cache as single text lines:
//!
//! ```text
//! name cache type size mtime rwx device inode [link-target]
//! ```
//!
//! `name`, `cache` and `link-target` are percent-encoded, so a serialized record never contains
//! spaces or newlines.

use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use thiserror::Error;

/// Bytes escaped inside a serialized record field, in addition to controls and non-ASCII.
fn is_field_special(b: u8) -> bool {
    matches!(b, b' ' | b'%' | b'"')
}

/// Bytes escaped when deriving a local cache file name, in addition to controls and non-ASCII.
fn is_cache_name_special(b: u8) -> bool {
    matches!(
        b,
        b'%' | b'/' | b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|'
    )
}

fn percent_encode(value: &str, special: fn(u8) -> bool) -> Cow<'_, str> {
    let escaped = |b: u8| b.is_ascii_control() || !b.is_ascii() || special(b);
    if !value.bytes().any(escaped) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for b in value.bytes() {
        if escaped(b) {
            out.push_str(&format!("%{b:02X}"));
        } else {
            out.push(char::from(b));
        }
    }
    Cow::Owned(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).and_then(|d| u8::try_from(d).ok())
}

/// Decodes `%XX` escapes. A `%` not followed by two hex digits is kept as is.
fn percent_decode(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(hi) = bytes.get(i + 1).copied().and_then(hex_digit)
            && let Some(lo) = bytes.get(i + 2).copied().and_then(hex_digit)
        {
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// Number of space-separated fields in a record without a link target.
const BASE_FIELD_COUNT: usize = 8;

/// A malformed cache file or record.
///
/// `expected` errors describe routine situations (a cache written by an older build, a file that
/// vanished) and are logged quietly; the rest indicate genuine corruption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FormatError {
    message: String,
    expected: bool,
}

impl FormatError {
    /// A format error signalling unexpected corruption.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected: false,
        }
    }

    /// A format error for a routine, anticipated condition.
    #[must_use]
    pub fn expected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected: true,
        }
    }

    /// Whether this error is a routine, anticipated condition.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        self.expected
    }
}

/// The type tag of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    SymbolicLink,
    /// Pipes, sockets, devices and anything else.
    Other,
}

impl EntryType {
    /// The single-character tag used in serialized records.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Regular => '-',
            Self::Directory => 'd',
            Self::SymbolicLink => 'l',
            Self::Other => 'o',
        }
    }

    /// Parses a type tag. POSIX special-file letters map to [`EntryType::Other`].
    #[must_use]
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            '-' => Some(Self::Regular),
            'd' => Some(Self::Directory),
            'l' => Some(Self::SymbolicLink),
            'o' | 'p' | 'c' | 'b' | 's' | 'D' => Some(Self::Other),
            _ => None,
        }
    }
}

bitflags! {
    /// Effective access bits of the connected user on a remote entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        /// Execute (or search, for directories).
        const EXECUTE = 1 << 0;
        /// Write.
        const WRITE   = 1 << 1;
        /// Read.
        const READ    = 1 << 2;

        /// Read, write, and execute.
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Access {
    /// Renders the `rwx` triplet, `-` for each missing bit.
    #[must_use]
    pub fn triplet(self) -> String {
        let bit = |flag: Self, c: char| if self.contains(flag) { c } else { '-' };
        [
            bit(Self::READ, 'r'),
            bit(Self::WRITE, 'w'),
            bit(Self::EXECUTE, 'x'),
        ]
        .into_iter()
        .collect()
    }

    /// Parses an `rwx` triplet. Each position accepts its letter or `-`.
    pub fn from_triplet(s: &str) -> Result<Self, FormatError> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(FormatError::new(format!(
                "access triplet must have 3 characters: {s:?}"
            )));
        }
        let mut access = Self::empty();
        for (byte, (letter, flag)) in bytes
            .iter()
            .zip([(b'r', Self::READ), (b'w', Self::WRITE), (b'x', Self::EXECUTE)])
        {
            match *byte {
                b'-' => {}
                b if b == letter => access |= flag,
                _ => return Err(FormatError::new(format!("bad access triplet: {s:?}"))),
            }
        }
        Ok(access)
    }
}

pub(crate) fn encode_field(value: &str) -> Cow<'_, str> {
    percent_encode(value, is_field_special)
}

pub(crate) fn decode_field(field: &str, what: &str) -> Result<String, FormatError> {
    String::from_utf8(percent_decode(field))
        .map_err(|_| FormatError::new(format!("{what} is not valid UTF-8 after decoding")))
}

/// Derives a local cache file name from a remote entry name.
///
/// The result is safe to use as a single path component on the local filesystem and never
/// collides with the reserved `.rfs_` files that live next to cached content.
#[must_use]
pub fn escape_cache_name(name: &str) -> String {
    let escaped = percent_encode(name, is_cache_name_special).into_owned();
    if escaped == "." || escaped == ".." || escaped.starts_with(".rfs_") {
        format!("%2E{}", &escaped[1..])
    } else {
        escaped
    }
}

fn system_time_from_millis(ms: i64) -> SystemTime {
    let magnitude = Duration::from_millis(ms.unsigned_abs());
    if ms >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH - magnitude
    }
}

fn millis_from_system_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_millis()).map_or(i64::MIN, |ms| -ms),
    }
}

/// Stat data for one resolved remote path.
///
/// Immutable once built. The modification time is kept at millisecond precision, which is what
/// the serialized form can carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stat {
    name: String,
    cache: String,
    kind: EntryType,
    size: u64,
    mtime_ms: i64,
    access: Access,
    device: i64,
    inode: i64,
    link_target: Option<String>,
}

impl Stat {
    /// Starts a record for `name` of the given type with zeroed metadata.
    ///
    /// `name` must be non-empty. The local cache name defaults to the escaped name.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: EntryType) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "entry names are never empty");
        Self {
            cache: escape_cache_name(&name),
            name,
            kind,
            size: 0,
            mtime_ms: 0,
            access: Access::empty(),
            device: 0,
            inode: 0,
            link_target: (kind == EntryType::SymbolicLink).then(String::new),
        }
    }

    /// Sets the size in bytes.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the modification time, truncated to whole milliseconds.
    #[must_use]
    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime_ms = millis_from_system_time(mtime);
        self
    }

    /// Sets the access bits.
    #[must_use]
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Sets the device and inode identity hints.
    #[must_use]
    pub fn with_identity(mut self, device: i64, inode: i64) -> Self {
        self.device = device;
        self.inode = inode;
        self
    }

    /// Sets the link target. Ignored unless this is a symbolic link.
    #[must_use]
    pub fn with_link_target(mut self, target: impl Into<String>) -> Self {
        if self.kind == EntryType::SymbolicLink {
            self.link_target = Some(target.into());
        }
        self
    }

    /// Sets the local cache name.
    #[must_use]
    pub fn with_cache(mut self, cache: impl Into<String>) -> Self {
        self.cache = cache.into();
        self
    }

    /// Returns a copy of this record under a different name, keeping everything else.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Entry name within its directory.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the local cache file or directory.
    #[must_use]
    pub fn cache(&self) -> &str {
        &self.cache
    }

    /// Type tag.
    #[must_use]
    pub fn kind(&self) -> EntryType {
        self.kind
    }

    /// Size in bytes. Meaningless for directories.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last modification time.
    #[must_use]
    pub fn mtime(&self) -> SystemTime {
        system_time_from_millis(self.mtime_ms)
    }

    /// Last modification time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn mtime_millis(&self) -> i64 {
        self.mtime_ms
    }

    /// Access bits.
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Device id hint.
    #[must_use]
    pub fn device(&self) -> i64 {
        self.device
    }

    /// Inode id hint. Non-positive values mean unknown.
    #[must_use]
    pub fn inode(&self) -> i64 {
        self.inode
    }

    /// Whether the transport reported an inode for this entry.
    #[must_use]
    pub fn has_inode(&self) -> bool {
        self.inode > 0
    }

    /// Link target, present only for symbolic links.
    #[must_use]
    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    /// Whether this is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == EntryType::Directory
    }

    /// Whether this is a symbolic link.
    #[must_use]
    pub fn is_link(&self) -> bool {
        self.kind == EntryType::SymbolicLink
    }

    /// Whether this is a regular file.
    #[must_use]
    pub fn is_plain_file(&self) -> bool {
        self.kind == EntryType::Regular
    }

    /// Whether the remote grants read access.
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.access.contains(Access::READ)
    }

    /// Whether the remote grants write access.
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    /// Whether the remote grants execute access.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }

    /// Whether both records describe the same kind of entry.
    #[must_use]
    pub fn same_type(&self, other: &Self) -> bool {
        self.kind == other.kind
    }

    /// Whether both records carry the same modification time.
    #[must_use]
    pub fn same_last_modified(&self, other: &Self) -> bool {
        self.mtime_ms == other.mtime_ms
    }

    /// Whether both records grant the same access.
    #[must_use]
    pub fn same_access(&self, other: &Self) -> bool {
        self.access == other.access
    }

    /// Whether both records carry the same device and inode.
    #[must_use]
    pub fn same_inode(&self, other: &Self) -> bool {
        self.device == other.device && self.inode == other.inode
    }

    /// Serializes this record to a single line without a trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {} {} {}",
            encode_field(&self.name),
            encode_field(&self.cache),
            self.kind.as_char(),
            self.size,
            self.mtime_ms,
            self.access.triplet(),
            self.device,
            self.inode,
        );
        if let Some(target) = self.link_target.as_deref()
            && !target.is_empty()
        {
            line.push(' ');
            line.push_str(&encode_field(target));
        }
        line
    }

    /// Parses a line produced by [`Stat::to_line`].
    pub fn parse_line(line: &str) -> Result<Self, FormatError> {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != BASE_FIELD_COUNT && fields.len() != BASE_FIELD_COUNT + 1 {
            return Err(FormatError::new(format!(
                "expected {BASE_FIELD_COUNT} or {} fields, got {}: {line:?}",
                BASE_FIELD_COUNT + 1,
                fields.len()
            )));
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(FormatError::new(format!("empty field in record: {line:?}")));
        }

        let name = decode_field(fields[0], "name")?;
        let cache = decode_field(fields[1], "cache name")?;

        let mut type_chars = fields[2].chars();
        let kind = match (type_chars.next(), type_chars.next()) {
            (Some(c), None) => EntryType::from_char(c),
            _ => None,
        }
        .ok_or_else(|| FormatError::new(format!("bad type tag {:?}", fields[2])))?;

        let number = |idx: usize, what: &str| {
            fields[idx]
                .parse::<i64>()
                .map_err(|e| FormatError::new(format!("bad {what} {:?}: {e}", fields[idx])))
        };
        let size = fields[3]
            .parse::<u64>()
            .map_err(|e| FormatError::new(format!("bad size {:?}: {e}", fields[3])))?;
        let mtime_ms = number(4, "mtime")?;
        let access = Access::from_triplet(fields[5])?;
        let device = number(6, "device")?;
        let inode = number(7, "inode")?;

        let link_target = match (kind, fields.get(BASE_FIELD_COUNT)) {
            (EntryType::SymbolicLink, Some(raw)) => Some(decode_field(raw, "link target")?),
            (EntryType::SymbolicLink, None) => Some(String::new()),
            (_, Some(_)) => {
                return Err(FormatError::new(format!(
                    "link target on a non-link record: {line:?}"
                )));
            }
            (_, None) => None,
        };

        Ok(Self {
            name,
            cache,
            kind,
            size,
            mtime_ms,
            access,
            device,
            inode,
            link_target,
        })
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {:>10} {}",
            self.kind.as_char(),
            self.access.triplet(),
            self.size,
            self.name
        )?;
        if let Some(target) = &self.link_target {
            write!(f, " -> {target}")?;
        }
        Ok(())
    }
}

/// A directory entry: either resolved metadata or a placeholder for a name known to be absent.
///
/// Placeholders answer every structural query negatively. Their only observable property is
/// their name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DirEntry {
    /// Resolved metadata.
    Valid(Stat),
    /// A name that is known not to resolve.
    Placeholder(String),
}

impl DirEntry {
    /// Builds a placeholder for `name`.
    #[must_use]
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::Placeholder(name.into())
    }

    /// Entry name within its directory.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Valid(stat) => stat.name(),
            Self::Placeholder(name) => name,
        }
    }

    /// Whether the entry exists on the remote, as opposed to a placeholder.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// The metadata, if this entry is valid.
    #[must_use]
    pub fn as_valid(&self) -> Option<&Stat> {
        match self {
            Self::Valid(stat) => Some(stat),
            Self::Placeholder(_) => None,
        }
    }

    /// Whether this is a valid directory entry.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.as_valid().is_some_and(Stat::is_directory)
    }

    /// Whether this is a valid link entry.
    #[must_use]
    pub fn is_link(&self) -> bool {
        self.as_valid().is_some_and(Stat::is_link)
    }

    /// Whether this is a valid regular file entry.
    #[must_use]
    pub fn is_plain_file(&self) -> bool {
        self.as_valid().is_some_and(Stat::is_plain_file)
    }
}

impl From<Stat> for DirEntry {
    fn from(stat: Stat) -> Self {
        Self::Valid(stat)
    }
}

/// A listing of one directory captured at a single point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryList {
    entries: Vec<Stat>,
    timestamp: SystemTime,
}

impl DirEntryList {
    /// A listing captured at `timestamp`.
    #[must_use]
    pub fn new(entries: Vec<Stat>, timestamp: SystemTime) -> Self {
        Self { entries, timestamp }
    }

    /// A listing stamped with the current time.
    #[must_use]
    pub fn captured_now(entries: Vec<Stat>) -> Self {
        Self::new(entries, SystemTime::now())
    }

    /// The captured records.
    #[must_use]
    pub fn entries(&self) -> &[Stat] {
        &self.entries
    }

    /// The captured records, by value.
    #[must_use]
    pub fn into_entries(self) -> Vec<Stat> {
        self.entries
    }

    /// When the listing was captured.
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Looks up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Stat> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the listing has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the captured records.
    pub fn iter(&self) -> std::slice::Iter<'_, Stat> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a DirEntryList {
    type Item = &'a Stat;
    type IntoIter = std::slice::Iter<'a, Stat>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
