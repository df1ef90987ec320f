//! Comparing filesystem paths against Manifest entries.

use crate::entry::{FileEntry, ManifestEntry};
use crate::hashing::{self, HashError, HashValues, SIZE_PSEUDO_HASH};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Pseudo-field reported when a path exists but should not, or vice versa.
pub const EXISTS_FIELD: &str = "__exists__";
/// Pseudo-field reported when a path has the wrong file type.
pub const TYPE_FIELD: &str = "__type__";

/// One difference between what an entry records and what was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDiff {
    pub field: String,
    pub expected: Option<String>,
    pub got: Option<String>,
}

impl EntryDiff {
    pub fn new(
        field: impl Into<String>,
        expected: Option<impl ToString>,
        got: Option<impl ToString>,
    ) -> Self {
        EntryDiff {
            field: field.into(),
            expected: expected.map(|v| v.to_string()),
            got: got.map(|v| v.to_string()),
        }
    }

    fn exists(expected: bool) -> Self {
        EntryDiff::new(EXISTS_FIELD, Some(expected), Some(!expected))
    }
}

impl fmt::Display for EntryDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, have {}",
            self.field,
            self.expected.as_deref().unwrap_or("(none)"),
            self.got.as_deref().unwrap_or("(none)")
        )
    }
}

pub(crate) fn format_diffs(diff: &[EntryDiff]) -> String {
    diff.iter()
        .map(EntryDiff::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A path failed verification against its entry (or against the absence of one).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {}", format_diffs(.diff))]
pub struct ManifestMismatch {
    /// Path relative to the tree root.
    pub path: String,
    pub entry: Option<ManifestEntry>,
    pub diff: Vec<EntryDiff>,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Path crosses filesystem boundary: {0}")]
    CrossDevice(PathBuf),
    #[error("Invalid path {path}: {detail}")]
    InvalidPath { path: PathBuf, detail: EntryDiff },
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
}

fn io_error(path: &Path, e: std::io::Error) -> VerifyError {
    if e.kind() == ErrorKind::PermissionDenied {
        VerifyError::PermissionDenied(path.to_path_buf())
    } else {
        VerifyError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
    Unknown,
}

impl PathKind {
    fn from_metadata(metadata: &fs::Metadata) -> Self {
        let ft = metadata.file_type();
        if ft.is_file() {
            PathKind::RegularFile
        } else if ft.is_dir() {
            PathKind::Directory
        } else if ft.is_char_device() {
            PathKind::CharDevice
        } else if ft.is_block_device() {
            PathKind::BlockDevice
        } else if ft.is_fifo() {
            PathKind::NamedPipe
        } else if ft.is_socket() {
            PathKind::Socket
        } else {
            PathKind::Unknown
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PathKind::RegularFile => "regular file",
            PathKind::Directory => "directory",
            PathKind::CharDevice => "character device",
            PathKind::BlockDevice => "block device",
            PathKind::NamedPipe => "named pipe",
            PathKind::Socket => "UNIX socket",
            PathKind::Unknown => "unknown",
        }
    }
}

/// Facts about an existing path. Holds the open file (if it could be opened)
/// until the checksums are taken or the value is dropped.
#[derive(Debug)]
pub struct PresentPath {
    path: PathBuf,
    pub device: u64,
    pub kind: PathKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    file: Option<File>,
}

impl PresentPath {
    /// Streams the file through the requested hashes, releasing the handle.
    pub fn checksums<S: AsRef<str>>(self, hashes: &[S]) -> Result<HashValues, VerifyError> {
        let file = match self.file {
            Some(file) => file,
            None => File::open(&self.path).map_err(|e| io_error(&self.path, e))?,
        };
        let values = hashing::hash_reader(file, hashes).map_err(|e| match e {
            HashError::Io(source) => io_error(&self.path, source),
            other => VerifyError::Hash(other),
        })?;
        debug!("Checksums of {}: {:?}", self.path.display(), values.checksums);
        Ok(values)
    }
}

/// Stats `path` without following it further than `open(2)` would.
///
/// The path is opened non-blocking so that named pipes do not hang. A path
/// that vanishes between calls, or whose parent is not a directory, is
/// reported as missing. Sockets and similar objects that refuse to be opened
/// are still stat'ed but carry no file handle.
pub fn stat_path(path: &Path) -> Result<Option<PresentPath>, VerifyError> {
    let opened = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);

    let (file, metadata) = match opened {
        Ok(file) => {
            let metadata = file.metadata().map_err(|e| io_error(path, e))?;
            (Some(file), metadata)
        }
        Err(e) if is_missing(&e) => return Ok(None),
        Err(e) if matches!(e.raw_os_error(), Some(libc::ENXIO) | Some(libc::EOPNOTSUPP)) => {
            match fs::metadata(path) {
                Ok(metadata) => (None, metadata),
                Err(e) if is_missing(&e) => return Ok(None),
                Err(e) => return Err(io_error(path, e)),
            }
        }
        Err(e) => return Err(io_error(path, e)),
    };

    let kind = PathKind::from_metadata(&metadata);
    Ok(Some(PresentPath {
        path: path.to_path_buf(),
        device: metadata.dev(),
        kind,
        size: metadata.len(),
        mtime: metadata.modified().ok(),
        file: if kind == PathKind::RegularFile { file } else { None },
    }))
}

fn is_missing(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

fn check_device(path: &Path, present: &PresentPath, expected_dev: Option<u64>) -> Result<(), VerifyError> {
    match expected_dev {
        Some(dev) if dev != present.device => Err(VerifyError::CrossDevice(path.to_path_buf())),
        _ => Ok(()),
    }
}

fn mtime_unchanged_since(present: &PresentPath, last_mtime: Option<SystemTime>) -> bool {
    match (present.mtime, last_mtime) {
        (Some(mtime), Some(last)) => mtime <= last,
        _ => false,
    }
}

/// Verifies `path` against `entry`. `None` means the path must not exist.
///
/// Returns whether the path matches and the list of differences. Crossing
/// onto a device other than `expected_dev` is an error rather than a
/// difference. If `last_mtime` is given, regular files of non-zero size not
/// modified since then are accepted without checksumming.
pub fn verify_path(
    path: &Path,
    entry: Option<&ManifestEntry>,
    expected_dev: Option<u64>,
    last_mtime: Option<SystemTime>,
) -> Result<(bool, Vec<EntryDiff>), VerifyError> {
    let file_entry = match entry {
        Some(ManifestEntry::Ignore(_)) | Some(ManifestEntry::Timestamp(_)) => {
            return Ok((true, Vec::new()));
        }
        Some(ManifestEntry::File(file_entry)) => Some(file_entry),
        None => None,
    };

    let present = stat_path(path)?;
    let (file_entry, present) = match (file_entry, present) {
        (None, None) => return Ok((true, Vec::new())),
        (None, Some(_)) => return Ok((false, vec![EntryDiff::exists(false)])),
        (Some(_), None) => return Ok((false, vec![EntryDiff::exists(true)])),
        (Some(file_entry), Some(present)) => (file_entry, present),
    };

    check_device(path, &present, expected_dev)?;

    if present.kind != PathKind::RegularFile {
        return Ok((
            false,
            vec![EntryDiff::new(
                TYPE_FIELD,
                Some(PathKind::RegularFile.label()),
                Some(present.kind.label()),
            )],
        ));
    }

    // Some filesystems report 0 for files whose size they do not know.
    if present.size != 0 && present.size != file_entry.size {
        return Ok((
            false,
            vec![EntryDiff::new(
                SIZE_PSEUDO_HASH,
                Some(file_entry.size),
                Some(present.size),
            )],
        ));
    }

    if present.size != 0 && mtime_unchanged_since(&present, last_mtime) {
        debug!("Skipping {}: not modified since last check", path.display());
        return Ok((true, Vec::new()));
    }

    let values = present.checksums(&file_entry.hash_names())?;
    let diff = checksum_diff(file_entry, &values);
    Ok((diff.is_empty(), diff))
}

fn checksum_diff(entry: &FileEntry, values: &HashValues) -> Vec<EntryDiff> {
    let mut diff = Vec::new();
    if values.size != entry.size {
        diff.push(EntryDiff::new(
            SIZE_PSEUDO_HASH,
            Some(entry.size),
            Some(values.size),
        ));
    }
    for (name, expected) in &entry.checksums {
        let got = values.checksums.get(name);
        if got != Some(expected) {
            diff.push(EntryDiff::new(name.as_str(), Some(expected), got));
        }
    }
    diff
}

/// Recomputes size and checksums of `entry` from `path`.
///
/// Uses `hashes` if given, otherwise the hash names the entry already has.
/// Returns whether anything changed. The path must exist and be a regular
/// file.
pub fn update_file_entry<S: AsRef<str>>(
    path: &Path,
    entry: &mut FileEntry,
    hashes: Option<&[S]>,
    expected_dev: Option<u64>,
    last_mtime: Option<SystemTime>,
) -> Result<bool, VerifyError> {
    let present = stat_path(path)?.ok_or_else(|| VerifyError::InvalidPath {
        path: path.to_path_buf(),
        detail: EntryDiff::exists(true),
    })?;

    check_device(path, &present, expected_dev)?;

    if present.kind != PathKind::RegularFile {
        return Err(VerifyError::InvalidPath {
            path: path.to_path_buf(),
            detail: EntryDiff::new(
                TYPE_FIELD,
                Some(PathKind::RegularFile.label()),
                Some(present.kind.label()),
            ),
        });
    }

    let hash_names: Vec<String> = match hashes {
        Some(hashes) => hashes
            .iter()
            .map(|h| h.as_ref())
            .filter(|h| *h != SIZE_PSEUDO_HASH)
            .map(str::to_string)
            .collect(),
        None => entry.hash_names(),
    };

    let same_hash_set = hash_names.iter().collect::<BTreeSet<_>>()
        == entry.checksums.keys().collect::<BTreeSet<_>>();
    if present.size != 0
        && present.size == entry.size
        && same_hash_set
        && mtime_unchanged_since(&present, last_mtime)
    {
        debug!("Skipping {}: not modified since last update", path.display());
        return Ok(false);
    }

    let values = present.checksums(&hash_names)?;
    let changed = values.size != entry.size || values.checksums != entry.checksums;
    entry.size = values.size;
    entry.checksums = values.checksums;
    Ok(changed)
}

/// Decides whether two entries for the same path can coexist.
///
/// Differing tag classes or sizes make the entries incompatible. Checksum
/// differences, both in hash names and in values, are listed in the diff
/// but do not affect the verdict.
pub fn entries_compatible(e1: &ManifestEntry, e2: &ManifestEntry) -> (bool, Vec<EntryDiff>) {
    let (a, b) = match (e1.as_file(), e2.as_file()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            if e1.tag() == e2.tag() {
                return (true, Vec::new());
            }
            return (
                false,
                vec![EntryDiff::new(TYPE_FIELD, Some(e1.tag()), Some(e2.tag()))],
            );
        }
    };

    let mut ok = true;
    let mut diff = Vec::new();

    if a.kind != b.kind {
        diff.push(EntryDiff::new(TYPE_FIELD, Some(a.kind), Some(b.kind)));
        if !(a.kind.is_path_class() && b.kind.is_path_class()) {
            ok = false;
        }
    }

    if a.size != b.size {
        diff.push(EntryDiff::new(SIZE_PSEUDO_HASH, Some(a.size), Some(b.size)));
        ok = false;
    }

    let names: BTreeSet<&String> = a.checksums.keys().chain(b.checksums.keys()).collect();
    for name in names {
        let (va, vb) = (a.checksums.get(name), b.checksums.get(name));
        if va != vb {
            diff.push(EntryDiff::new(name.as_str(), va, vb));
        }
    }

    (ok, diff)
}
