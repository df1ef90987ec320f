//! Manifest entries and their line-oriented text form.
//!
//! A Manifest line is a tag followed by space-separated fields:
//!
//! ```text
//! TIMESTAMP 2024-01-31T12:00:00Z
//! MANIFEST sub/Manifest 123 SHA512 abcd...
//! DATA some/file 42 BLAKE2B 0123... SHA512 4567...
//! AUX patch.diff 10 SHA512 ...          (stands for files/patch.diff)
//! IGNORE distfiles
//! ```
//!
//! Paths are escaped so that they never contain whitespace, control
//! characters or backslashes.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const AUX_PREFIX: &str = "files/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntrySyntaxError {
    #[error("Unknown entry tag: {0}")]
    UnknownTag(String),
    #[error("{tag} entry: wrong number of fields ({got})")]
    FieldCount { tag: EntryTag, got: usize },
    #[error("{0} entry: empty path")]
    EmptyPath(EntryTag),
    #[error("{tag} entry: absolute path {path}")]
    AbsolutePath { tag: EntryTag, path: String },
    #[error("DIST entry: file name contains a directory: {0}")]
    DistWithDirectory(String),
    #[error("AUX entry: path not under files/: {0}")]
    AuxOutsideFiles(String),
    #[error("{tag} entry: invalid size {value}")]
    InvalidSize { tag: EntryTag, value: String },
    #[error("{tag} entry: duplicate checksum {name}")]
    DuplicateChecksum { tag: EntryTag, name: String },
    #[error("{tag} entry: checksum {name} has no value")]
    DanglingChecksum { tag: EntryTag, name: String },
    #[error("Invalid escape sequence in path: {0}")]
    InvalidEscape(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Entry tags. Variants are declared in alphabetical order of their text form
/// so that the derived `Ord` sorts exactly like the tag strings do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryTag {
    Aux,
    Data,
    Dist,
    Ebuild,
    Ignore,
    Manifest,
    Misc,
    Timestamp,
}

impl EntryTag {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryTag::Aux => "AUX",
            EntryTag::Data => "DATA",
            EntryTag::Dist => "DIST",
            EntryTag::Ebuild => "EBUILD",
            EntryTag::Ignore => "IGNORE",
            EntryTag::Manifest => "MANIFEST",
            EntryTag::Misc => "MISC",
            EntryTag::Timestamp => "TIMESTAMP",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "AUX" => EntryTag::Aux,
            "DATA" => EntryTag::Data,
            "DIST" => EntryTag::Dist,
            "EBUILD" => EntryTag::Ebuild,
            "IGNORE" => EntryTag::Ignore,
            "MANIFEST" => EntryTag::Manifest,
            "MISC" => EntryTag::Misc,
            "TIMESTAMP" => EntryTag::Timestamp,
            _ => return None,
        })
    }
}

impl fmt::Display for EntryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kinds of entries that reference a file and carry size and checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Aux,
    Data,
    Dist,
    Ebuild,
    Manifest,
    Misc,
}

impl FileKind {
    pub fn tag(self) -> EntryTag {
        match self {
            FileKind::Aux => EntryTag::Aux,
            FileKind::Data => EntryTag::Data,
            FileKind::Dist => EntryTag::Dist,
            FileKind::Ebuild => EntryTag::Ebuild,
            FileKind::Manifest => EntryTag::Manifest,
            FileKind::Misc => EntryTag::Misc,
        }
    }

    pub fn from_tag(tag: EntryTag) -> Option<Self> {
        Some(match tag {
            EntryTag::Aux => FileKind::Aux,
            EntryTag::Data => FileKind::Data,
            EntryTag::Dist => FileKind::Dist,
            EntryTag::Ebuild => FileKind::Ebuild,
            EntryTag::Manifest => FileKind::Manifest,
            EntryTag::Misc => FileKind::Misc,
            EntryTag::Ignore | EntryTag::Timestamp => return None,
        })
    }

    /// Kinds that may describe the same path in different Manifests without
    /// conflicting. MISC and DIST entries stand on their own.
    pub fn is_path_class(self) -> bool {
        matches!(
            self,
            FileKind::Manifest | FileKind::Data | FileKind::Ebuild | FileKind::Aux
        )
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub kind: FileKind,
    /// Path relative to the directory of the owning Manifest. For AUX entries
    /// this is the effective path, including the leading `files/`.
    pub path: String,
    pub size: u64,
    /// Hex-encoded checksums keyed by hash name.
    pub checksums: BTreeMap<String, String>,
}

impl FileEntry {
    /// Creates an entry for `path` with no size or checksums recorded yet.
    pub fn new_for_path(kind: FileKind, path: &str) -> Result<Self, EntrySyntaxError> {
        let tag = kind.tag();
        if path.is_empty() {
            return Err(EntrySyntaxError::EmptyPath(tag));
        }
        if path.starts_with('/') {
            return Err(EntrySyntaxError::AbsolutePath {
                tag,
                path: path.to_string(),
            });
        }
        match kind {
            FileKind::Aux if !path.starts_with(AUX_PREFIX) || path.len() == AUX_PREFIX.len() => {
                return Err(EntrySyntaxError::AuxOutsideFiles(path.to_string()));
            }
            FileKind::Dist if path.contains('/') => {
                return Err(EntrySyntaxError::DistWithDirectory(path.to_string()));
            }
            _ => {}
        }
        Ok(FileEntry {
            kind,
            path: path.to_string(),
            size: 0,
            checksums: BTreeMap::new(),
        })
    }

    /// The path as written in the Manifest (AUX entries drop `files/`).
    pub fn written_path(&self) -> &str {
        match self.kind {
            FileKind::Aux => self.path.strip_prefix(AUX_PREFIX).unwrap_or(&self.path),
            _ => &self.path,
        }
    }

    pub fn hash_names(&self) -> Vec<String> {
        self.checksums.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    Timestamp(DateTime<Utc>),
    /// Ignores the path and everything below it.
    Ignore(String),
    File(FileEntry),
}

impl ManifestEntry {
    pub fn tag(&self) -> EntryTag {
        match self {
            ManifestEntry::Timestamp(_) => EntryTag::Timestamp,
            ManifestEntry::Ignore(_) => EntryTag::Ignore,
            ManifestEntry::File(entry) => entry.kind.tag(),
        }
    }

    /// The effective path of the entry, relative to its Manifest's directory.
    pub fn path(&self) -> Option<&str> {
        match self {
            ManifestEntry::Timestamp(_) => None,
            ManifestEntry::Ignore(path) => Some(path),
            ManifestEntry::File(entry) => Some(&entry.path),
        }
    }

    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            ManifestEntry::File(entry) => Some(entry),
            _ => None,
        }
    }

    /// Parses the fields following `tag` on a Manifest line.
    pub fn from_fields(tag: &str, fields: &[&str]) -> Result<Self, EntrySyntaxError> {
        let tag =
            EntryTag::from_tag(tag).ok_or_else(|| EntrySyntaxError::UnknownTag(tag.to_string()))?;

        match tag {
            EntryTag::Timestamp => {
                let [value] = fields else {
                    return Err(EntrySyntaxError::FieldCount {
                        tag,
                        got: fields.len(),
                    });
                };
                let ts = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
                    .map_err(|_| EntrySyntaxError::InvalidTimestamp(value.to_string()))?;
                Ok(ManifestEntry::Timestamp(ts.and_utc()))
            }
            EntryTag::Ignore => {
                let [path] = fields else {
                    return Err(EntrySyntaxError::FieldCount {
                        tag,
                        got: fields.len(),
                    });
                };
                Ok(ManifestEntry::Ignore(parse_path(tag, path)?))
            }
            _ => {
                let kind = FileKind::from_tag(tag).ok_or(EntrySyntaxError::FieldCount {
                    tag,
                    got: fields.len(),
                })?;
                Ok(ManifestEntry::File(parse_file_entry(kind, fields)?))
            }
        }
    }

    pub fn to_fields(&self) -> Vec<String> {
        match self {
            ManifestEntry::Timestamp(ts) => vec![
                EntryTag::Timestamp.to_string(),
                ts.format(TIMESTAMP_FORMAT).to_string(),
            ],
            ManifestEntry::Ignore(path) => vec![EntryTag::Ignore.to_string(), escape_path(path)],
            ManifestEntry::File(entry) => {
                let mut fields = Vec::with_capacity(3 + 2 * entry.checksums.len());
                fields.push(entry.kind.tag().to_string());
                fields.push(escape_path(entry.written_path()));
                fields.push(entry.size.to_string());
                for (name, value) in &entry.checksums {
                    fields.push(name.clone());
                    fields.push(value.clone());
                }
                fields
            }
        }
    }

    /// Parses one Manifest line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, EntrySyntaxError> {
        let mut fields = line.split_whitespace();
        let Some(tag) = fields.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = fields.collect();
        Self::from_fields(tag, &rest).map(Some)
    }

    pub fn to_line(&self) -> String {
        self.to_fields().join(" ")
    }

    /// Ordering used for sorted Manifest output: by tag, then by path
    /// (TIMESTAMP entries by their time).
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        self.tag().cmp(&other.tag()).then_with(|| match (self, other) {
            (ManifestEntry::Timestamp(a), ManifestEntry::Timestamp(b)) => a.cmp(b),
            _ => self.path().cmp(&other.path()),
        })
    }
}

fn parse_path(tag: EntryTag, raw: &str) -> Result<String, EntrySyntaxError> {
    let path = unescape_path(raw)?;
    if path.is_empty() {
        return Err(EntrySyntaxError::EmptyPath(tag));
    }
    if path.starts_with('/') {
        return Err(EntrySyntaxError::AbsolutePath { tag, path });
    }
    Ok(path)
}

fn parse_file_entry(kind: FileKind, fields: &[&str]) -> Result<FileEntry, EntrySyntaxError> {
    let tag = kind.tag();
    let [raw_path, raw_size, checksum_fields @ ..] = fields else {
        return Err(EntrySyntaxError::FieldCount {
            tag,
            got: fields.len(),
        });
    };

    let mut path = parse_path(tag, raw_path)?;
    match kind {
        FileKind::Dist if path.contains('/') => {
            return Err(EntrySyntaxError::DistWithDirectory(path));
        }
        FileKind::Aux => path = format!("{AUX_PREFIX}{path}"),
        _ => {}
    }

    let size = raw_size
        .parse::<u64>()
        .map_err(|_| EntrySyntaxError::InvalidSize {
            tag,
            value: raw_size.to_string(),
        })?;

    let mut checksums = BTreeMap::new();
    let mut pairs = checksum_fields.iter();
    while let Some(name) = pairs.next() {
        let Some(value) = pairs.next() else {
            return Err(EntrySyntaxError::DanglingChecksum {
                tag,
                name: name.to_string(),
            });
        };
        if checksums
            .insert(name.to_string(), value.to_string())
            .is_some()
        {
            return Err(EntrySyntaxError::DuplicateChecksum {
                tag,
                name: name.to_string(),
            });
        }
    }

    Ok(FileEntry {
        kind,
        path,
        size,
        checksums,
    })
}

fn needs_escape(c: char) -> bool {
    c.is_control() || c.is_whitespace() || c == '\\'
}

/// Escapes characters that cannot appear verbatim in a Manifest path, using
/// the shortest of `\xHH`, `\uHHHH` and `\UHHHHHHHH` that fits.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if !needs_escape(c) {
            out.push(c);
            continue;
        }
        let code = u32::from(c);
        if code <= 0x7F {
            out.push_str(&format!("\\x{code:02X}"));
        } else if code <= 0xFFFF {
            out.push_str(&format!("\\u{code:04X}"));
        } else {
            out.push_str(&format!("\\U{code:08X}"));
        }
    }
    out
}

pub fn unescape_path(raw: &str) -> Result<String, EntrySyntaxError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits = match chars.next() {
            Some('x') => 2,
            Some('u') => 4,
            Some('U') => 8,
            _ => return Err(EntrySyntaxError::InvalidEscape(raw.to_string())),
        };
        let hex: String = chars.by_ref().take(digits).collect();
        if hex.len() != digits || !hex.chars().all(|h| h.is_ascii_hexdigit()) {
            return Err(EntrySyntaxError::InvalidEscape(raw.to_string()));
        }
        let decoded = u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| EntrySyntaxError::InvalidEscape(raw.to_string()))?;
        out.push(decoded);
    }
    Ok(out)
}
