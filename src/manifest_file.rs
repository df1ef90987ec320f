use crate::compression::{self, compression_for_filename};
use crate::entry::{EntrySyntaxError, FileKind, ManifestEntry};
use crate::openpgp::{OpenPgpEnvironment, OpenPgpError, SignatureInfo};
use crate::util::paths::{dirname, path_inside_dir, path_starts_with};
use chrono::{DateTime, Utc};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const SIGNED_MESSAGE_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_FOOTER: &str = "-----END PGP SIGNATURE-----";

#[derive(Debug, thiserror::Error)]
pub enum ManifestFileError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("Corrupt compressed data in {path}: {source}")]
    Compression {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Manifest is not valid UTF-8: {0}")]
    Encoding(PathBuf),
    #[error("Line {line}: {source}")]
    Syntax {
        line: usize,
        #[source]
        source: EntrySyntaxError,
    },
    #[error("Line {line}: unsigned data before the signed message")]
    UnsignedDataBeforeSignature { line: usize },
    #[error("Line {line}: unexpected OpenPGP armor: {text}")]
    UnexpectedArmor { line: usize, text: String },
    #[error("Line {line}: unsigned data after the signed message")]
    TrailingUnsignedData { line: usize },
    #[error("Truncated OpenPGP signed message")]
    TruncatedSignedMessage,
    #[error(transparent)]
    OpenPgp(#[from] OpenPgpError),
    #[error("OpenPGP verification requested but no OpenPGP environment is configured")]
    NoOpenPgpEnvironment,
}

impl ManifestFileError {
    /// True for errors meaning the data is not a (valid) Manifest at all,
    /// as opposed to failures reading it.
    pub fn is_not_a_manifest(&self) -> bool {
        matches!(
            self,
            ManifestFileError::Syntax { .. }
                | ManifestFileError::Compression { .. }
                | ManifestFileError::Encoding(_)
                | ManifestFileError::UnsignedDataBeforeSignature { .. }
                | ManifestFileError::UnexpectedArmor { .. }
                | ManifestFileError::TrailingUnsignedData { .. }
                | ManifestFileError::TruncatedSignedMessage
        )
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ManifestFileError {
    if e.kind() == ErrorKind::PermissionDenied {
        ManifestFileError::PermissionDenied(path.to_path_buf())
    } else {
        ManifestFileError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Data,
    SignedPreamble,
    SignedData,
    Signature,
    PostSignedData,
}

fn is_armor(line: &str) -> bool {
    line.len() > 10 && line.starts_with("-----") && line.ends_with("-----")
}

/// A single Manifest: its entries in file order plus signature state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestFile {
    pub entries: Vec<ManifestEntry>,
    pub openpgp_signed: bool,
    pub openpgp_signature: Option<SignatureInfo>,
}

impl ManifestFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses Manifest text, appending to the current entries.
    ///
    /// If the text is clear-signed and `verify_openpgp` is set, the signed
    /// message is checked with `openpgp`. The entries are loaded even when
    /// that check fails, so callers may inspect them after the error.
    pub fn load_str(
        &mut self,
        text: &str,
        verify_openpgp: bool,
        openpgp: Option<&dyn OpenPgpEnvironment>,
    ) -> Result<(), ManifestFileError> {
        let mut state = ParserState::Data;
        let mut signed_message = String::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim_end_matches('\r');

            if !matches!(state, ParserState::Data | ParserState::PostSignedData) {
                signed_message.push_str(line);
                signed_message.push('\n');
            }

            let entry_text = match state {
                ParserState::Data => {
                    if line == SIGNED_MESSAGE_HEADER {
                        if !self.entries.is_empty() {
                            return Err(ManifestFileError::UnsignedDataBeforeSignature {
                                line: line_no,
                            });
                        }
                        state = ParserState::SignedPreamble;
                        signed_message.push_str(line);
                        signed_message.push('\n');
                        continue;
                    }
                    line
                }
                ParserState::SignedPreamble => {
                    if is_armor(line) {
                        return Err(ManifestFileError::UnexpectedArmor {
                            line: line_no,
                            text: line.to_string(),
                        });
                    }
                    if line.trim().is_empty() {
                        state = ParserState::SignedData;
                    }
                    continue;
                }
                ParserState::SignedData => {
                    if line == SIGNATURE_HEADER {
                        state = ParserState::Signature;
                        continue;
                    }
                    if is_armor(line) {
                        return Err(ManifestFileError::UnexpectedArmor {
                            line: line_no,
                            text: line.to_string(),
                        });
                    }
                    line.strip_prefix("- ").unwrap_or(line)
                }
                ParserState::Signature => {
                    if line == SIGNATURE_FOOTER {
                        state = ParserState::PostSignedData;
                    } else if is_armor(line) {
                        return Err(ManifestFileError::UnexpectedArmor {
                            line: line_no,
                            text: line.to_string(),
                        });
                    }
                    continue;
                }
                ParserState::PostSignedData => {
                    if !line.trim().is_empty() {
                        return Err(ManifestFileError::TrailingUnsignedData { line: line_no });
                    }
                    continue;
                }
            };

            let parsed = ManifestEntry::parse_line(entry_text)
                .map_err(|source| ManifestFileError::Syntax {
                    line: line_no,
                    source,
                })?;
            if let Some(entry) = parsed {
                self.entries.push(entry);
            }
        }

        match state {
            ParserState::Data => {}
            ParserState::PostSignedData => self.openpgp_signed = true,
            _ => return Err(ManifestFileError::TruncatedSignedMessage),
        }

        if self.openpgp_signed && verify_openpgp {
            let env = openpgp.ok_or(ManifestFileError::NoOpenPgpEnvironment)?;
            let info = env.verify_clearsigned(signed_message.as_bytes())?;
            debug!("Valid OpenPGP signature by {}", info.fingerprint);
            self.openpgp_signature = Some(info);
        }
        Ok(())
    }

    /// Reads `path` as text, decompressing according to its suffix.
    pub fn read_text(path: &Path) -> Result<String, ManifestFileError> {
        let mut reader = compression::open_decompressed(path).map_err(|e| io_error(path, e))?;
        let mut data = Vec::new();
        if let Err(e) = reader.read_to_end(&mut data) {
            let is_codec_error = matches!(
                e.kind(),
                ErrorKind::InvalidData
                    | ErrorKind::InvalidInput
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::Other
            );
            let compressed = path.to_str().and_then(compression_for_filename).is_some();
            return Err(if compressed && is_codec_error {
                ManifestFileError::Compression {
                    path: path.to_path_buf(),
                    source: e,
                }
            } else {
                io_error(path, e)
            });
        }
        String::from_utf8(data).map_err(|_| ManifestFileError::Encoding(path.to_path_buf()))
    }

    pub fn load_path(
        &mut self,
        path: &Path,
        verify_openpgp: bool,
        openpgp: Option<&dyn OpenPgpEnvironment>,
    ) -> Result<(), ManifestFileError> {
        let text = Self::read_text(path)?;
        self.load_str(&text, verify_openpgp, openpgp)
    }

    pub fn from_path(
        path: &Path,
        verify_openpgp: bool,
        openpgp: Option<&dyn OpenPgpEnvironment>,
    ) -> Result<Self, ManifestFileError> {
        let mut manifest = Self::new();
        manifest.load_path(path, verify_openpgp, openpgp)?;
        Ok(manifest)
    }

    /// Renders the unsigned Manifest text.
    pub fn dump(&self, sort: bool) -> String {
        let mut entries: Vec<&ManifestEntry> = self.entries.iter().collect();
        if sort {
            entries.sort_by(|a, b| a.sort_cmp(b));
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        out
    }

    /// Renders the Manifest, clear-signed by `openpgp`.
    pub fn dump_signed(
        &self,
        sort: bool,
        openpgp: &dyn OpenPgpEnvironment,
        keyid: Option<&str>,
    ) -> Result<Vec<u8>, ManifestFileError> {
        Ok(openpgp.clear_sign(self.dump(sort).as_bytes(), keyid)?)
    }

    pub fn save(&self, path: &Path, sort: bool) -> Result<(), ManifestFileError> {
        write_manifest_bytes(path, self.dump(sort).as_bytes())
    }

    pub fn find_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().find_map(|e| match e {
            ManifestEntry::Timestamp(ts) => Some(*ts),
            _ => None,
        })
    }

    /// Replaces the first TIMESTAMP entry, or adds one.
    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        for entry in self.entries.iter_mut() {
            if let ManifestEntry::Timestamp(old) = entry {
                *old = ts;
                return;
            }
        }
        self.entries.push(ManifestEntry::Timestamp(ts));
    }

    /// Finds the entry governing `path` (relative to this Manifest's
    /// directory). IGNORE entries match everything below them, other entries
    /// only their exact path. DIST and TIMESTAMP entries never match.
    pub fn find_path_entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| match e {
            ManifestEntry::Timestamp(_) => false,
            ManifestEntry::Ignore(ignored) => path_starts_with(path, ignored),
            ManifestEntry::File(fe) => {
                fe.kind != FileKind::Dist && fe.path == path
            }
        })
    }

    pub fn find_dist_entry(&self, filename: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| {
            matches!(e, ManifestEntry::File(fe)
                if fe.kind == FileKind::Dist && fe.path == filename)
        })
    }

    /// MANIFEST entries for sub-Manifests that may cover `path`: those whose
    /// directory contains `path`, plus those below `path` if `recursive`.
    pub fn find_manifests_for_path<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
    ) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |e| match e {
            ManifestEntry::File(fe) if fe.kind == FileKind::Manifest => {
                let directory = dirname(&fe.path);
                path_starts_with(path, directory)
                    || (recursive && path_inside_dir(directory, path))
            }
            _ => false,
        })
    }
}

/// Writes Manifest bytes to `path` atomically, compressing according to
/// the file name.
///
/// Writes to a temporary file, fsyncs it, then atomically renames it into place.
pub fn write_manifest_bytes(path: &Path, data: &[u8]) -> Result<(), ManifestFileError> {
    let compressed;
    let data = match path.to_str().and_then(compression_for_filename) {
        Some(format) => {
            compressed = compression::compress(format, data).map_err(|e| io_error(path, e))?;
            &compressed[..]
        }
        None => data,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp_file =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| io_error(parent, e))?;
    temp_file.write_all(data).map_err(|e| io_error(path, e))?;
    temp_file.as_file().sync_all().map_err(|e| io_error(path, e))?;
    temp_file.persist(path).map_err(|e| io_error(path, e.error))?;

    debug!("Wrote {} ({} bytes)", path.display(), data.len());
    Ok(())
}
