//! The in-memory forest of Manifests making up one tree.
//!
//! Manifests are kept in a map keyed by their path relative to the tree
//! root and loaded lazily, each one verified against the MANIFEST entry
//! that references it. Queries resolve a path to the Manifests covering it
//! most specific first. Verification walks the live filesystem alongside the
//! merged entry index; updates mutate entries in place and mark the owning
//! Manifests dirty until [`ManifestForest::save_manifests`] writes them out.

mod update;
mod walk;

#[cfg(test)]
mod tests;

use crate::compression::{CompressionFormat, manifest_filenames};
use crate::entry::{EntrySyntaxError, EntryTag, FileKind, ManifestEntry};
use crate::hashing::HashError;
use crate::manifest_file::{ManifestFile, ManifestFileError};
use crate::openpgp::{OpenPgpEnvironment, OpenPgpError};
use crate::profile::Profile;
use crate::util::paths::{basename, dirname, join_relpath, path_starts_with, relative_to};
use crate::verify::{self, EntryDiff, ManifestMismatch, VerifyError};
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};
use walk::DirectoryWalk;

#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    #[error("Manifest {path}: {source}")]
    ManifestFile {
        path: String,
        #[source]
        source: ManifestFileError,
    },
    #[error("Verification failed: {0}")]
    Mismatch(#[from] ManifestMismatch),
    #[error("Incompatible entries for {path}: {}", verify::format_diffs(.diff))]
    IncompatibleEntry {
        path: String,
        first: ManifestEntry,
        second: ManifestEntry,
        diff: Vec<EntryDiff>,
    },
    #[error("Path crosses filesystem boundary: {0}")]
    CrossDevice(PathBuf),
    #[error("Symlink loop detected at {0}")]
    SymlinkLoop(PathBuf),
    #[error("Invalid path {path}: {detail}")]
    InvalidPath { path: PathBuf, detail: EntryDiff },
    #[error("Path is ignored by a Manifest: {0}")]
    IgnoredPath(String),
    #[error("Invalid entry for {path}: {source}")]
    Entry {
        path: String,
        #[source]
        source: EntrySyntaxError,
    },
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    OpenPgp(#[from] OpenPgpError),
    #[error("Signing requested but no OpenPGP environment is configured")]
    NoOpenPgpEnvironment,
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("Not a valid top-level Manifest path: {0}")]
    InvalidManifestPath(PathBuf),
    #[error("Path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
}

impl From<VerifyError> for ForestError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::CrossDevice(path) => ForestError::CrossDevice(path),
            VerifyError::InvalidPath { path, detail } => ForestError::InvalidPath { path, detail },
            VerifyError::Hash(e) => ForestError::Hash(e),
            VerifyError::Io { path, source } => ForestError::Io { path, source },
            VerifyError::PermissionDenied(path) => ForestError::PermissionDenied(path),
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ForestError {
    if e.kind() == ErrorKind::PermissionDenied {
        ForestError::PermissionDenied(path.to_path_buf())
    } else {
        ForestError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

/// Fail handler that turns every mismatch into an error.
pub fn raise_on_mismatch(mismatch: ManifestMismatch) -> Result<bool, ForestError> {
    Err(ForestError::Mismatch(mismatch))
}

/// Fail handler that reports the mismatch and carries on.
pub fn log_and_continue(mismatch: ManifestMismatch) -> Result<bool, ForestError> {
    error!("{}", mismatch);
    Ok(false)
}

#[derive(Debug, Clone)]
pub struct ForestOptions {
    /// Verify the OpenPGP signature of the top-level Manifest when loading it.
    pub verify_openpgp: bool,
    /// Start with an empty top-level Manifest if none exists.
    pub allow_create: bool,
    pub allow_xdev: bool,
    /// Hashes for new entries.
    pub hashes: Vec<String>,
    /// Clear-sign the top-level Manifest on save. `None` keeps it signed
    /// or unsigned as it was loaded.
    pub sign_openpgp: Option<bool>,
    pub openpgp_keyid: Option<String>,
    /// Uncompressed size at which Manifests get compressed. `None`
    /// leaves compression as it is.
    pub compress_watermark: Option<u64>,
    pub compress_format: CompressionFormat,
    pub sort: bool,
}

impl Default for ForestOptions {
    fn default() -> Self {
        ForestOptions {
            verify_openpgp: false,
            allow_create: false,
            allow_xdev: false,
            hashes: vec!["BLAKE2B".to_string(), "SHA512".to_string()],
            sign_openpgp: None,
            openpgp_keyid: None,
            compress_watermark: None,
            compress_format: CompressionFormat::Gz,
            sort: false,
        }
    }
}

/// Entries under a path, grouped by directory and then by file name.
pub type FileEntryDict = BTreeMap<String, BTreeMap<String, ManifestEntry>>;

pub struct ManifestForest {
    root_directory: PathBuf,
    top_level_manifest_filename: String,
    loaded_manifests: BTreeMap<String, ManifestFile>,
    updated_manifests: BTreeSet<String>,
    manifest_device: u64,
    options: ForestOptions,
    profile: Box<dyn Profile>,
    openpgp: Option<Box<dyn OpenPgpEnvironment>>,
}

impl ManifestForest {
    /// Opens the tree whose top-level Manifest is `top_level_manifest_path`.
    pub fn new(
        top_level_manifest_path: &Path,
        options: ForestOptions,
        profile: Box<dyn Profile>,
        openpgp: Option<Box<dyn OpenPgpEnvironment>>,
    ) -> Result<Self, ForestError> {
        let filename = top_level_manifest_path
            .file_name()
            .ok_or_else(|| ForestError::InvalidManifestPath(top_level_manifest_path.to_path_buf()))?
            .to_str()
            .ok_or_else(|| ForestError::NonUtf8Path(top_level_manifest_path.to_path_buf()))?
            .to_string();
        let root_directory = match top_level_manifest_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let root_metadata =
            std::fs::metadata(&root_directory).map_err(|e| io_error(&root_directory, e))?;

        let mut forest = ManifestForest {
            root_directory,
            top_level_manifest_filename: filename.clone(),
            loaded_manifests: BTreeMap::new(),
            updated_manifests: BTreeSet::new(),
            manifest_device: root_metadata.dev(),
            options,
            profile,
            openpgp,
        };

        let mut top = ManifestFile::new();
        let loaded = top.load_path(
            top_level_manifest_path,
            forest.options.verify_openpgp,
            forest.openpgp.as_deref(),
        );
        match loaded {
            Ok(()) => debug!("Loaded top-level Manifest {}", top_level_manifest_path.display()),
            Err(ManifestFileError::Io { source, .. })
                if source.kind() == ErrorKind::NotFound && forest.options.allow_create =>
            {
                info!("Creating new top-level Manifest {}", top_level_manifest_path.display());
                for ignore in forest.profile.ignore_paths_for_new_manifest("") {
                    top.entries.push(ManifestEntry::Ignore(ignore));
                }
                forest.updated_manifests.insert(filename.clone());
            }
            Err(source) => {
                return Err(ForestError::ManifestFile {
                    path: filename,
                    source,
                });
            }
        }
        forest.loaded_manifests.insert(filename, top);
        Ok(forest)
    }

    pub fn root_directory(&self) -> &Path {
        &self.root_directory
    }

    pub fn top_level_manifest_filename(&self) -> &str {
        &self.top_level_manifest_filename
    }

    pub fn options(&self) -> &ForestOptions {
        &self.options
    }

    pub fn loaded_manifests(&self) -> &BTreeMap<String, ManifestFile> {
        &self.loaded_manifests
    }

    /// Relative paths of Manifests with unsaved changes.
    pub fn updated_manifests(&self) -> &BTreeSet<String> {
        &self.updated_manifests
    }

    pub fn top_level_manifest(&self) -> Option<&ManifestFile> {
        self.loaded_manifests.get(&self.top_level_manifest_filename)
    }

    fn abs_path(&self, relpath: &str) -> PathBuf {
        if relpath.is_empty() {
            self.root_directory.clone()
        } else {
            self.root_directory.join(relpath)
        }
    }

    fn expected_device(&self) -> Option<u64> {
        if self.options.allow_xdev {
            None
        } else {
            Some(self.manifest_device)
        }
    }

    /// Loaded Manifests relevant to `path`, most specific first.
    ///
    /// These are the Manifests whose directory contains `path` and, if
    /// `recursive`, also those whose directory lies below `path`.
    pub fn manifests_for_path(&self, path: &str, recursive: bool) -> Vec<(&str, &ManifestFile)> {
        let mut found: Vec<(&str, &ManifestFile)> = self
            .loaded_manifests
            .iter()
            .filter(|(relpath, _)| {
                let directory = dirname(relpath);
                path_starts_with(path, directory)
                    || (recursive && path_starts_with(directory, path))
            })
            .map(|(relpath, m)| (relpath.as_str(), m))
            .collect();
        found.sort_by(|a, b| dirname(b.0).len().cmp(&dirname(a.0).len()));
        found
    }

    fn manifest_paths_for_path(&self, path: &str, recursive: bool) -> Vec<String> {
        self.manifests_for_path(path, recursive)
            .into_iter()
            .map(|(relpath, _)| relpath.to_string())
            .collect()
    }

    /// Loads every sub-Manifest needed to answer queries about `path`
    /// (and, if `recursive`, everything below it).
    ///
    /// With `verify`, each sub-Manifest must match the MANIFEST entry that
    /// references it. Without, referenced Manifests that do not exist are
    /// skipped with a warning.
    pub fn load_manifests_for_path(
        &mut self,
        path: &str,
        recursive: bool,
        verify: bool,
    ) -> Result<(), ForestError> {
        let mut skipped: BTreeSet<String> = BTreeSet::new();
        loop {
            let mut to_load: BTreeMap<String, ManifestEntry> = BTreeMap::new();
            for (relpath, manifest) in self.manifests_for_path(path, recursive) {
                let directory = dirname(relpath);
                let subpath = relative_to(path, directory).unwrap_or("");
                for entry in manifest.find_manifests_for_path(subpath, recursive) {
                    let Some(entry_path) = entry.path() else {
                        continue;
                    };
                    let full = join_relpath(directory, entry_path);
                    if self.loaded_manifests.contains_key(&full) || skipped.contains(&full) {
                        continue;
                    }
                    to_load.entry(full).or_insert_with(|| entry.clone());
                }
            }

            if to_load.is_empty() {
                return Ok(());
            }

            for (relpath, entry) in to_load {
                let abs = self.abs_path(&relpath);
                if verify {
                    let (ok, diff) =
                        verify::verify_path(&abs, Some(&entry), self.expected_device(), None)?;
                    if !ok {
                        return Err(ForestError::Mismatch(ManifestMismatch {
                            path: relpath,
                            entry: Some(entry),
                            diff,
                        }));
                    }
                } else if verify::stat_path(&abs)?.is_none() {
                    warn!("Referenced Manifest {} does not exist, skipping", relpath);
                    skipped.insert(relpath);
                    continue;
                }

                let manifest = ManifestFile::from_path(&abs, false, None).map_err(|source| {
                    ForestError::ManifestFile {
                        path: relpath.clone(),
                        source,
                    }
                })?;
                debug!("Loaded Manifest {}", relpath);
                self.loaded_manifests.insert(relpath, manifest);
            }
        }
    }

    /// Finds the entry governing `path`, loading Manifests as needed.
    pub fn find_path_entry(&mut self, path: &str) -> Result<Option<ManifestEntry>, ForestError> {
        self.load_manifests_for_path(path, false, true)?;
        Ok(self.find_loaded_path_entry(path).cloned())
    }

    fn find_loaded_path_entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.manifests_for_path(path, false)
            .into_iter()
            .find_map(|(relpath, manifest)| {
                let subpath = relative_to(path, dirname(relpath))?;
                manifest.find_path_entry(subpath)
            })
    }

    /// True if an already loaded Manifest IGNOREs `path`.
    fn is_ignored(&self, path: &str) -> bool {
        matches!(
            self.find_loaded_path_entry(path),
            Some(ManifestEntry::Ignore(_))
        )
    }

    pub fn find_timestamp(&self) -> Option<DateTime<Utc>> {
        self.top_level_manifest()?.find_timestamp()
    }

    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        let filename = self.top_level_manifest_filename.clone();
        if let Some(top) = self.loaded_manifests.get_mut(&filename) {
            top.set_timestamp(ts);
            self.updated_manifests.insert(filename);
        }
    }

    /// Finds the DIST entry for `filename` as seen from directory `relpath`.
    pub fn find_dist_entry(
        &mut self,
        filename: &str,
        relpath: &str,
    ) -> Result<Option<ManifestEntry>, ForestError> {
        let path = join_relpath(relpath, filename);
        self.load_manifests_for_path(&path, false, true)?;
        Ok(self
            .manifests_for_path(&path, false)
            .into_iter()
            .find_map(|(_, manifest)| manifest.find_dist_entry(filename))
            .cloned())
    }

    /// Merged view of all entries at or below `path`.
    ///
    /// DIST and TIMESTAMP entries are left out unless `only_types` asks for
    /// them. Entries recorded in several Manifests for the same path are
    /// merged; incompatible duplicates are an error.
    pub fn get_file_entry_dict(
        &mut self,
        path: &str,
        only_types: Option<&[EntryTag]>,
        verify_manifests: bool,
    ) -> Result<FileEntryDict, ForestError> {
        self.load_manifests_for_path(path, true, verify_manifests)?;

        let mut out = FileEntryDict::new();
        for (relpath, manifest) in self.manifests_for_path(path, true) {
            let directory = dirname(relpath);
            for entry in &manifest.entries {
                let wanted = match only_types {
                    Some(types) => types.contains(&entry.tag()),
                    None => !matches!(entry.tag(), EntryTag::Dist | EntryTag::Timestamp),
                };
                let Some(entry_path) = entry.path().filter(|_| wanted) else {
                    continue;
                };
                let full = join_relpath(directory, entry_path);
                if !path_starts_with(&full, path) {
                    continue;
                }

                let by_name = out.entry(dirname(&full).to_string()).or_default();
                match by_name.entry(basename(&full).to_string()) {
                    MapEntry::Vacant(slot) => {
                        slot.insert(entry.clone());
                    }
                    MapEntry::Occupied(mut slot) => {
                        merge_duplicate_entry(&full, slot.get_mut(), entry)?;
                    }
                }
            }
        }
        Ok(out)
    }

    fn check_path<F>(
        &self,
        relpath: &str,
        entry: Option<ManifestEntry>,
        last_mtime: Option<SystemTime>,
        on_failure: &mut F,
    ) -> Result<bool, ForestError>
    where
        F: FnMut(ManifestMismatch) -> Result<bool, ForestError>,
    {
        let abs = self.abs_path(relpath);
        let (ok, diff) =
            verify::verify_path(&abs, entry.as_ref(), self.expected_device(), last_mtime)?;
        if ok {
            return Ok(true);
        }
        on_failure(ManifestMismatch {
            path: relpath.to_string(),
            entry,
            diff,
        })
    }

    /// Verifies the directory tree at `path` against the Manifests.
    ///
    /// Each mismatch (missing, stray or changed file) is passed to
    /// `on_failure`, which either returns an error to abort or a verdict to
    /// continue with. Returns false if any handler call returned false.
    /// Device crossings, symlink loops and incompatible entries always abort.
    pub fn assert_directory_verifies<F>(
        &mut self,
        path: &str,
        mut on_failure: F,
        last_mtime: Option<SystemTime>,
    ) -> Result<bool, ForestError>
    where
        F: FnMut(ManifestMismatch) -> Result<bool, ForestError>,
    {
        if let Some(ManifestEntry::Ignore(_)) = self.find_path_entry(path)? {
            return Ok(true);
        }

        let mut entry_dict = self.get_file_entry_dict(path, None, true)?;
        let mut ok = true;

        let mut walk = DirectoryWalk::new(&self.root_directory, path, self.expected_device());
        while let Some(dir) = walk.next_directory()? {
            let mut dir_entries = entry_dict.remove(&dir.relpath).unwrap_or_default();

            let mut subdirs = Vec::new();
            for name in &dir.dirs {
                let full = join_relpath(&dir.relpath, name);
                match dir_entries.remove(name) {
                    Some(ManifestEntry::Ignore(_)) => {
                        entry_dict.retain(|d, _| !path_starts_with(d, &full));
                    }
                    // a directory where the Manifest expects something else
                    Some(entry) => {
                        ok &= self.check_path(&full, Some(entry), last_mtime, &mut on_failure)?;
                    }
                    None => subdirs.push(name.clone()),
                }
            }

            for name in &dir.files {
                let full = join_relpath(&dir.relpath, name);
                if full == self.top_level_manifest_filename {
                    continue;
                }
                let entry = dir_entries.remove(name);
                if matches!(entry, Some(ManifestEntry::Ignore(_))) {
                    continue;
                }
                ok &= self.check_path(&full, entry, last_mtime, &mut on_failure)?;
            }

            // recorded, but neither a file nor a directory we walk (hidden or missing)
            for (name, entry) in dir_entries {
                let full = join_relpath(&dir.relpath, &name);
                ok &= self.check_path(&full, Some(entry), last_mtime, &mut on_failure)?;
            }

            walk.descend(&dir, &subdirs);
        }

        for (directory, entries) in entry_dict {
            for (name, entry) in entries {
                let full = join_relpath(&directory, &name);
                ok &= self.check_path(&full, Some(entry), last_mtime, &mut on_failure)?;
            }
        }

        Ok(ok)
    }

    /// Verifies a single path against its entry.
    pub fn assert_path_verifies<F>(
        &mut self,
        path: &str,
        mut on_failure: F,
        last_mtime: Option<SystemTime>,
    ) -> Result<bool, ForestError>
    where
        F: FnMut(ManifestMismatch) -> Result<bool, ForestError>,
    {
        let entry = self.find_path_entry(path)?;
        self.check_path(path, entry, last_mtime, &mut on_failure)
    }
}

/// Merges `new` into `existing`, both describing `path`.
///
/// Checksums missing from `existing` are added. Conflicting values keep
/// the first one seen.
fn merge_duplicate_entry(
    path: &str,
    existing: &mut ManifestEntry,
    new: &ManifestEntry,
) -> Result<(), ForestError> {
    let (ok, diff) = verify::entries_compatible(existing, new);
    if !ok {
        return Err(ForestError::IncompatibleEntry {
            path: path.to_string(),
            first: existing.clone(),
            second: new.clone(),
            diff,
        });
    }

    if let (ManifestEntry::File(first), ManifestEntry::File(second)) = (existing, new) {
        for (name, value) in &second.checksums {
            match first.checksums.get(name) {
                None => {
                    first.checksums.insert(name.clone(), value.clone());
                }
                Some(kept) if kept != value => {
                    warn!(
                        "Conflicting {} checksums recorded for {}, keeping {}",
                        name, path, kept
                    );
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Rewrites an entry's path when moving it to a Manifest in another
/// directory. AUX entries that no longer sit under `files/` become DATA.
fn rebase_entry(entry: &ManifestEntry, new_path: &str) -> Result<ManifestEntry, ForestError> {
    Ok(match entry {
        ManifestEntry::Ignore(_) => ManifestEntry::Ignore(new_path.to_string()),
        ManifestEntry::Timestamp(ts) => ManifestEntry::Timestamp(*ts),
        ManifestEntry::File(fe) => {
            let kind = match fe.kind {
                FileKind::Aux if !new_path.starts_with("files/") => FileKind::Data,
                kind => kind,
            };
            let mut moved = crate::entry::FileEntry::new_for_path(kind, new_path).map_err(
                |source| ForestError::Entry {
                    path: new_path.to_string(),
                    source,
                },
            )?;
            moved.size = fe.size;
            moved.checksums = fe.checksums.clone();
            ManifestEntry::File(moved)
        }
    })
}

/// Locates the top-level Manifest for `path` by walking up the directory tree.
///
/// Stops at the filesystem root, at a device boundary (unless
/// `allow_xdev`), at the first directory without a Manifest once one has
/// been found, or at a Manifest that IGNOREs the directory we came from.
pub fn find_top_level_manifest(path: &Path, allow_xdev: bool) -> Result<Option<PathBuf>, ForestError> {
    let start = path.canonicalize().map_err(|e| io_error(path, e))?;
    let start_device = std::fs::metadata(&start)
        .map_err(|e| io_error(&start, e))?
        .dev();

    let mut current = start.as_path();
    let mut came_from = String::new();
    let mut last_found: Option<PathBuf> = None;

    loop {
        let device = std::fs::metadata(current)
            .map_err(|e| io_error(current, e))?
            .dev();
        if !allow_xdev && device != start_device {
            break;
        }

        let candidate = manifest_filenames()
            .map(|name| current.join(name))
            .find(|p| p.is_file());
        match candidate {
            Some(manifest_path) => {
                if !came_from.is_empty() {
                    let manifest = ManifestFile::from_path(&manifest_path, false, None).map_err(
                        |source| ForestError::ManifestFile {
                            path: manifest_path.display().to_string(),
                            source,
                        },
                    )?;
                    if let Some(ManifestEntry::Ignore(_)) = manifest.find_path_entry(&came_from) {
                        break;
                    }
                }
                last_found = Some(manifest_path);
            }
            None if last_found.is_some() => break,
            None => {}
        }

        let Some(parent) = current.parent() else {
            break;
        };
        let name = current
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ForestError::NonUtf8Path(current.to_path_buf()))?;
        came_from = join_relpath(name, &came_from);
        current = parent;
    }

    Ok(last_found)
}
