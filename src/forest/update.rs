//! Mutating the forest: entry updates, the bulk directory sync and saving.

use super::walk::DirectoryWalk;
use super::{ForestError, ManifestForest, io_error, merge_duplicate_entry, rebase_entry};
use crate::compression::{
    CompressionFormat, MANIFEST_FILENAME, compression_for_filename, is_manifest_filename,
    manifest_filenames, strip_compression_suffix,
};
use crate::entry::{EntryTag, FileEntry, FileKind, ManifestEntry};
use crate::manifest_file::{ManifestFile, write_manifest_bytes};
use crate::util::paths::{dirname, join_relpath, path_inside_dir, path_starts_with, relative_to};
use crate::verify::{self, PathKind};
use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::time::SystemTime;
use tracing::{debug, info};

/// Position of the entry for `local` (relative to the Manifest's
/// directory) in `manifest`. DIST and TIMESTAMP entries never match.
fn entry_position(manifest: &ManifestFile, local: &str) -> Option<usize> {
    manifest.entries.iter().position(|e| match e {
        ManifestEntry::Ignore(ignored) => ignored == local,
        ManifestEntry::File(fe) => fe.kind != FileKind::Dist && fe.path == local,
        ManifestEntry::Timestamp(_) => false,
    })
}

fn is_indexed(entry: &ManifestEntry) -> bool {
    !matches!(entry.tag(), EntryTag::Dist | EntryTag::Timestamp)
}

/// A Manifest governing the part of the tree being walked.
#[derive(Debug, Clone)]
struct Frame {
    directory: String,
    manifest: String,
}

impl ManifestForest {
    fn owner_entry_mut(&mut self, owner: &str, full: &str) -> Option<&mut ManifestEntry> {
        let local = relative_to(full, dirname(owner))?;
        let manifest = self.loaded_manifests.get_mut(owner)?;
        let idx = entry_position(manifest, local)?;
        manifest.entries.get_mut(idx)
    }

    fn remove_owned_entry(&mut self, owner: &str, full: &str) -> Option<ManifestEntry> {
        let local = relative_to(full, dirname(owner))?;
        let manifest = self.loaded_manifests.get_mut(owner)?;
        let idx = entry_position(manifest, local)?;
        let removed = manifest.entries.remove(idx);
        self.updated_manifests.insert(owner.to_string());
        Some(removed)
    }

    /// Like [`ManifestForest::get_file_entry_dict`], but flat and removing
    /// duplicates from the Manifests as it goes.
    ///
    /// Maps each full path to the Manifest owning its entry and the entry
    /// itself. The first (most specific) entry for a path is kept, with
    /// checksums from the duplicates merged into it; the duplicates are
    /// deleted and their Manifests marked dirty.
    pub fn get_deduplicated_file_entry_dict_for_update(
        &mut self,
        path: &str,
        verify_manifests: bool,
    ) -> Result<BTreeMap<String, (String, ManifestEntry)>, ForestError> {
        self.load_manifests_for_path(path, true, verify_manifests)?;

        let mut found: BTreeMap<String, (String, usize, ManifestEntry)> = BTreeMap::new();
        let mut duplicates: Vec<(String, usize)> = Vec::new();
        for (owner, manifest) in self.manifests_for_path(path, true) {
            let directory = dirname(owner);
            for (idx, entry) in manifest.entries.iter().enumerate() {
                let Some(entry_path) = entry.path().filter(|_| is_indexed(entry)) else {
                    continue;
                };
                let full = join_relpath(directory, entry_path);
                if !path_starts_with(&full, path) {
                    continue;
                }
                match found.entry(full) {
                    MapEntry::Vacant(slot) => {
                        slot.insert((owner.to_string(), idx, entry.clone()));
                    }
                    MapEntry::Occupied(mut slot) => {
                        let full = slot.key().clone();
                        merge_duplicate_entry(&full, &mut slot.get_mut().2, entry)?;
                        debug!("Dropping duplicate entry for {} from {}", full, owner);
                        duplicates.push((owner.to_string(), idx));
                    }
                }
            }
        }

        // merged checksums go back to the surviving entries before indices shift
        for (owner, idx, merged) in found.values() {
            if let Some(manifest) = self.loaded_manifests.get_mut(owner)
                && let Some(entry) = manifest.entries.get_mut(*idx)
                && *entry != *merged
            {
                *entry = merged.clone();
                self.updated_manifests.insert(owner.clone());
            }
        }
        for (owner, idx) in duplicates.into_iter().rev() {
            if let Some(manifest) = self.loaded_manifests.get_mut(&owner) {
                manifest.entries.remove(idx);
                self.updated_manifests.insert(owner);
            }
        }

        Ok(found
            .into_iter()
            .map(|(full, (owner, _, entry))| (full, (owner, entry)))
            .collect())
    }

    /// Brings the entry for a single file up to date.
    ///
    /// The first entry found (most specific Manifest first) is rehashed in
    /// place and keeps its type; further entries for the same path are
    /// deleted. If the file no longer exists, all its entries go. A file
    /// without an entry gets a new one of `new_entry_type` in the most
    /// specific Manifest covering it.
    pub fn update_entry_for_path(
        &mut self,
        path: &str,
        new_entry_type: FileKind,
        hashes: Option<&[String]>,
    ) -> Result<(), ForestError> {
        self.load_manifests_for_path(path, false, false)?;

        let abs = self.abs_path(path);
        let expected_dev = self.expected_device();
        let exists = verify::stat_path(&abs)?.is_some();
        let owners: Vec<String> = self
            .manifest_paths_for_path(path, false)
            .into_iter()
            .filter(|owner| owner != path)
            .collect();

        let mut had_entry = false;
        let mut ignored = false;
        for owner in &owners {
            let Some(local) = relative_to(path, dirname(owner)).map(str::to_string) else {
                continue;
            };
            let Some(manifest) = self.loaded_manifests.get_mut(owner) else {
                continue;
            };

            let mut changed = false;
            let mut idx = 0;
            while idx < manifest.entries.len() {
                match &mut manifest.entries[idx] {
                    ManifestEntry::Ignore(ignored_path) if path_starts_with(&local, ignored_path) => {
                        ignored = true;
                    }
                    ManifestEntry::File(fe) if fe.kind != FileKind::Dist && fe.path == local => {
                        if had_entry || !exists {
                            manifest.entries.remove(idx);
                            changed = true;
                            continue;
                        }
                        changed |= verify::update_file_entry(&abs, fe, hashes, expected_dev, None)?;
                        had_entry = true;
                    }
                    _ => {}
                }
                idx += 1;
            }

            if changed {
                debug!("Updated entries for {} in {}", path, owner);
                self.updated_manifests.insert(owner.clone());
            }
        }

        if had_entry || !exists {
            return Ok(());
        }
        if ignored {
            return Err(ForestError::IgnoredPath(path.to_string()));
        }

        let Some(owner) = owners.first() else {
            return Err(ForestError::InvalidManifestPath(abs));
        };
        let local = relative_to(path, dirname(owner)).unwrap_or(path);
        let mut fe = FileEntry::new_for_path(new_entry_type, local).map_err(|source| {
            ForestError::Entry {
                path: path.to_string(),
                source,
            }
        })?;
        let hashes = hashes.unwrap_or(&self.options.hashes);
        verify::update_file_entry(&abs, &mut fe, Some(hashes), expected_dev, None)?;

        if let Some(manifest) = self.loaded_manifests.get_mut(owner) {
            manifest.entries.push(ManifestEntry::File(fe));
            self.updated_manifests.insert(owner.clone());
            info!("Added entry for {} to {}", path, owner);
        }
        Ok(())
    }

    /// Loads Manifest files present under `path` that no loaded Manifest
    /// references yet. Returns their relative paths.
    ///
    /// Files with a Manifest name that do not parse as one are left alone.
    pub fn load_unregistered_manifests(&mut self, path: &str) -> Result<Vec<String>, ForestError> {
        self.load_manifests_for_path(path, true, false)?;
        if self.is_ignored(path) {
            return Ok(Vec::new());
        }

        let mut new_manifests = Vec::new();
        let mut walk = DirectoryWalk::new(&self.root_directory, path, self.expected_device());
        while let Some(dir) = walk.next_directory()? {
            for name in dir.files.iter().filter(|n| is_manifest_filename(n)) {
                // one Manifest per directory
                if self.loaded_manifests.keys().any(|m| dirname(m) == dir.relpath) {
                    break;
                }
                let full = join_relpath(&dir.relpath, name);
                if self.is_ignored(&full) {
                    continue;
                }

                let abs = self.abs_path(&full);
                match ManifestFile::from_path(&abs, false, None) {
                    Ok(manifest) => {
                        info!("Found unregistered Manifest {}", full);
                        self.loaded_manifests.insert(full.clone(), manifest);
                        new_manifests.push(full);
                    }
                    Err(e) if e.is_not_a_manifest() => {
                        debug!("Not a Manifest: {}: {}", full, e);
                    }
                    Err(source) => return Err(ForestError::ManifestFile { path: full, source }),
                }
            }

            let subdirs: Vec<String> = dir
                .dirs
                .iter()
                .filter(|name| !self.is_ignored(&join_relpath(&dir.relpath, name)))
                .cloned()
                .collect();
            walk.descend(&dir, &subdirs);
        }
        Ok(new_manifests)
    }

    /// Synchronizes all entries under the directory `path` with the filesystem.
    ///
    /// New files get entries in the Manifest governing their directory,
    /// changed files are rehashed, and entries for files that are gone are
    /// removed. Directories the profile wants a Manifest for get a new one,
    /// taking over the entries below it. With `last_mtime`, files not
    /// modified since then keep their checksums.
    pub fn update_entries_for_directory(
        &mut self,
        path: &str,
        hashes: &[String],
        last_mtime: Option<SystemTime>,
        verify_manifests: bool,
    ) -> Result<(), ForestError> {
        self.load_unregistered_manifests(path)?;
        let mut entry_dict = self.get_deduplicated_file_entry_dict_for_update(path, verify_manifests)?;
        if self.is_ignored(path) {
            debug!("Not updating ignored directory {}", path);
            return Ok(());
        }
        let expected_dev = self.expected_device();

        let mut stack: Vec<Frame> = self
            .manifests_for_path(path, false)
            .into_iter()
            .rev()
            .map(|(relpath, _)| Frame {
                directory: dirname(relpath).to_string(),
                manifest: relpath.to_string(),
            })
            .collect();
        let mut created: BTreeSet<String> = BTreeSet::new();

        let mut walk = DirectoryWalk::new(&self.root_directory, path, expected_dev);
        while let Some(dir) = walk.next_directory()? {
            while stack.len() > 1
                && stack
                    .last()
                    .is_some_and(|f| !path_starts_with(&dir.relpath, &f.directory))
            {
                stack.pop();
            }

            let governed_here = stack.last().is_some_and(|f| f.directory == dir.relpath);
            if !governed_here {
                let existing = manifest_filenames()
                    .map(|name| join_relpath(&dir.relpath, &name))
                    .find(|m| self.loaded_manifests.contains_key(m));
                if let Some(manifest) = existing {
                    stack.push(Frame {
                        directory: dir.relpath.clone(),
                        manifest,
                    });
                } else if self
                    .profile
                    .want_manifest_in_directory(&dir.relpath, &dir.dirs, &dir.files)
                {
                    if let Some(parent) = stack.last().cloned() {
                        let frame = self.create_manifest(&dir.relpath, &parent, &mut entry_dict)?;
                        created.insert(frame.manifest.clone());
                        stack.push(frame);
                    }
                }
            }

            for name in &dir.files {
                let full = join_relpath(&dir.relpath, name);
                if full == self.top_level_manifest_filename || created.contains(&full) {
                    continue;
                }

                match entry_dict.remove(&full) {
                    Some((owner, ManifestEntry::File(_))) => {
                        let abs = self.abs_path(&full);
                        if let Some(ManifestEntry::File(fe)) = self.owner_entry_mut(&owner, &full)
                            && verify::update_file_entry(&abs, fe, Some(hashes), expected_dev, last_mtime)?
                        {
                            debug!("Updated entry for {}", full);
                            self.updated_manifests.insert(owner);
                        }
                    }
                    Some(_) => {}
                    None => self.add_new_entry(&full, &stack, hashes)?,
                }
            }

            let mut subdirs = Vec::new();
            for name in &dir.dirs {
                let full = join_relpath(&dir.relpath, name);
                if let Some((_, ManifestEntry::Ignore(_))) = entry_dict.get(&full) {
                    entry_dict.retain(|p, _| !path_starts_with(p, &full));
                    continue;
                }
                subdirs.push(name.clone());
            }
            walk.descend(&dir, &subdirs);
        }

        // entries not met during the walk: hidden files, or files that are gone
        for (full, (owner, entry)) in entry_dict {
            if !matches!(entry, ManifestEntry::File(_)) {
                continue;
            }
            let abs = self.abs_path(&full);
            let present = verify::stat_path(&abs)?;
            if present.is_some_and(|p| p.kind == PathKind::RegularFile) {
                if let Some(ManifestEntry::File(fe)) = self.owner_entry_mut(&owner, &full)
                    && verify::update_file_entry(&abs, fe, Some(hashes), expected_dev, last_mtime)?
                {
                    self.updated_manifests.insert(owner);
                }
            } else if self.remove_owned_entry(&owner, &full).is_some() {
                info!("Removed entry for {} from {}", full, owner);
            }
        }
        Ok(())
    }

    /// Starts a Manifest in `directory`, registers it with the governing
    /// Manifest and moves the entries below `directory` into it.
    fn create_manifest(
        &mut self,
        directory: &str,
        parent: &Frame,
        entry_dict: &mut BTreeMap<String, (String, ManifestEntry)>,
    ) -> Result<Frame, ForestError> {
        let mpath = join_relpath(directory, MANIFEST_FILENAME);

        let mut manifest = ManifestFile::new();
        for ignore in self.profile.ignore_paths_for_new_manifest(directory) {
            manifest.entries.push(ManifestEntry::Ignore(ignore));
        }

        let moving: Vec<String> = entry_dict
            .iter()
            .filter(|(full, (owner, _))| {
                path_inside_dir(full, directory) && path_inside_dir(directory, dirname(owner))
            })
            .map(|(full, _)| full.clone())
            .collect();
        for full in moving {
            let Some((owner, _)) = entry_dict.get(&full).cloned() else {
                continue;
            };
            let Some(entry) = self.remove_owned_entry(&owner, &full) else {
                continue;
            };
            let local = relative_to(&full, directory).unwrap_or(&full);
            let moved = rebase_entry(&entry, local)?;
            debug!("Moving entry for {} from {} to {}", full, owner, mpath);
            manifest.entries.push(moved.clone());
            entry_dict.insert(full, (mpath.clone(), moved));
        }

        let local = relative_to(&mpath, &parent.directory).unwrap_or(&mpath);
        let reference = FileEntry::new_for_path(FileKind::Manifest, local).map_err(|source| {
            ForestError::Entry {
                path: mpath.clone(),
                source,
            }
        })?;
        if let Some(parent_manifest) = self.loaded_manifests.get_mut(&parent.manifest) {
            parent_manifest.entries.push(ManifestEntry::File(reference));
            self.updated_manifests.insert(parent.manifest.clone());
        }

        info!("Creating new Manifest {}", mpath);
        self.loaded_manifests.insert(mpath.clone(), manifest);
        self.updated_manifests.insert(mpath.clone());
        Ok(Frame {
            directory: directory.to_string(),
            manifest: mpath,
        })
    }

    /// Adds an entry for a file found with none recorded.
    fn add_new_entry(&mut self, full: &str, stack: &[Frame], hashes: &[String]) -> Result<(), ForestError> {
        let is_manifest = self.loaded_manifests.contains_key(full);
        let directory = dirname(full);
        // a sub-Manifest is referenced from above its own directory
        let frame = stack.iter().rev().find(|f| {
            if is_manifest {
                path_inside_dir(directory, &f.directory)
            } else {
                path_starts_with(directory, &f.directory)
            }
        });
        let Some(frame) = frame.cloned() else {
            return Err(ForestError::InvalidManifestPath(self.abs_path(full)));
        };

        let kind = if is_manifest {
            FileKind::Manifest
        } else {
            self.profile.entry_type_for_path(full, &frame.manifest)
        };
        let local = relative_to(full, &frame.directory).unwrap_or(full);
        let mut fe = FileEntry::new_for_path(kind, local).map_err(|source| ForestError::Entry {
            path: full.to_string(),
            source,
        })?;
        let abs = self.abs_path(full);
        verify::update_file_entry(&abs, &mut fe, Some(hashes), self.expected_device(), None)?;

        if let Some(manifest) = self.loaded_manifests.get_mut(&frame.manifest) {
            manifest.entries.push(ManifestEntry::File(fe));
            self.updated_manifests.insert(frame.manifest.clone());
            info!("Added {} entry for {} to {}", kind, full, frame.manifest);
        }
        Ok(())
    }

    /// The Manifest holding the MANIFEST entry for `mpath`, if any.
    fn referencing_manifest(&self, mpath: &str) -> Option<String> {
        self.manifests_for_path(mpath, false)
            .into_iter()
            .filter(|(relpath, _)| *relpath != mpath)
            .find(|(relpath, manifest)| {
                relative_to(mpath, dirname(relpath)).is_some_and(|local| {
                    manifest.entries.iter().any(|e| {
                        matches!(e, ManifestEntry::File(fe)
                            if fe.kind == FileKind::Manifest && fe.path == local)
                    })
                })
            })
            .map(|(relpath, _)| relpath.to_string())
    }

    /// Writes out modified Manifests, deepest first.
    ///
    /// Before a Manifest is written, its MANIFEST entries for sub-Manifests
    /// written in this call are rehashed (and renamed, if compression
    /// changed the sub-Manifest's name), which in turn makes it due for
    /// writing. With `force`, every loaded Manifest is written. `hashes`
    /// overrides the hash set used for MANIFEST entries. The remaining
    /// arguments override the forest's options. Returns the paths of the
    /// Manifests written, after any renames.
    pub fn save_manifests(
        &mut self,
        hashes: Option<&[String]>,
        force: bool,
        sort: Option<bool>,
        compress_watermark: Option<u64>,
        compress_format: Option<CompressionFormat>,
    ) -> Result<BTreeSet<String>, ForestError> {
        let sort = sort.unwrap_or(self.options.sort);
        let compress_watermark = compress_watermark.or(self.options.compress_watermark);
        let compress_format = compress_format.unwrap_or(self.options.compress_format);
        let expected_dev = self.expected_device();

        let mut pending: BTreeSet<String> = if force {
            self.loaded_manifests.keys().cloned().collect()
        } else {
            self.updated_manifests.clone()
        };
        let mut written: BTreeSet<String> = BTreeSet::new();
        let mut renamed: BTreeMap<String, String> = BTreeMap::new();

        while let Some(mpath) = pending
            .iter()
            .max_by_key(|p| {
                let directory = dirname(p);
                let depth = if directory.is_empty() {
                    0
                } else {
                    directory.split('/').count()
                };
                (depth, p.len())
            })
            .cloned()
        {
            pending.remove(&mpath);

            let directory = dirname(&mpath).to_string();
            let default_hashes = self.options.hashes.clone();
            let root = self.root_directory.clone();
            let mut changed = false;
            if let Some(manifest) = self.loaded_manifests.get_mut(&mpath) {
                for entry in manifest.entries.iter_mut() {
                    let ManifestEntry::File(fe) = entry else {
                        continue;
                    };
                    if fe.kind != FileKind::Manifest {
                        continue;
                    }
                    let mut full = join_relpath(&directory, &fe.path);
                    if let Some(new_full) = renamed.get(&full) {
                        full = new_full.clone();
                        fe.path = relative_to(&full, &directory).unwrap_or(&full).to_string();
                        changed = true;
                    }
                    if !written.contains(&full) {
                        continue;
                    }
                    let entry_hashes: Vec<String> = match hashes {
                        Some(h) => h.to_vec(),
                        None if fe.checksums.is_empty() => default_hashes.clone(),
                        None => fe.hash_names(),
                    };
                    let abs = root.join(&full);
                    changed |= verify::update_file_entry(
                        &abs,
                        fe,
                        Some(&entry_hashes[..]),
                        expected_dev,
                        None,
                    )?;
                }
            }

            if !(force || changed || self.updated_manifests.contains(&mpath)) {
                continue;
            }

            let parent = self.referencing_manifest(&mpath);
            let new_path = self.write_manifest(&mpath, sort, compress_watermark, compress_format)?;
            self.updated_manifests.remove(&mpath);
            written.insert(new_path.clone());
            if new_path != mpath {
                renamed.insert(mpath, new_path);
            }
            if let Some(parent) = parent {
                pending.insert(parent);
            }
        }

        assert!(
            self.updated_manifests.is_empty(),
            "Manifests left unsaved: {:?}",
            self.updated_manifests
        );
        Ok(written)
    }

    /// Writes one Manifest, returning its (possibly new) relative path.
    ///
    /// With a watermark, the Manifest is renamed to gain or lose the
    /// compression suffix as the profile decides. The top-level Manifest is
    /// clear-signed if signing is enabled, or if it was signed when loaded
    /// and signing was left unspecified.
    fn write_manifest(
        &mut self,
        mpath: &str,
        sort: bool,
        compress_watermark: Option<u64>,
        compress_format: CompressionFormat,
    ) -> Result<String, ForestError> {
        let Some(manifest) = self.loaded_manifests.get(mpath) else {
            return Ok(mpath.to_string());
        };
        let is_top = mpath == self.top_level_manifest_filename;
        let text = manifest.dump(sort);

        let mut target = mpath.to_string();
        if let Some(watermark) = compress_watermark {
            let want = self.profile.want_compressed_manifest(
                mpath,
                manifest,
                text.len() as u64,
                watermark,
            );
            match (want, compression_for_filename(mpath)) {
                (Some(true), None) => target = format!("{mpath}.{}", compress_format.suffix()),
                (Some(false), Some(_)) => target = strip_compression_suffix(mpath).to_string(),
                _ => {}
            }
        }

        let sign = is_top
            && self
                .options
                .sign_openpgp
                .unwrap_or(manifest.openpgp_signed);
        let data = if sign {
            let openpgp = self
                .openpgp
                .as_deref()
                .ok_or(ForestError::NoOpenPgpEnvironment)?;
            manifest
                .dump_signed(sort, openpgp, self.options.openpgp_keyid.as_deref())
                .map_err(|source| ForestError::ManifestFile {
                    path: mpath.to_string(),
                    source,
                })?
        } else {
            text.into_bytes()
        };

        let abs = self.abs_path(&target);
        write_manifest_bytes(&abs, &data).map_err(|source| ForestError::ManifestFile {
            path: target.clone(),
            source,
        })?;
        info!("Wrote {}", target);

        if target != mpath {
            let old = self.abs_path(mpath);
            match std::fs::remove_file(&old) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&old, e)),
            }
            if let Some(manifest) = self.loaded_manifests.remove(mpath) {
                self.loaded_manifests.insert(target.clone(), manifest);
            }
            if is_top {
                self.top_level_manifest_filename = target.clone();
            }
            info!("Renamed {} to {}", mpath, target);
        }
        Ok(target)
    }
}
