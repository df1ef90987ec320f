//! Repository layout policies.
//!
//! A profile decides how new entries are classified, where new
//! sub-Manifests are created, what a fresh Manifest ignores, and whether a
//! Manifest should be stored compressed.

use crate::entry::{FileKind, ManifestEntry};
use crate::manifest_file::ManifestFile;
use crate::util::paths::{basename, dirname};

pub const PROFILE_NAMES: &[&str] = &["default", "ebuild", "old-ebuild"];

pub trait Profile {
    fn name(&self) -> &'static str;

    /// Entry type for a newly found file. `relpath` is relative to the tree
    /// root, `manifest_relpath` is the path of the Manifest that will own it.
    fn entry_type_for_path(&self, _relpath: &str, _manifest_relpath: &str) -> FileKind {
        FileKind::Data
    }

    /// Whether `relpath` (a directory without a Manifest) should get one.
    fn want_manifest_in_directory(&self, _relpath: &str, _dirs: &[String], _files: &[String]) -> bool {
        false
    }

    /// IGNORE entries (relative to the directory) for a new Manifest in `relpath`.
    fn ignore_paths_for_new_manifest(&self, _relpath: &str) -> Vec<String> {
        Vec::new()
    }

    /// Whether the Manifest at `relpath` should be compressed, given its
    /// uncompressed size. `None` leaves the current state alone.
    fn want_compressed_manifest(
        &self,
        _relpath: &str,
        manifest: &ManifestFile,
        uncompressed_size: u64,
        watermark: u64,
    ) -> Option<bool> {
        Some(size_wants_compression(manifest, uncompressed_size, watermark))
    }
}

fn size_wants_compression(manifest: &ManifestFile, uncompressed_size: u64, watermark: u64) -> bool {
    // DIST entries are read by tools that do not decompress.
    let has_dist = manifest
        .entries
        .iter()
        .any(|e| matches!(e, ManifestEntry::File(fe) if fe.kind == FileKind::Dist));
    !has_dist && uncompressed_size >= watermark
}

pub fn profile_by_name(name: &str) -> Option<Box<dyn Profile>> {
    match name {
        "default" => Some(Box::new(DefaultProfile)),
        "ebuild" => Some(Box::new(EbuildRepositoryProfile)),
        "old-ebuild" => Some(Box::new(OldEbuildRepositoryProfile)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProfile;

impl Profile for DefaultProfile {
    fn name(&self) -> &'static str {
        "default"
    }
}

const ROOT_IGNORES: &[&str] = &["distfiles", "local", "lost+found", "packages"];
const METADATA_IGNORES: &[&str] = &["timestamp", "timestamp.chk", "timestamp.commit", "timestamp.x"];
const TOP_LEVEL_NON_CATEGORIES: &[&str] = &["eclass", "licenses", "metadata", "profiles"];

fn depth(relpath: &str) -> usize {
    if relpath.is_empty() {
        0
    } else {
        relpath.split('/').count()
    }
}

fn is_package_directory(files: &[String]) -> bool {
    files
        .iter()
        .any(|f| f.ends_with(".ebuild") || f == "metadata.xml")
}

/// Layout of an ebuild repository: one Manifest per top-level directory,
/// category and package, plus one per `metadata/md5-cache` category.
#[derive(Debug, Clone, Copy, Default)]
pub struct EbuildRepositoryProfile;

impl EbuildRepositoryProfile {
    fn wants_manifest(relpath: &str, files: &[String]) -> bool {
        match depth(relpath) {
            1 => true,
            2 => {
                let top = dirname(relpath);
                if top == "metadata" {
                    relpath == "metadata/md5-cache"
                } else {
                    !TOP_LEVEL_NON_CATEGORIES.contains(&top) && is_package_directory(files)
                }
            }
            3 => dirname(relpath) == "metadata/md5-cache",
            _ => false,
        }
    }

    /// The repository's top-level Manifest stays uncompressed.
    fn wants_compressed(relpath: &str, manifest: &ManifestFile, size: u64, watermark: u64) -> Option<bool> {
        if dirname(relpath).is_empty() {
            return Some(false);
        }
        Some(size_wants_compression(manifest, size, watermark))
    }

    fn ignores(relpath: &str) -> Vec<String> {
        let list: &[&str] = match relpath {
            "" => ROOT_IGNORES,
            "metadata" => METADATA_IGNORES,
            _ => &[],
        };
        list.iter().map(|s| s.to_string()).collect()
    }
}

impl Profile for EbuildRepositoryProfile {
    fn name(&self) -> &'static str {
        "ebuild"
    }

    fn want_manifest_in_directory(&self, relpath: &str, _dirs: &[String], files: &[String]) -> bool {
        Self::wants_manifest(relpath, files)
    }

    fn ignore_paths_for_new_manifest(&self, relpath: &str) -> Vec<String> {
        Self::ignores(relpath)
    }

    fn want_compressed_manifest(
        &self,
        relpath: &str,
        manifest: &ManifestFile,
        uncompressed_size: u64,
        watermark: u64,
    ) -> Option<bool> {
        Self::wants_compressed(relpath, manifest, uncompressed_size, watermark)
    }
}

/// Like [`EbuildRepositoryProfile`], with package files classified using
/// the legacy EBUILD, AUX and MISC tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldEbuildRepositoryProfile;

impl Profile for OldEbuildRepositoryProfile {
    fn name(&self) -> &'static str {
        "old-ebuild"
    }

    fn entry_type_for_path(&self, relpath: &str, manifest_relpath: &str) -> FileKind {
        let manifest_dir = dirname(manifest_relpath);
        let in_package = depth(manifest_dir) == 2
            && !TOP_LEVEL_NON_CATEGORIES.contains(&dirname(manifest_dir));
        if !in_package {
            return FileKind::Data;
        }
        let Some(local) = crate::util::paths::relative_to(relpath, manifest_dir) else {
            return FileKind::Data;
        };
        if local.starts_with("files/") {
            FileKind::Aux
        } else if local.ends_with(".ebuild") {
            FileKind::Ebuild
        } else if matches!(basename(local), "metadata.xml" | "ChangeLog") && !local.contains('/') {
            FileKind::Misc
        } else {
            FileKind::Data
        }
    }

    fn want_manifest_in_directory(&self, relpath: &str, _dirs: &[String], files: &[String]) -> bool {
        EbuildRepositoryProfile::wants_manifest(relpath, files)
    }

    fn ignore_paths_for_new_manifest(&self, relpath: &str) -> Vec<String> {
        EbuildRepositoryProfile::ignores(relpath)
    }

    fn want_compressed_manifest(
        &self,
        relpath: &str,
        manifest: &ManifestFile,
        uncompressed_size: u64,
        watermark: u64,
    ) -> Option<bool> {
        EbuildRepositoryProfile::wants_compressed(relpath, manifest, uncompressed_size, watermark)
    }
}
