//! Depth-first directory walk over the live tree.
//!
//! The caller pulls one directory at a time and decides which of its
//! subdirectories to descend into. Symlinks are followed; each directory's
//! `(dev, ino)` is checked against the chain of directories above it to
//! catch symlink loops, and against the tree's device to catch mount points.

use super::ForestError;
use crate::util::paths::join_relpath;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

type DirIdentity = (u64, u64);

#[derive(Debug, Clone)]
pub(crate) struct WalkedDirectory {
    /// Relative to the tree root.
    pub relpath: String,
    /// Sorted names of subdirectories (hidden ones omitted).
    pub dirs: Vec<String>,
    /// Sorted names of everything else, including special files and broken symlinks.
    pub files: Vec<String>,
    ancestors: Vec<DirIdentity>,
}

pub(crate) struct DirectoryWalk {
    root: PathBuf,
    expected_device: Option<u64>,
    pending: Vec<(String, Vec<DirIdentity>)>,
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

impl DirectoryWalk {
    pub fn new(root: &Path, start: &str, expected_device: Option<u64>) -> Self {
        DirectoryWalk {
            root: root.to_path_buf(),
            expected_device,
            pending: vec![(start.to_string(), Vec::new())],
        }
    }

    /// Returns the next directory, or `None` once the walk is exhausted.
    ///
    /// A start directory that does not exist yields nothing.
    pub fn next_directory(&mut self) -> Result<Option<WalkedDirectory>, ForestError> {
        while let Some((relpath, mut ancestors)) = self.pending.pop() {
            let abs = if relpath.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&relpath)
            };

            let metadata = match fs::metadata(&abs) {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&abs, e)),
            };

            if let Some(dev) = self.expected_device
                && metadata.dev() != dev
            {
                return Err(ForestError::CrossDevice(abs));
            }

            let identity = (metadata.dev(), metadata.ino());
            if ancestors.contains(&identity) {
                return Err(ForestError::SymlinkLoop(abs));
            }
            ancestors.push(identity);

            let (dirs, files) = list_children(&abs)?;
            return Ok(Some(WalkedDirectory {
                relpath,
                dirs,
                files,
                ancestors,
            }));
        }
        Ok(None)
    }

    /// Schedules `subdirs` (names inside `dir`) to be walked next, in order.
    pub fn descend(&mut self, dir: &WalkedDirectory, subdirs: &[String]) {
        for name in subdirs.iter().rev() {
            self.pending
                .push((join_relpath(&dir.relpath, name), dir.ancestors.clone()));
        }
    }
}

fn list_children(abs: &Path) -> Result<(Vec<String>, Vec<String>), ForestError> {
    let read_dir = fs::read_dir(abs).map_err(|e| io_error(abs, e))?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| io_error(abs, e))?;
        let path = entry.path();
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| ForestError::NonUtf8Path(path.clone()))?;
        if name.starts_with('.') {
            continue;
        }

        let is_dir = match fs::metadata(&path) {
            Ok(m) => m.is_dir(),
            // broken symlink
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(io_error(&path, e)),
        };
        if is_dir {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }

    dirs.sort();
    files.sort();
    Ok((dirs, files))
}
