//! Helpers for the relative paths used throughout a Manifest tree.
//!
//! Paths inside Manifests, and the keys of the loaded Manifest forest, are
//! `/`-separated strings relative to the tree root. The empty string denotes
//! the root itself. Keeping them as strings (rather than `PathBuf`) makes
//! prefix relationships cheap and platform independent.

use std::path::{Component, Path};

/// Returns true if `path` equals `prefix` or lies below it.
///
/// Matching is component-wise: `foo/barbaz` does not start with `foo/bar`.
/// An empty prefix matches every path.
pub(crate) fn path_starts_with(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path == prefix {
        return true;
    }
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'/'
}

/// Returns true if `path` lies strictly inside `directory`.
///
/// Every path (including the empty one) lies inside the root directory `""`.
pub(crate) fn path_inside_dir(path: &str, directory: &str) -> bool {
    if directory.is_empty() {
        return true;
    }
    path.len() > directory.len()
        && path.starts_with(directory)
        && path.as_bytes()[directory.len()] == b'/'
}

pub(crate) fn join_relpath(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        directory.to_string()
    } else {
        format!("{directory}/{name}")
    }
}

/// Directory part of a relative path, `""` for top-level names.
pub(crate) fn dirname(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

pub(crate) fn basename(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// Expresses `path` relative to `directory`, if it is the directory itself or lies below it.
pub(crate) fn relative_to<'a>(path: &'a str, directory: &str) -> Option<&'a str> {
    if directory.is_empty() {
        return Some(path);
    }
    if path == directory {
        return Some("");
    }
    path.strip_prefix(directory)?.strip_prefix('/')
}

/// Converts a relative filesystem path into the `/`-separated form.
///
/// Returns `None` for absolute paths, paths escaping upwards, and names that
/// are not valid UTF-8.
pub(crate) fn relpath_from_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
