use super::*;
use crate::hashing::hash_bytes;
use crate::openpgp::SignatureInfo;
use crate::profile::DefaultProfile;
use std::fs;
use tempfile::TempDir;

fn write(root: &Path, relpath: &str, content: &str) {
    let path = root.join(relpath);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// A Manifest line for `path` recording `content` with its MD5 checksum.
fn entry_line(tag: &str, path: &str, content: &[u8]) -> String {
    let values = hash_bytes(content, &["MD5"]).unwrap();
    format!("{tag} {path} {} MD5 {}\n", values.size, values.checksums["MD5"])
}

/// Writes a sub-Manifest and returns the MANIFEST line referencing it from
/// the directory `from`.
fn write_sub_manifest(root: &Path, relpath: &str, content: &str, from: &str) -> String {
    write(root, relpath, content);
    let local = relative_to(relpath, from).unwrap();
    entry_line("MANIFEST", local, content.as_bytes())
}

fn md5_options() -> ForestOptions {
    ForestOptions {
        hashes: vec!["MD5".to_string()],
        ..Default::default()
    }
}

fn open_forest(root: &Path) -> ManifestForest {
    open_forest_with(root, md5_options())
}

fn open_forest_with(root: &Path, options: ForestOptions) -> ManifestForest {
    ManifestForest::new(&root.join("Manifest"), options, Box::new(DefaultProfile), None).unwrap()
}

fn md5() -> Vec<String> {
    vec!["MD5".to_string()]
}

/// Verifies the whole tree with a freshly loaded forest.
fn tree_verifies(root: &Path) -> bool {
    tree_verifies_from(&root.join("Manifest"))
}

fn tree_verifies_from(top_level_manifest: &Path) -> bool {
    let mut forest =
        ManifestForest::new(top_level_manifest, md5_options(), Box::new(DefaultProfile), None)
            .unwrap();
    forest
        .assert_directory_verifies("", raise_on_mismatch, None)
        .unwrap()
}

struct FakeSigner;

impl OpenPgpEnvironment for FakeSigner {
    fn verify_clearsigned(&self, _message: &[u8]) -> Result<SignatureInfo, OpenPgpError> {
        Ok(SignatureInfo {
            fingerprint: "AAAA".to_string(),
            primary_key_fingerprint: "AAAA".to_string(),
            timestamp: None,
            expire_timestamp: None,
        })
    }

    fn clear_sign(&self, data: &[u8], _keyid: Option<&str>) -> Result<Vec<u8>, OpenPgpError> {
        let mut out = b"-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n".to_vec();
        out.extend_from_slice(data);
        out.extend_from_slice(
            b"-----BEGIN PGP SIGNATURE-----\n\nAAAA\n-----END PGP SIGNATURE-----\n",
        );
        Ok(out)
    }
}

mod load;
mod save;
