use assert_cmd::{Command, cargo::cargo_bin_cmd};
use std::fs;
use std::path::Path;

pub fn manitree_cmd(cwd: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("manitree");
    cmd.arg("-C").arg(cwd);
    cmd
}

/// Lays out a small tree with a nested directory.
pub fn populate(root: &Path) {
    fs::write(root.join("a.txt"), "alpha").unwrap();
    fs::create_dir_all(root.join("sub/deep")).unwrap();
    fs::write(root.join("sub/b.txt"), "bravo").unwrap();
    fs::write(root.join("sub/deep/c.txt"), "charlie").unwrap();
}

// Each integration test file is compiled as its own crate, and not all of
// them create their trees through the binary.
#[allow(dead_code)]
pub fn create(root: &Path, args: &[&str]) {
    manitree_cmd(root)
        .arg("create")
        .args(args)
        .assert()
        .success();
}

#[allow(dead_code)]
pub fn read_manifest(path: &Path) -> String {
    fs::read_to_string(path).expect("Manifest should be readable")
}
