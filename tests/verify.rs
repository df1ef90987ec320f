mod common;

use common::{create, manitree_cmd, populate};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn created_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    create(temp.path(), &["--hashes", "SHA256 MD5"]);
    temp
}

#[test]
fn verify_success_when_clean() {
    let temp = created_tree();

    manitree_cmd(temp.path())
        .arg("verify")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn verify_fails_on_stray_file() {
    let temp = created_tree();
    fs::write(temp.path().join("sub/new.txt"), "new").unwrap();

    manitree_cmd(temp.path())
        .arg("verify")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("sub/new.txt"))
        .stderr(predicate::str::contains("Verification failed"));
}

#[test]
fn verify_fails_on_modified_file() {
    let temp = created_tree();
    fs::write(temp.path().join("a.txt"), "ALPHA").unwrap();

    manitree_cmd(temp.path())
        .arg("verify")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("a.txt"))
        .stderr(predicate::str::contains("SHA256"));
}

#[test]
fn verify_keep_going_reports_everything() {
    let temp = created_tree();
    fs::remove_file(temp.path().join("a.txt")).unwrap();
    fs::write(temp.path().join("sub/deep/c.txt"), "changed").unwrap();

    manitree_cmd(temp.path())
        .arg("verify")
        .arg("--keep-going")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("a.txt"))
        .stderr(predicate::str::contains("sub/deep/c.txt"));
}

#[test]
fn verify_stops_at_first_difference() {
    let temp = created_tree();
    fs::remove_file(temp.path().join("a.txt")).unwrap();
    fs::write(temp.path().join("sub/deep/c.txt"), "changed").unwrap();

    manitree_cmd(temp.path())
        .arg("verify")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("a.txt"))
        .stderr(predicate::str::contains("sub/deep/c.txt").not());
}

#[test]
fn verify_single_path() {
    let temp = created_tree();
    fs::write(temp.path().join("a.txt"), "ALPHA").unwrap();

    manitree_cmd(temp.path())
        .arg("verify")
        .arg("sub")
        .arg("sub/deep/c.txt")
        .assert()
        .success();

    manitree_cmd(temp.path())
        .arg("verify")
        .arg("a.txt")
        .assert()
        .code(1);
}

#[test]
fn verify_deleted_file_path() {
    let temp = created_tree();
    fs::remove_file(temp.path().join("sub/b.txt")).unwrap();

    manitree_cmd(temp.path())
        .arg("verify")
        .arg("sub/b.txt")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("sub/b.txt"));
}

#[test]
fn verify_from_inside_the_tree() {
    let temp = created_tree();

    manitree_cmd(&temp.path().join("sub/deep"))
        .arg("verify")
        .assert()
        .success();
}

#[test]
fn verify_without_manifest_is_an_error() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    manitree_cmd(temp.path())
        .arg("verify")
        .assert()
        .code(255)
        .stderr(predicate::str::contains("No top-level Manifest"));
}

#[test]
fn verify_require_signed_manifest_rejects_unsigned() {
    let temp = created_tree();

    manitree_cmd(temp.path())
        .arg("verify")
        .arg("--require-signed-manifest")
        .assert()
        .code(255)
        .stderr(predicate::str::contains("not OpenPGP-signed"));
}

#[test]
fn verify_skips_ignored_paths() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    populate(root);
    fs::write(root.join("Manifest"), "IGNORE scratch\n").unwrap();
    manitree_cmd(root).arg("update").assert().success();

    fs::create_dir(root.join("scratch")).unwrap();
    fs::write(root.join("scratch/tmp.txt"), "whatever").unwrap();

    manitree_cmd(root).arg("verify").assert().success();
}
