mod common;

use assert_cmd::cargo::cargo_bin_cmd;
use common::{manitree_cmd, populate};
use predicates::prelude::*;
use tempfile::TempDir;

fn temp_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    temp
}

#[test]
fn create_without_flags_respects_rust_log_info() {
    let temp = temp_tree();

    manitree_cmd(temp.path())
        .env("RUST_LOG", "info")
        .arg("create")
        .assert()
        .success()
        .stderr(predicate::str::contains("Created"));
}

#[test]
fn create_without_flags_respects_rust_log_warn() {
    let temp = temp_tree();

    manitree_cmd(temp.path())
        .env("RUST_LOG", "warn")
        .arg("create")
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
}

#[test]
fn verbose_overrides_rust_log_warn() {
    let temp = temp_tree();

    manitree_cmd(temp.path())
        .env("RUST_LOG", "warn")
        .arg("-v")
        .arg("create")
        .assert()
        .success()
        .stderr(predicate::str::contains("Created"));
}

#[test]
fn verbose_debug_shows_manifest_loading() {
    let temp = temp_tree();
    common::create(temp.path(), &[]);

    manitree_cmd(temp.path())
        .env("RUST_LOG", "warn")
        .arg("-vv")
        .arg("verify")
        .assert()
        .success()
        .stderr(predicate::str::contains("Loaded top-level Manifest"));
}

#[test]
fn log_level_overrides_rust_log_warn() {
    let temp = temp_tree();

    manitree_cmd(temp.path())
        .env("RUST_LOG", "warn")
        .arg("--log-level")
        .arg("info")
        .arg("create")
        .assert()
        .success()
        .stderr(predicate::str::contains("Created"));
}

#[test]
fn log_level_conflicts_with_verbose() {
    cargo_bin_cmd!("manitree")
        .arg("--log-level")
        .arg("info")
        .arg("-v")
        .arg("verify")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--log-level <LEVEL>"))
        .stderr(predicate::str::contains("--verbose"));
}

#[test]
fn help_mentions_rust_log_precedence_for_logging_flags() {
    cargo_bin_cmd!("manitree")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("-v, --verbose"))
        .stdout(predicate::str::contains("--log-level <LEVEL>"))
        .stdout(predicate::str::contains("Takes precedence over RUST_LOG"));
}

#[test]
fn errors_have_plain_prefix_when_not_tty() {
    let temp = temp_tree();

    // captured output is never a tty
    let output = manitree_cmd(temp.path())
        .arg("verify")
        .assert()
        .code(255)
        .get_output()
        .clone();

    let stderr = String::from_utf8_lossy(&output.stderr);
    for ch in stderr.chars() {
        assert!(
            ch.is_ascii(),
            "stderr unexpectedly contains non-ASCII character: {ch:?}"
        );
    }
    assert!(stderr.contains("ERROR:"), "stderr should include the error prefix");
}
