use super::*;
use crate::profile::EbuildRepositoryProfile;

fn create_tree(root: &Path) {
    write(root, "a", "alpha");
    write(root, "sub/b", "beta");
    let reference = write_sub_manifest(root, "sub/Manifest", &entry_line("DATA", "b", b"beta"), "");
    write(root, "Manifest", &format!("{reference}{}", entry_line("DATA", "a", b"alpha")));
}

fn update_and_save(forest: &mut ManifestForest) {
    forest
        .update_entries_for_directory("", &md5(), None, false)
        .unwrap();
    forest.save_manifests(None, false, None, None, None).unwrap();
}

#[test]
fn test_save_updates_parent_manifest_entries() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    write(root, "sub/b", "changed");
    write(root, "sub/new", "new");
    assert!(!tree_verifies_lenient(root));

    let mut forest = open_forest(root);
    update_and_save(&mut forest);
    assert!(forest.updated_manifests().is_empty());
    assert!(tree_verifies(root));

    let top = fs::read_to_string(root.join("Manifest")).unwrap();
    let sub = fs::read(root.join("sub/Manifest")).unwrap();
    assert!(top.contains(&entry_line("MANIFEST", "sub/Manifest", &sub)));
}

#[test]
fn test_save_without_changes_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    // MANIFEST before DATA: a sorted rewrite would change the order
    let before = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(before.starts_with("MANIFEST "));

    let mut forest = open_forest(root);
    update_and_save(&mut forest);
    assert_eq!(fs::read_to_string(root.join("Manifest")).unwrap(), before);

    forest.save_manifests(None, true, Some(true), None, None).unwrap();
    let after = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(after.starts_with("DATA a "));
    assert!(tree_verifies(root));
}

#[test]
fn test_compression_renames_manifests() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    write(root, "sub/c", "gamma");

    let options = ForestOptions {
        compress_watermark: Some(1),
        ..md5_options()
    };
    let mut forest = open_forest_with(root, options);
    update_and_save(&mut forest);

    assert!(!root.join("sub/Manifest").exists());
    assert!(root.join("sub/Manifest.gz").exists());
    assert!(forest.loaded_manifests().contains_key("sub/Manifest.gz"));
    assert!(!root.join("Manifest").exists());
    assert!(root.join("Manifest.gz").exists());
    assert_eq!(forest.top_level_manifest_filename(), "Manifest.gz");
    assert!(forest.top_level_manifest().is_some());

    let top = ManifestFile::from_path(&root.join("Manifest.gz"), false, None).unwrap();
    assert!(top.find_path_entry("sub/Manifest.gz").is_some());
    assert!(top.find_path_entry("sub/Manifest").is_none());
    assert_eq!(
        find_top_level_manifest(root, false).unwrap(),
        Some(root.canonicalize().unwrap().join("Manifest.gz"))
    );
    assert!(tree_verifies_from(&root.join("Manifest.gz")));
}

#[test]
fn test_ebuild_profile_keeps_top_level_manifest_uncompressed() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    write(root, "sub/c", "gamma");

    let options = ForestOptions {
        compress_watermark: Some(1),
        ..md5_options()
    };
    let mut forest = ManifestForest::new(
        &root.join("Manifest"),
        options,
        Box::new(EbuildRepositoryProfile),
        None,
    )
    .unwrap();
    update_and_save(&mut forest);

    assert!(root.join("sub/Manifest.gz").exists());
    assert!(root.join("Manifest").exists());
    assert!(!root.join("Manifest.gz").exists());
    assert_eq!(forest.top_level_manifest_filename(), "Manifest");

    let top = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(top.contains("MANIFEST sub/Manifest.gz "));
    assert!(!top.contains("MANIFEST sub/Manifest "));
    assert!(tree_verifies(root));
}

#[test]
fn test_save_reports_written_manifests() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    write(root, "sub/b", "changed");

    let mut forest = open_forest(root);
    forest
        .update_entries_for_directory("", &md5(), None, false)
        .unwrap();
    // only the sub-Manifest changed, the top one is rewritten for its reference
    assert_eq!(
        forest.updated_manifests().iter().collect::<Vec<_>>(),
        vec!["sub/Manifest"]
    );
    let written = forest.save_manifests(None, false, None, None, None).unwrap();
    assert_eq!(
        written.into_iter().collect::<Vec<_>>(),
        vec!["Manifest", "sub/Manifest"]
    );

    let written = forest.save_manifests(None, false, None, None, None).unwrap();
    assert!(written.is_empty());
}

#[test]
fn test_decompression_renames_sub_manifest() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    write(root, "sub/b", "beta");
    let text = entry_line("DATA", "b", b"beta");
    let data = crate::compression::compress(CompressionFormat::Gz, text.as_bytes()).unwrap();
    fs::write(root.join("sub/Manifest.gz"), &data).unwrap();
    write(root, "Manifest", &entry_line("MANIFEST", "sub/Manifest.gz", &data));
    assert!(tree_verifies(root));

    let options = ForestOptions {
        compress_watermark: Some(1 << 20),
        ..md5_options()
    };
    let mut forest = open_forest_with(root, options);
    forest.load_manifests_for_path("", true, true).unwrap();
    forest.save_manifests(None, true, None, None, None).unwrap();

    assert!(!root.join("sub/Manifest.gz").exists());
    assert_eq!(fs::read_to_string(root.join("sub/Manifest")).unwrap(), text);
    assert!(tree_verifies(root));
}

#[test]
fn test_save_signs_only_top_level_manifest() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    write(root, "sub/c", "gamma");

    let options = ForestOptions {
        sign_openpgp: Some(true),
        ..md5_options()
    };
    let mut forest = ManifestForest::new(
        &root.join("Manifest"),
        options,
        Box::new(DefaultProfile),
        Some(Box::new(FakeSigner)),
    )
    .unwrap();
    update_and_save(&mut forest);

    let top = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(top.starts_with("-----BEGIN PGP SIGNED MESSAGE-----\n"));
    let sub = fs::read_to_string(root.join("sub/Manifest")).unwrap();
    assert!(!sub.contains("PGP"));

    let reloaded = ManifestFile::from_path(&root.join("Manifest"), true, Some(&FakeSigner)).unwrap();
    assert!(reloaded.openpgp_signed);
    assert!(tree_verifies(root));
}

/// Rewrites the top-level Manifest of `create_tree` clear-signed.
fn sign_top_level_manifest(root: &Path) {
    let text = fs::read(root.join("Manifest")).unwrap();
    let signed = FakeSigner.clear_sign(&text, None).unwrap();
    fs::write(root.join("Manifest"), signed).unwrap();
}

fn signing_forest(root: &Path, sign_openpgp: Option<bool>) -> ManifestForest {
    let options = ForestOptions {
        verify_openpgp: true,
        sign_openpgp,
        ..md5_options()
    };
    ManifestForest::new(
        &root.join("Manifest"),
        options,
        Box::new(DefaultProfile),
        Some(Box::new(FakeSigner)),
    )
    .unwrap()
}

#[test]
fn test_update_keeps_signed_manifest_signed() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    sign_top_level_manifest(root);
    write(root, "new", "x");

    let mut forest = signing_forest(root, None);
    assert!(forest.top_level_manifest().unwrap().openpgp_signed);
    update_and_save(&mut forest);

    let top = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(top.starts_with("-----BEGIN PGP SIGNED MESSAGE-----\n"));
    assert!(top.contains("DATA new 1 MD5 "));
    let reloaded = ManifestFile::from_path(&root.join("Manifest"), true, Some(&FakeSigner)).unwrap();
    assert!(reloaded.openpgp_signed);
    assert!(tree_verifies(root));
}

#[test]
fn test_update_can_drop_signature() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    sign_top_level_manifest(root);

    let mut forest = signing_forest(root, Some(false));
    forest.save_manifests(None, true, None, None, None).unwrap();

    let top = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(!top.contains("PGP"));
    assert!(tree_verifies(root));
}

#[test]
fn test_unsigned_manifest_stays_unsigned() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);
    write(root, "new", "x");

    let mut forest = signing_forest(root, None);
    update_and_save(&mut forest);
    assert!(!fs::read_to_string(root.join("Manifest")).unwrap().contains("PGP"));
}

#[test]
fn test_signing_without_environment() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    create_tree(root);

    let options = ForestOptions {
        sign_openpgp: Some(true),
        ..md5_options()
    };
    let mut forest = open_forest_with(root, options);
    match forest.save_manifests(None, true, None, None, None) {
        Err(ForestError::NoOpenPgpEnvironment) => {}
        other => panic!("Expected NoOpenPgpEnvironment, got {:?}", other),
    }
}

#[test]
fn test_create_new_tree() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    write(root, "dev-libs/foo/foo-1.ebuild", "EAPI=8\n");
    write(root, "distfiles/foo-1.tar.gz", "binary");
    write(root, "README", "hi");

    let options = ForestOptions {
        allow_create: true,
        ..md5_options()
    };
    let mut forest = ManifestForest::new(
        &root.join("Manifest"),
        options,
        Box::new(EbuildRepositoryProfile),
        None,
    )
    .unwrap();
    forest.set_timestamp(Utc::now());
    update_and_save(&mut forest);

    let top = fs::read_to_string(root.join("Manifest")).unwrap();
    assert!(top.contains("IGNORE distfiles\n"));
    assert!(top.contains("MANIFEST dev-libs/Manifest "));
    assert!(top.contains("TIMESTAMP "));
    assert!(root.join("dev-libs/foo/Manifest").exists());
    assert!(tree_verifies(root));
}

/// Like `tree_verifies`, but reporting mismatches instead of failing on them.
fn tree_verifies_lenient(root: &Path) -> bool {
    let mut forest = open_forest(root);
    forest
        .assert_directory_verifies("", |_| Ok(false), None)
        .unwrap()
}
