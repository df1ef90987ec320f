use super::*;

#[test]
fn test_missing_top_level_manifest() {
    let temp = TempDir::new().unwrap();
    let result = ManifestForest::new(
        &temp.path().join("Manifest"),
        md5_options(),
        Box::new(DefaultProfile),
        None,
    );
    match result {
        Err(ForestError::ManifestFile {
            source: ManifestFileError::Io { source, .. },
            ..
        }) => assert_eq!(source.kind(), ErrorKind::NotFound),
        Err(e) => panic!("Expected ManifestFile IO error, got {:?}", e),
        Ok(_) => panic!("Expected an error"),
    }
}

#[test]
fn test_allow_create_starts_empty_and_dirty() {
    let temp = TempDir::new().unwrap();
    let options = ForestOptions {
        allow_create: true,
        ..md5_options()
    };
    let forest = open_forest_with(temp.path(), options);
    assert!(forest.top_level_manifest().unwrap().entries.is_empty());
    assert!(forest.updated_manifests().contains("Manifest"));
}

#[test]
fn test_sub_manifests_load_lazily() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let sub = entry_line("DATA", "x", b"hello");
    write(root, "sub/x", "hello");
    let reference = write_sub_manifest(root, "sub/Manifest", &sub, "");
    write(root, "Manifest", &reference);

    let mut forest = open_forest(root);
    assert_eq!(forest.loaded_manifests().len(), 1);

    let entry = forest.find_path_entry("sub/x").unwrap().unwrap();
    assert_eq!(entry.tag(), EntryTag::Data);
    assert_eq!(entry.path(), Some("x"));
    assert!(forest.loaded_manifests().contains_key("sub/Manifest"));
}

#[test]
fn test_unrelated_sub_manifests_stay_unloaded() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let a = write_sub_manifest(root, "a/Manifest", "", "");
    let b = write_sub_manifest(root, "b/Manifest", "", "");
    write(root, "Manifest", &format!("{a}{b}"));

    let mut forest = open_forest(root);
    forest.load_manifests_for_path("a/file", false, true).unwrap();
    assert!(forest.loaded_manifests().contains_key("a/Manifest"));
    assert!(!forest.loaded_manifests().contains_key("b/Manifest"));

    forest.load_manifests_for_path("", true, true).unwrap();
    assert!(forest.loaded_manifests().contains_key("b/Manifest"));
}

#[test]
fn test_nested_manifests_load_to_fixed_point() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let inner = write_sub_manifest(root, "a/b/c/Manifest", "", "a/b");
    let middle = write_sub_manifest(root, "a/b/Manifest", &inner, "a");
    let outer = write_sub_manifest(root, "a/Manifest", &middle, "");
    write(root, "Manifest", &outer);

    let mut forest = open_forest(root);
    forest.load_manifests_for_path("a/b/c/d", false, true).unwrap();

    let order: Vec<&str> = forest
        .manifests_for_path("a/b/c/d", false)
        .into_iter()
        .map(|(relpath, _)| relpath)
        .collect();
    assert_eq!(
        order,
        vec!["a/b/c/Manifest", "a/b/Manifest", "a/Manifest", "Manifest"]
    );

    let below_a: Vec<&str> = forest
        .manifests_for_path("a/b", true)
        .into_iter()
        .map(|(relpath, _)| relpath)
        .collect();
    assert_eq!(below_a, vec!["a/b/c/Manifest", "a/b/Manifest", "a/Manifest", "Manifest"]);
    assert_eq!(forest.manifests_for_path("a/bc", false).len(), 2);
}

#[test]
fn test_sub_manifest_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let empty_md5 = hash_bytes(b"", &["MD5"]).unwrap().checksums["MD5"].clone();
    write(root, "Manifest", &format!("MANIFEST sub/Manifest 0 MD5 {empty_md5}\n"));
    let sub = entry_line("DATA", "x", b"data");
    write(root, "sub/Manifest", &sub);

    let mut forest = open_forest(root);
    match forest.load_manifests_for_path("sub", false, true) {
        Err(ForestError::Mismatch(mismatch)) => {
            assert_eq!(mismatch.path, "sub/Manifest");
            assert_eq!(mismatch.diff.len(), 1);
            assert_eq!(mismatch.diff[0].field, "__size__");
            assert_eq!(mismatch.diff[0].expected.as_deref(), Some("0"));
            assert_eq!(
                mismatch.diff[0].got,
                Some(sub.len().to_string())
            );
        }
        other => panic!("Expected Mismatch, got {:?}", other),
    }

    // without verification the Manifest loads anyway
    forest.load_manifests_for_path("sub", false, false).unwrap();
    assert!(forest.loaded_manifests().contains_key("sub/Manifest"));
}

#[test]
fn test_missing_sub_manifest() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    write(root, "Manifest", &entry_line("MANIFEST", "gone/Manifest", b""));

    let mut forest = open_forest(root);
    forest.load_manifests_for_path("", true, false).unwrap();
    assert_eq!(forest.loaded_manifests().len(), 1);

    match forest.load_manifests_for_path("", true, true) {
        Err(ForestError::Mismatch(mismatch)) => {
            assert_eq!(mismatch.path, "gone/Manifest");
            assert_eq!(mismatch.diff[0].field, "__exists__");
        }
        other => panic!("Expected Mismatch, got {:?}", other),
    }
}

#[test]
fn test_find_path_entry_ignore_and_most_specific() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let sub = format!("{}IGNORE cache\n", entry_line("DATA", "x", b"one"));
    let reference = write_sub_manifest(root, "sub/Manifest", &sub, "");
    write(
        root,
        "Manifest",
        &format!("{reference}{}", entry_line("DATA", "sub/x", b"one")),
    );

    let mut forest = open_forest(root);
    match forest.find_path_entry("sub/cache/deep/file").unwrap() {
        Some(ManifestEntry::Ignore(path)) => assert_eq!(path, "cache"),
        other => panic!("Expected IGNORE entry, got {:?}", other),
    }
    // sub/Manifest is more specific than the top-level one
    assert_eq!(forest.find_path_entry("sub/x").unwrap().unwrap().path(), Some("x"));
    assert!(forest.find_path_entry("sub/y").unwrap().is_none());
}

#[test]
fn test_file_entry_dict_merges_duplicates() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let sha1 = hash_bytes(b"abc", &["SHA1"]).unwrap().checksums["SHA1"].clone();
    let sub = format!("DATA f 3 SHA1 {sha1}\n");
    let reference = write_sub_manifest(root, "sub/Manifest", &sub, "");
    write(
        root,
        "Manifest",
        &format!(
            "{reference}{}DIST foo.tar.gz 10 MD5 00\nTIMESTAMP 2020-01-01T00:00:00Z\n",
            entry_line("DATA", "sub/f", b"abc")
        ),
    );

    let mut forest = open_forest(root);
    let dict = forest.get_file_entry_dict("", None, true).unwrap();
    let merged = dict["sub"]["f"].as_file().unwrap();
    assert_eq!(
        merged.hash_names(),
        vec!["MD5".to_string(), "SHA1".to_string()]
    );
    assert!(dict["sub"].contains_key("Manifest"));
    assert!(!dict.contains_key(""));

    let dist_only = forest
        .get_file_entry_dict("", Some(&[EntryTag::Dist][..]), true)
        .unwrap();
    assert_eq!(dist_only.len(), 1);
    assert!(dist_only[""].contains_key("foo.tar.gz"));
}

#[test]
fn test_file_entry_dict_incompatible_duplicates() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let sub = entry_line("MISC", "f", b"abc");
    let reference = write_sub_manifest(root, "sub/Manifest", &sub, "");
    write(
        root,
        "Manifest",
        &format!("{reference}{}", entry_line("DATA", "sub/f", b"abc")),
    );

    let mut forest = open_forest(root);
    match forest.get_file_entry_dict("sub", None, true) {
        Err(ForestError::IncompatibleEntry { path, diff, .. }) => {
            assert_eq!(path, "sub/f");
            assert_eq!(diff[0].field, "__type__");
        }
        other => panic!("Expected IncompatibleEntry, got {:?}", other.map(|d| d.len())),
    }
}

#[test]
fn test_timestamp() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    write(root, "Manifest", "TIMESTAMP 2017-01-01T01:01:01Z\n");

    let mut forest = open_forest(root);
    let ts = forest.find_timestamp().unwrap();
    assert_eq!(ts.to_rfc3339(), "2017-01-01T01:01:01+00:00");
    assert!(forest.updated_manifests().is_empty());

    let now = Utc::now();
    forest.set_timestamp(now);
    assert_eq!(forest.find_timestamp(), Some(now));
    assert!(forest.updated_manifests().contains("Manifest"));
}

#[test]
fn test_find_dist_entry() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let reference = write_sub_manifest(root, "cat/pkg/Manifest", "DIST pkg-1.tar.gz 100 MD5 00\n", "");
    write(root, "Manifest", &reference);

    let mut forest = open_forest(root);
    let entry = forest.find_dist_entry("pkg-1.tar.gz", "cat/pkg").unwrap().unwrap();
    assert_eq!(entry.tag(), EntryTag::Dist);
    assert!(forest.find_dist_entry("pkg-1.tar.gz", "cat").unwrap().is_none());
    assert!(forest.find_path_entry("cat/pkg/pkg-1.tar.gz").unwrap().is_none());
}

#[test]
fn test_find_top_level_manifest() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    write(&root, "tree/Manifest", "");
    write(&root, "tree/a/Manifest", "");
    fs::create_dir_all(root.join("tree/a/b")).unwrap();

    let found = find_top_level_manifest(&root.join("tree/a/b"), false).unwrap();
    assert_eq!(found, Some(root.join("tree/Manifest")));

    assert_eq!(find_top_level_manifest(&root, false).unwrap(), None);
}

#[test]
fn test_find_top_level_manifest_stops_at_ignore() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    write(&root, "tree/Manifest", "IGNORE a\n");
    write(&root, "tree/a/Manifest", "");

    let found = find_top_level_manifest(&root.join("tree/a"), false).unwrap();
    assert_eq!(found, Some(root.join("tree/a/Manifest")));
}

#[test]
fn test_find_top_level_manifest_compressed() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    let data = crate::compression::compress(CompressionFormat::Gz, b"").unwrap();
    fs::create_dir(root.join("tree")).unwrap();
    fs::write(root.join("tree/Manifest.gz"), data).unwrap();

    let found = find_top_level_manifest(&root.join("tree"), false).unwrap();
    assert_eq!(found, Some(root.join("tree/Manifest.gz")));
}
