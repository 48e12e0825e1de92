//! End-to-end backup scenarios.

mod common;

use std::fs;

use common::{Fixture, FlakyPut, SET};
use magpie_core::cache::SnapshotRow;
use magpie_core::config::RepoConfig;
use magpie_core::object::Kind;
use magpie_core::{CancelToken, Engine, Error};
use magpie_crypto::{KdfParams, KeyRing, Keyfile};
use magpie_repo::Memory;
use pretty_assertions::assert_eq;

#[test]
fn fresh_backup_then_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("a/b.txt", b"foo");
    fx.write("c.txt", b"bar");

    let stats = fx.scan_backup("s1");
    // 2 blobs + 2 inodes + 2 trees (root and `a`).
    assert_eq!(stats.objects_uploaded, 6);
    assert_eq!(fx.remote_objects(), 6);
    assert!(fx.repo.contains("snapshots/s1"));

    let cache = fx.engine.cache();
    assert_eq!(cache.object_count_by_kind(Kind::Blob).unwrap(), 2);
    assert_eq!(cache.object_count_by_kind(Kind::Inode).unwrap(), 2);
    assert_eq!(cache.object_count_by_kind(Kind::Tree).unwrap(), 2);

    // Unchanged tree: the second backup uploads zero new objects but still
    // commits a snapshot pointing at the same root.
    let stats = fx.scan_backup("s2");
    assert_eq!(stats.objects_uploaded, 0);
    assert_eq!(fx.remote_objects(), 6);
    assert_eq!(fx.snapshot("s1").root, fx.snapshot("s2").root);

    fx.engine.verify_cache().unwrap();
}

#[test]
fn modifying_one_leaf_reuploads_its_path_to_the_root() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("a/b.txt", b"foo");
    fx.write("c.txt", b"bar");
    fx.scan_backup("s1");

    fx.write("c.txt", b"bar!");
    let stats = fx.scan_backup("s2");

    // One new blob, one new inode, one new root tree. `a/` is untouched.
    assert_eq!(stats.objects_uploaded, 3);
    assert_eq!(fx.remote_objects(), 9);
    assert_ne!(fx.snapshot("s1").root, fx.snapshot("s2").root);
}

#[test]
fn rename_dedups_file_content() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("a/b.txt", b"foo");
    fx.write("c.txt", b"bar");
    fx.scan_backup("s1");

    fs::rename(fx.root.join("c.txt"), fx.root.join("d.txt")).unwrap();
    let stats = fx.scan_backup("s2");

    // The content dedups against the existing blob. The rename bumps the
    // file's ctime, so its inode re-derives; the name itself lives in the
    // root tree, which re-derives regardless.
    assert_eq!(fx.engine.cache().object_count_by_kind(Kind::Blob).unwrap(), 2);
    assert_eq!(stats.objects_uploaded, 2);
    assert!(stats.objects_skipped >= 1, "blob should be a dedup hit");
}

#[test]
fn new_empty_file_uploads_no_blob() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("a/b.txt", b"foo");
    fx.write("c.txt", b"bar");
    fx.scan_backup("s1");

    fx.write("a/empty", b"");
    let stats = fx.scan_backup("s2");

    // The empty file's inode + `a`'s tree + the root tree; no blob.
    assert_eq!(stats.objects_uploaded, 3);
    assert_eq!(fx.engine.cache().object_count_by_kind(Kind::Blob).unwrap(), 2);
    assert_eq!(fx.engine.cache().object_count_by_kind(Kind::Inode).unwrap(), 3);
}

#[test]
fn chunk_boundaries_are_exact() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fx = Fixture::new(tmp.path());
    // Tiny repository-independent tunables for the boundary cases.
    fx.engine.options_mut().chunk_size = 8;
    fx.engine.options_mut().min_chunkable = 4;

    fx.write("exact", b"01234567"); // == chunk_size -> one blob
    fx.write("spill", b"abcdefghi"); // chunk_size + 1 -> blobs of 8 and 1
    fx.write("tiny", b"xy"); // < min_chunkable -> one whole-file blob

    let stats = fx.scan_backup("s1");
    // 1 + 2 + 1 blobs, 3 inodes, 1 tree.
    assert_eq!(fx.engine.cache().object_count_by_kind(Kind::Blob).unwrap(), 4);
    assert_eq!(stats.objects_uploaded, 8);
}

#[test]
fn crash_mid_backup_resumes_without_duplicates() {
    let tmp = tempfile::tempdir().unwrap();
    common::enable_logging();

    let keys = KeyRing::generate();
    let keyfile = Keyfile::seal(&keys, b"pw", KdfParams::fast_insecure()).unwrap();
    let repo = FlakyPut::new(Memory::new());
    let engine = Engine::init(
        repo.clone(),
        keys,
        &keyfile,
        RepoConfig::default(),
        tmp.path().join("cache.db"),
    )
    .unwrap();

    let root = tmp.path().join("set");
    fs::create_dir_all(&root).unwrap();
    for i in 0..6 {
        fs::write(root.join(format!("c{i}.txt")), format!("contents {i}")).unwrap();
    }
    engine.add_backup_set(SET, &root).unwrap();
    engine.scan(SET, &CancelToken::new()).unwrap();

    // Let roughly half the objects through, then cut the uplink.
    repo.allow_puts(5);
    let err = engine.backup(SET, "s1", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::Storage(_)), "got {err:?}");

    // Aborted consistently: no snapshot, cache invariants hold, and the
    // cache reflects exactly the puts that completed.
    assert!(engine.snapshots().unwrap().is_empty());
    engine.verify_cache().unwrap();
    let recorded = engine.cache().object_count().unwrap();
    assert_eq!(recorded, 5);

    // The same dirty set resumes cheaply and uploads only what is missing.
    repo.heal();
    let (_, stats) = engine.backup(SET, "s1", &CancelToken::new()).unwrap();
    // 6 blobs + 6 inodes + 1 tree in total, minus what already made it.
    assert_eq!(stats.objects_uploaded, 13 - recorded);
    assert_eq!(engine.cache().object_count().unwrap(), 13);
    assert_eq!(engine.snapshots().unwrap().len(), 1);
    engine.verify_cache().unwrap();
}

#[test]
fn mtime_race_between_scan_and_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("c.txt", b"original");
    fx.scan_backup("s1");

    // Dirty the file, scan, then change it again before the backup runs.
    fx.write("c.txt", b"scanned version");
    fx.scan();
    fx.write("c.txt", b"changed after the scan");
    fx.backup("s2");

    // The walker re-read the stat before serializing, so the snapshot holds
    // the post-race contents and the next scan+backup finds nothing to do.
    let out = tmp.path().join("restored");
    fx.engine
        .restore("s2", &out, &CancelToken::new())
        .unwrap();
    assert_eq!(
        fs::read(out.join("c.txt")).unwrap(),
        b"changed after the scan"
    );

    let stats = fx.scan_backup("s3");
    assert_eq!(stats.objects_uploaded, 0);
    assert_eq!(fx.snapshot("s2").root, fx.snapshot("s3").root);
}

#[test]
fn cancelled_backup_commits_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("c.txt", b"bar");
    fx.scan();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = fx.engine.backup(SET, "s1", &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(fx.engine.snapshots().unwrap().is_empty());
    assert!(!fx.repo.contains("snapshots/s1"));
}

#[test]
fn duplicate_snapshot_names_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("c.txt", b"bar");
    fx.scan_backup("s1");

    let err = fx.engine.backup(SET, "s1", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::SnapshotExists(_)));
}

#[test]
fn snapshot_rows_match_uploaded_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let fx = Fixture::new(tmp.path());
    fx.write("c.txt", b"bar");
    let _ = fx.scan_backup("s1");

    let SnapshotRow { name, root, .. } = fx.snapshot("s1");
    assert_eq!(name, "s1");
    // The registry row and the sealed repository object agree.
    let meta = magpie_core::snapshot::fetch(&fx.repo, fx.engine.keys(), "s1").unwrap();
    assert_eq!(meta.root, root);
}
