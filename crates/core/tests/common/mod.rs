//! Shared helpers for the end-to-end tests.
#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use magpie_core::cache::SnapshotRow;
use magpie_core::config::RepoConfig;
use magpie_core::scanner::ScanStats;
use magpie_core::walker::BackupStats;
use magpie_core::{CancelToken, Engine};
use magpie_crypto::{KdfParams, KeyRing, Keyfile};
use magpie_repo::{Memory, Repo};

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// A fresh engine over a shared in-memory repository, with a fully unlocked
/// keyring and a backup set rooted at `<tmp>/set`.
pub struct Fixture {
    pub engine: Engine<Memory>,
    pub repo: Memory,
    pub root: PathBuf,
}

pub const SET: &str = "set";

impl Fixture {
    pub fn new(tmp: &Path) -> Self {
        enable_logging();

        let keys = KeyRing::generate();
        let keyfile = Keyfile::seal(&keys, b"test-password", KdfParams::fast_insecure()).unwrap();
        let repo = Memory::new();
        let engine = Engine::init(
            repo.clone(),
            keys,
            &keyfile,
            RepoConfig::default(),
            tmp.join("cache.db"),
        )
        .unwrap();

        let root = tmp.join("set");
        fs::create_dir_all(&root).unwrap();
        engine.add_backup_set(SET, &root).unwrap();

        Self { engine, repo, root }
    }

    pub fn write(&self, rel: &str, contents: &[u8]) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn scan(&self) -> ScanStats {
        self.engine.scan(SET, &CancelToken::new()).unwrap()
    }

    pub fn backup(&self, snapshot: &str) -> BackupStats {
        let (_, stats) = self
            .engine
            .backup(SET, snapshot, &CancelToken::new())
            .unwrap();
        stats
    }

    pub fn scan_backup(&self, snapshot: &str) -> BackupStats {
        self.scan();
        self.backup(snapshot)
    }

    pub fn snapshot(&self, name: &str) -> SnapshotRow {
        self.engine
            .snapshots()
            .unwrap()
            .into_iter()
            .find(|s| s.name == name)
            .expect("snapshot exists")
    }

    /// Number of DAG objects currently in the repository.
    pub fn remote_objects(&self) -> usize {
        self.repo.list("objects/").unwrap().count()
    }
}

/// A repository decorator with a settable budget of `put`s before every
/// further `put` fails with a transport timeout. Models a flaky uplink for
/// the crash-mid-backup scenario.
#[derive(Clone)]
pub struct FlakyPut {
    inner: Memory,
    budget: Arc<AtomicI64>,
}

impl FlakyPut {
    pub fn new(inner: Memory) -> Self {
        Self {
            inner,
            budget: Arc::new(AtomicI64::new(i64::MAX)),
        }
    }

    /// Allow exactly `n` further puts to succeed.
    pub fn allow_puts(&self, n: i64) {
        self.budget.store(n, Ordering::SeqCst);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.budget.store(i64::MAX, Ordering::SeqCst);
    }
}

impl Repo for FlakyPut {
    type List = <Memory as Repo>::List;

    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        if self.budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "injected put failure"));
        }
        self.inner.put(key, bytes)
    }

    fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> io::Result<Self::List> {
        self.inner.list(prefix)
    }
}

/// Recursively compare two directories on names, file contents, sizes and
/// permission bits.
pub fn assert_same_tree(a: &Path, b: &Path) {
    use std::os::unix::fs::MetadataExt;

    let list = |dir: &Path| {
        let mut names: Vec<std::ffi::OsString> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        names.sort();
        names
    };

    let names = list(a);
    assert_eq!(names, list(b), "directory listings differ: {a:?} vs {b:?}");

    for name in names {
        let (pa, pb) = (a.join(&name), b.join(&name));
        let (ma, mb) = (
            fs::symlink_metadata(&pa).unwrap(),
            fs::symlink_metadata(&pb).unwrap(),
        );
        assert_eq!(ma.is_dir(), mb.is_dir(), "type mismatch at {pa:?}");
        assert_eq!(
            ma.mode() & 0o7777,
            mb.mode() & 0o7777,
            "permissions differ at {pa:?}"
        );
        if ma.is_dir() {
            assert_same_tree(&pa, &pb);
        } else {
            assert_eq!(ma.len(), mb.len(), "size differs at {pa:?}");
            assert_eq!(
                fs::read(&pa).unwrap(),
                fs::read(&pb).unwrap(),
                "contents differ at {pa:?}"
            );
        }
    }
}
