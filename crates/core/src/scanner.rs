//! The incremental scanner: multi-pass change detection over the files cache.
//!
//! The scanner never walks the filesystem tree recursively. Each pass
//! selects a batch of cache rows (`new_flag` rows, or the whole table on the
//! first pass of a scan), stats each one, and reconciles directory listings;
//! rows inserted during a pass are deliberately left for the next pass.
//! Passes repeat until no `new_flag` row remains, which is bounded by the
//! depth of subtrees discovered this scan; a steady-state scan finishes in
//! one pass.
//!
//! All mutations of one scan happen inside a single cache transaction.
//! Per-entry filesystem errors are logged and skipped (the entry simply
//! stays dirty or unrefreshed); only root-level or cache-level failures
//! abort the scan.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};

use crate::cache::{Db, FsEntry};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// What one scan did. The scheduler's feedback channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub passes: u32,
    pub entries_scanned: u64,
    pub entries_added: u64,
    pub entries_removed: u64,
    pub entries_dirtied: u64,
    /// Per-entry filesystem errors that were logged and skipped.
    pub errors: u64,
}

pub struct Scanner<'a> {
    db: &'a Db,
    cancel: &'a CancelToken,
}

impl<'a> Scanner<'a> {
    pub fn new(db: &'a Db, cancel: &'a CancelToken) -> Self {
        Self { db, cancel }
    }

    /// Scan the named backup set, marking changed entries dirty.
    pub fn scan(&self, set_name: &str) -> Result<ScanStats> {
        let (root_id, root_path) = self
            .db
            .backup_set(set_name)?
            .ok_or_else(|| Error::UnknownBackupSet(set_name.to_owned()))?;

        self.db
            .with_tx(|db| self.scan_inner(db, root_id, &root_path))
    }

    fn scan_inner(&self, db: &Db, root_id: i64, root_path: &Path) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        let mut paths: HashMap<i64, PathBuf> = HashMap::new();

        // Root bootstrap: a backup set that has never been scanned has a
        // root row without stat columns.
        let root = db
            .fs_entry(root_id)?
            .ok_or_else(|| Error::CacheCorruption(format!("missing root entry {root_id}")))?;
        if root.stat_tuple().is_none() {
            self.bootstrap_root(db, root_id, root_path, &mut stats)?;
        }

        let mut whole_table = true;
        loop {
            self.cancel.check()?;
            let ids = db.fs_pass_ids(whole_table)?;
            whole_table = false;
            if ids.is_empty() {
                break;
            }

            debug!("scan pass {} over {} entries", stats.passes, ids.len());
            for id in ids {
                self.cancel.check()?;
                self.visit(db, root_id, root_path, id, &mut paths, &mut stats)?;
            }
            stats.passes += 1;

            if db.fs_new_count()? == 0 {
                break;
            }
        }

        // A changed child invalidates its parents' serialized trees, all the
        // way up.
        db.fs_invalidate_ancestors()?;

        Ok(stats)
    }

    fn bootstrap_root(
        &self,
        db: &Db,
        root_id: i64,
        root_path: &Path,
        stats: &mut ScanStats,
    ) -> Result<()> {
        let meta =
            fs::symlink_metadata(root_path).map_err(|e| Error::fs(root_path, e))?;
        let stat = StatTuple::from(&meta);
        if stat.mode & S_IFMT != S_IFDIR {
            return Err(Error::Config(format!(
                "backup set root {} is not a directory",
                root_path.display()
            )));
        }

        db.fs_set_stat(root_id, stat.mode, stat.mtime_ns, stat.size)?;
        db.fs_clear_new_flag(root_id)?;
        self.reconcile_children(db, root_id, root_path, stats)?;
        Ok(())
    }

    fn visit(
        &self,
        db: &Db,
        root_id: i64,
        root_path: &Path,
        id: i64,
        paths: &mut HashMap<i64, PathBuf>,
        stats: &mut ScanStats,
    ) -> Result<()> {
        // The entry may have been removed earlier in this pass when an
        // ancestor's listing no longer contained it.
        let Some(entry) = db.fs_entry(id)? else {
            return Ok(());
        };
        let path = self.path_of(db, root_id, root_path, &entry, paths)?;
        stats.entries_scanned += 1;

        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if id == root_id {
                    return Err(Error::fs(path, e));
                }
                trace!("{} vanished; dropping its subtree", path.display());
                stats.entries_removed += db.fs_delete_recursive(id)?;
                if let Some(parent) = entry.parent_id {
                    db.fs_clear_obj_id(parent)?;
                }
                return Ok(());
            }
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                stats.errors += 1;
                db.fs_clear_new_flag(id)?;
                return Ok(());
            }
        };
        let stat = StatTuple::from(&meta);

        // A type change (file became a directory, directory became a
        // symlink, ...) is modeled as deletion plus re-creation.
        if let Some((cached_mode, _, _)) = entry.stat_tuple() {
            if cached_mode & S_IFMT != stat.mode & S_IFMT {
                if id == root_id {
                    return Err(Error::Config(format!(
                        "backup set root {} is no longer a directory",
                        root_path.display()
                    )));
                }
                debug!("{} changed type; recreating", path.display());
                stats.entries_removed += db.fs_delete_recursive(id)?;
                if let Some(parent) = entry.parent_id {
                    db.fs_clear_obj_id(parent)?;
                    if supported_type(stat.mode) {
                        db.fs_insert_new(parent, &entry.name)?;
                        stats.entries_added += 1;
                    }
                }
                return Ok(());
            }
        }

        match entry.stat_tuple() {
            Some(cached) if cached == (stat.mode, stat.mtime_ns, stat.size) => {
                // Unchanged; the cached obj_id (if any) stays valid.
            }
            cached => {
                let mtime_changed =
                    cached.map_or(true, |(_, cached_mtime, _)| cached_mtime != stat.mtime_ns);
                db.fs_set_stat(id, stat.mode, stat.mtime_ns, stat.size)?;
                stats.entries_dirtied += 1;

                if stat.mode & S_IFMT == S_IFDIR && mtime_changed {
                    if let Err(e) = self.reconcile_children(db, id, &path, stats) {
                        if !e.is_per_entry() {
                            return Err(e);
                        }
                        warn!("listing {} failed: {e}", path.display());
                        stats.errors += 1;
                    }
                }
            }
        }

        db.fs_clear_new_flag(id)?;
        Ok(())
    }

    /// Compare a directory's cache rows against its current listing: insert
    /// newly present names as `new_flag` rows, drop vanished ones.
    fn reconcile_children(
        &self,
        db: &Db,
        dir_id: i64,
        path: &Path,
        stats: &mut ScanStats,
    ) -> Result<()> {
        let mut listed: BTreeSet<Vec<u8>> = BTreeSet::new();
        let read_dir = fs::read_dir(path).map_err(|e| Error::fs(path, e))?;
        for dirent in read_dir {
            self.cancel.check()?;
            let dirent = dirent.map_err(|e| Error::fs(path, e))?;
            let file_type = match dirent.file_type() {
                Ok(ft) => ft,
                Err(e) => {
                    warn!("skipping {:?}: {e}", dirent.path());
                    stats.errors += 1;
                    continue;
                }
            };
            if !file_type.is_dir() && !file_type.is_file() {
                trace!("ignoring special file {:?}", dirent.path());
                continue;
            }
            listed.insert(name_bytes(&dirent.file_name()));
        }

        let existing = db.fs_children(dir_id)?;
        for row in &existing {
            if !listed.contains(&row.name) {
                stats.entries_removed += db.fs_delete_recursive(row.id)?;
            }
        }
        let known: BTreeSet<&[u8]> = existing.iter().map(|e| e.name.as_slice()).collect();
        for name in &listed {
            if !known.contains(name.as_slice()) {
                db.fs_insert_new(dir_id, name)?;
                stats.entries_added += 1;
            }
        }
        Ok(())
    }

    /// Resolve an entry's absolute path, memoizing intermediate directories
    /// for the duration of the scan.
    fn path_of(
        &self,
        db: &Db,
        root_id: i64,
        root_path: &Path,
        entry: &FsEntry,
        paths: &mut HashMap<i64, PathBuf>,
    ) -> Result<PathBuf> {
        let mut chain: Vec<(i64, Vec<u8>)> = Vec::new();
        let mut cursor = entry.clone();
        let mut base = loop {
            if cursor.id == root_id {
                break root_path.to_path_buf();
            }
            if let Some(known) = paths.get(&cursor.id) {
                break known.clone();
            }
            chain.push((cursor.id, cursor.name.clone()));
            let parent_id = cursor.parent_id.ok_or_else(|| {
                Error::CacheCorruption(format!("entry {} is disconnected from its root", cursor.id))
            })?;
            cursor = db.fs_entry(parent_id)?.ok_or_else(|| {
                Error::CacheCorruption(format!("entry {parent_id} vanished mid-scan"))
            })?;
        };

        for (id, name) in chain.into_iter().rev() {
            base.push(os_name(&name));
            paths.insert(id, base.clone());
        }
        Ok(base)
    }
}

struct StatTuple {
    mode: u32,
    mtime_ns: i64,
    size: u64,
}

#[cfg(unix)]
impl From<&fs::Metadata> for StatTuple {
    fn from(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: meta.mode(),
            mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            size: meta.size(),
        }
    }
}

fn supported_type(mode: u32) -> bool {
    matches!(mode & S_IFMT, S_IFDIR | S_IFREG)
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    std::os::unix::ffi::OsStrExt::as_bytes(name).to_vec()
}

#[cfg(unix)]
fn os_name(bytes: &[u8]) -> &std::ffi::OsStr {
    std::os::unix::ffi::OsStrExt::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write as _;

    use super::*;

    fn scan_once(db: &Db, set: &str) -> ScanStats {
        let cancel = CancelToken::new();
        Scanner::new(db, &cancel).scan(set).unwrap()
    }

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    fn setup(tmp: &Path) -> Db {
        let root = tmp.join("set");
        fs::create_dir_all(root.join("a")).unwrap();
        write_file(&root.join("a/b.txt"), b"foo");
        write_file(&root.join("c.txt"), b"bar");

        let db = Db::open_in_memory().unwrap();
        db.ensure_backup_set("set", &root).unwrap();
        db
    }

    #[test]
    fn first_scan_discovers_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let db = setup(tmp.path());

        let stats = scan_once(&db, "set");
        // Root + a + a/b.txt + c.txt, all dirty.
        assert_eq!(stats.entries_added, 3);
        assert_eq!(db.fs_dirty_count().unwrap(), 4);
        assert_eq!(db.fs_new_count().unwrap(), 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn steady_state_scan_is_one_quiet_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let db = setup(tmp.path());
        scan_once(&db, "set");

        let stats = scan_once(&db, "set");
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.entries_added, 0);
        assert_eq!(stats.entries_removed, 0);
        assert_eq!(stats.entries_dirtied, 0);
    }

    #[test]
    fn deletion_prunes_the_subtree_and_dirties_the_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let db = setup(tmp.path());
        scan_once(&db, "set");

        fs::remove_dir_all(tmp.path().join("set/a")).unwrap();
        let stats = scan_once(&db, "set");

        assert_eq!(stats.entries_removed, 2);
        let root_id = db.backup_set("set").unwrap().unwrap().0;
        assert_eq!(db.fs_children(root_id).unwrap().len(), 1);
    }

    #[test]
    fn unknown_backup_set_is_an_error() {
        let db = Db::open_in_memory().unwrap();
        let cancel = CancelToken::new();
        assert!(matches!(
            Scanner::new(&db, &cancel).scan("nope"),
            Err(Error::UnknownBackupSet(_))
        ));
    }

    #[test]
    fn cancellation_rolls_the_scan_back() {
        let tmp = tempfile::tempdir().unwrap();
        let db = setup(tmp.path());

        let cancel = CancelToken::new();
        cancel.cancel();
        let res = Scanner::new(&db, &cancel).scan("set");
        assert!(matches!(res, Err(Error::Cancelled)));

        // Nothing committed: the next scan starts from scratch.
        assert_eq!(db.fs_new_count().unwrap(), 0);
        let stats = scan_once(&db, "set");
        assert_eq!(stats.entries_added, 3);
    }

    #[test]
    fn special_files_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let db = setup(tmp.path());
        std::os::unix::fs::symlink("c.txt", tmp.path().join("set/link")).unwrap();

        let stats = scan_once(&db, "set");
        assert_eq!(stats.entries_added, 3, "symlink must not be indexed");
    }
}
