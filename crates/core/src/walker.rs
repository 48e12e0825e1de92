//! The backup walker: turns dirty files-cache entries into uploaded objects.
//!
//! The walk is an explicit post-order over the files cache (children pushed
//! before their parent, results collected in per-frame accumulators), so
//! arbitrarily deep trees cannot overflow the call stack. A subtree whose
//! entry already carries an `obj_id` is skipped wholesale: its DAG is
//! already in the repository.
//!
//! Blob encode/compress/seal/upload work runs on a small worker pool;
//! everything with outgoing references (inodes, trees, the snapshot object)
//! is serialized on the walking thread only after every referenced upload
//! has durably completed and been recorded. That is the one ordering
//! guarantee repository consistency needs.
//!
//! Failure semantics: per-file filesystem errors skip the file (it stays
//! dirty; the backup completes with reduced coverage). A terminal backend or
//! crypto failure aborts the backup with the caches consistent: the object
//! cache holds exactly the objects whose puts completed, no snapshot is
//! written, and the next backup resumes from what succeeded.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, trace, warn};
use magpie_crypto::{KeyRing, Oid};
use magpie_repo::{layout, Repo};

use crate::cache::{Db, FsEntry};
use crate::cancel::CancelToken;
use crate::chunker;
use crate::error::{Error, Result};
use crate::object::{Blob, ChunkRef, Inode, Kind, Object, SnapshotMeta, Tree, TreeEntry};
use crate::snapshot;
use crate::wire;
use crate::Options;

/// What one backup did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// DAG objects uploaded (blobs + inodes + trees; the snapshot metadata
    /// object is not counted).
    pub objects_uploaded: u64,
    /// Deduplication hits: objects the cache already knew the repository has.
    pub objects_skipped: u64,
    /// Sealed bytes shipped to the backend.
    pub bytes_uploaded: u64,
    /// Regular files whose inode was (re)derived this run.
    pub files_backed_up: u64,
    /// Entries skipped due to per-entry filesystem errors.
    pub entries_failed: u64,
}

struct UploadJob {
    oid: Oid,
    payload: Vec<u8>,
}

enum UploadOutcome {
    Done {
        oid: Oid,
        payload_len: u64,
        compressed_len: u64,
        sealed_len: u64,
    },
    Failed {
        error: Error,
    },
}

pub struct Backup<'a, R> {
    db: &'a Db,
    repo: &'a R,
    keys: &'a KeyRing,
    opts: &'a Options,
    cancel: &'a CancelToken,
}

/// One directory being assembled. `path` is `None` only for the synthetic
/// bottom frame that catches the root's result.
struct Frame {
    entry_id: i64,
    path: Option<PathBuf>,
    collected: Vec<TreeEntry>,
}

enum Task {
    Visit(i64),
    BuildTree(i64),
}

impl<'a, R: Repo + Send + Sync> Backup<'a, R> {
    pub fn new(
        db: &'a Db,
        repo: &'a R,
        keys: &'a KeyRing,
        opts: &'a Options,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            db,
            repo,
            keys,
            opts,
            cancel,
        }
    }

    /// Back up `set_name` and commit the result as `snapshot_name`.
    pub fn run(&self, set_name: &str, snapshot_name: &str) -> Result<(SnapshotMeta, BackupStats)> {
        // Fail on an unusable name before doing any work.
        layout::snapshot(snapshot_name)?;
        if self.db.snapshot_get(snapshot_name)?.is_some() {
            return Err(Error::SnapshotExists(snapshot_name.to_owned()));
        }

        let (root_id, root_path) = self
            .db
            .backup_set(set_name)?
            .ok_or_else(|| Error::UnknownBackupSet(set_name.to_owned()))?;
        let root = self
            .db
            .fs_entry(root_id)?
            .ok_or_else(|| Error::CacheCorruption(format!("missing root entry {root_id}")))?;
        if root.stat_tuple().is_none() {
            return Err(Error::Config(format!(
                "backup set {set_name} has never been scanned"
            )));
        }

        let mut stats = BackupStats::default();
        let workers = self.opts.upload_workers.max(1);

        let root_oid = thread::scope(|scope| {
            let (job_tx, job_rx) = crossbeam_channel::bounded::<UploadJob>(workers * 2);
            let (res_tx, res_rx) = crossbeam_channel::unbounded::<UploadOutcome>();

            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let repo = self.repo.clone();
                let keys = self.keys;
                let cancel = self.cancel.clone();
                let level = self.opts.zstd_level;
                // The scope joins workers on exit; the handles aren't needed.
                let _ = scope.spawn(move || upload_worker(&job_rx, &res_tx, &repo, keys, level, &cancel));
            }
            drop(res_tx);

            let out = self.walk(root_id, &root_path, &mut stats, &job_tx, &res_rx);
            drop(job_tx);
            out
        })?;

        let meta = SnapshotMeta {
            name: snapshot_name.to_owned(),
            root: root_oid,
            created_at_ns: now_ns(),
        };
        snapshot::create(self.db, self.repo, self.keys, self.opts, &meta)?;

        info!(
            "snapshot {snapshot_name}: root {root_oid}, {} uploaded / {} deduplicated",
            stats.objects_uploaded, stats.objects_skipped
        );
        Ok((meta, stats))
    }

    fn walk(
        &self,
        root_id: i64,
        root_path: &Path,
        stats: &mut BackupStats,
        job_tx: &Sender<UploadJob>,
        res_rx: &Receiver<UploadOutcome>,
    ) -> Result<Oid> {
        let mut work = vec![Task::Visit(root_id)];
        let mut acc = vec![Frame {
            entry_id: root_id,
            path: None,
            collected: Vec::new(),
        }];

        while let Some(task) = work.pop() {
            self.cancel.check()?;
            match task {
                Task::Visit(id) => {
                    let Some(entry) = self.db.fs_entry(id)? else {
                        continue;
                    };

                    // Clean subtree: its whole DAG is already uploaded.
                    if let Some(oid) = entry.obj_id {
                        trace!("entry {id} unchanged; skipping subtree");
                        push_result(&mut acc, &entry, oid);
                        continue;
                    }

                    let path = entry_path(&acc, root_path, &entry);
                    if entry.is_dir() {
                        let children = self.db.fs_children(id)?;
                        work.push(Task::BuildTree(id));
                        acc.push(Frame {
                            entry_id: id,
                            path: Some(path),
                            collected: Vec::new(),
                        });
                        for child in children.into_iter().rev() {
                            work.push(Task::Visit(child.id));
                        }
                    } else if entry.is_file() {
                        match self.backup_file(&entry, &path, stats, job_tx, res_rx)? {
                            Some(oid) => push_result(&mut acc, &entry, oid),
                            None => stats.entries_failed += 1,
                        }
                    } else {
                        // Never stat'd (scan was interrupted) or an
                        // unsupported type; leave it dirty for the scanner.
                        debug!("entry {id} has no usable stat; skipping");
                        stats.entries_failed += 1;
                    }
                }
                Task::BuildTree(id) => {
                    let frame = acc.pop().expect("tree frame pushed by Visit");
                    let is_root = id == root_id;
                    match self.build_tree(&frame, stats)? {
                        Some(oid) if is_root => return Ok(oid),
                        Some(oid) => {
                            let entry = self.db.fs_entry(id)?.ok_or_else(|| {
                                Error::CacheCorruption(format!("entry {id} vanished mid-backup"))
                            })?;
                            push_result(&mut acc, &entry, oid);
                        }
                        None if is_root => {
                            let path = frame.path.unwrap_or_else(|| root_path.to_path_buf());
                            return Err(Error::fs(
                                path,
                                io::Error::new(io::ErrorKind::Other, "cannot stat backup root"),
                            ));
                        }
                        None => stats.entries_failed += 1,
                    }
                }
            }
        }

        // The loop returns out of the root's BuildTree; reaching here means
        // the root entry was skipped entirely via its cached obj_id.
        let root = self
            .db
            .fs_entry(root_id)?
            .and_then(|e| e.obj_id)
            .ok_or_else(|| Error::CacheCorruption("walk finished without a root tree".into()))?;
        Ok(root)
    }

    /// Chunk, deduplicate and upload one regular file, then serialize its
    /// inode. Returns `None` (file skipped) on per-entry filesystem errors.
    fn backup_file(
        &self,
        entry: &FsEntry,
        path: &Path,
        stats: &mut BackupStats,
        job_tx: &Sender<UploadJob>,
        res_rx: &Receiver<UploadOutcome>,
    ) -> Result<Option<Oid>> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                return Ok(None);
            }
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                return Ok(None);
            }
        };

        let mut chunks = Vec::new();
        let mut in_flight: HashSet<Oid> = HashSet::new();
        let mut jobs_sent = 0usize;
        let mut read_error = None;

        let iter = chunker::chunks(
            io::BufReader::new(file),
            len,
            self.opts.chunk_size,
            self.opts.min_chunkable,
        );
        for chunk in iter {
            self.cancel.check()?;
            let (offset, data) = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            };

            let payload = Blob { data }.encode();
            let oid = self.keys.mac(&payload);
            chunks.push(ChunkRef { offset, oid });

            if self.db.object_exists(oid)? || !in_flight.insert(oid) {
                stats.objects_skipped += 1;
                continue;
            }
            jobs_sent += 1;
            job_tx
                .send(UploadJob { oid, payload })
                .map_err(|_| worker_pool_gone())?;
        }

        // Collect every upload this file dispatched before serializing the
        // inode; blobs must be recorded children-first.
        let mut first_error = None;
        for _ in 0..jobs_sent {
            match res_rx.recv().map_err(|_| worker_pool_gone())? {
                UploadOutcome::Done {
                    oid,
                    payload_len,
                    compressed_len,
                    sealed_len,
                } => {
                    self.db
                        .record_object(oid, Kind::Blob, payload_len, compressed_len, &[])?;
                    stats.objects_uploaded += 1;
                    stats.bytes_uploaded += sealed_len;
                }
                UploadOutcome::Failed { error } => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        if let Some(e) = read_error {
            warn!("skipping {}: {e}", path.display());
            return Ok(None);
        }

        // Scan and backup are decoupled: re-read the stat immediately before
        // serialization so the inode never carries stale metadata.
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                warn!("skipping {}: no longer a regular file", path.display());
                return Ok(None);
            }
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                return Ok(None);
            }
        };
        let inode = inode_from(&meta, chunks);

        let payload = inode.encode();
        let oid = self.keys.mac(&payload);
        if self.db.object_exists(oid)? {
            stats.objects_skipped += 1;
        } else {
            let children = Object::Inode(inode).child_oids();
            self.upload_sync(oid, &payload, Kind::Inode, &children, stats)?;
        }

        self.db.fs_set_obj_id(entry.id, oid)?;
        stats.files_backed_up += 1;
        Ok(Some(oid))
    }

    /// Serialize, upload and record a directory from its collected entries.
    fn build_tree(&self, frame: &Frame, stats: &mut BackupStats) -> Result<Option<Oid>> {
        let Some(path) = frame.path.as_deref() else {
            return Err(Error::CacheCorruption("tree frame without a path".into()));
        };
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                return Ok(None);
            }
        };

        let tree = tree_from(&meta, frame.collected.clone());
        let payload = tree.encode();
        let oid = self.keys.mac(&payload);
        if self.db.object_exists(oid)? {
            stats.objects_skipped += 1;
        } else {
            let children = Object::Tree(tree).child_oids();
            self.upload_sync(oid, &payload, Kind::Tree, &children, stats)?;
        }

        self.db.fs_set_obj_id(frame.entry_id, oid)?;
        Ok(Some(oid))
    }

    /// Upload an object on the walking thread and record it.
    fn upload_sync(
        &self,
        oid: Oid,
        payload: &[u8],
        kind: Kind,
        children: &[Oid],
        stats: &mut BackupStats,
    ) -> Result<()> {
        self.cancel.check()?;
        let (sealed, compressed_len) = wire::to_wire(self.keys, self.opts.zstd_level, payload)?;
        self.repo.put(&layout::object(&oid.to_hex()), &sealed)?;
        self.db
            .record_object(oid, kind, payload.len() as u64, compressed_len, children)?;
        stats.objects_uploaded += 1;
        stats.bytes_uploaded += sealed.len() as u64;
        Ok(())
    }
}

fn upload_worker<R: Repo>(
    job_rx: &Receiver<UploadJob>,
    res_tx: &Sender<UploadOutcome>,
    repo: &R,
    keys: &KeyRing,
    level: i32,
    cancel: &CancelToken,
) {
    for job in job_rx.iter() {
        if cancel.is_cancelled() {
            let _ = res_tx.send(UploadOutcome::Failed {
                error: Error::Cancelled,
            });
            continue;
        }

        let payload_len = job.payload.len() as u64;
        let outcome = match wire::to_wire(keys, level, &job.payload) {
            Ok((sealed, compressed_len)) => {
                match repo.put(&layout::object(&job.oid.to_hex()), &sealed) {
                    Ok(()) => UploadOutcome::Done {
                        oid: job.oid,
                        payload_len,
                        compressed_len,
                        sealed_len: sealed.len() as u64,
                    },
                    Err(e) => UploadOutcome::Failed {
                        error: Error::Storage(e),
                    },
                }
            }
            Err(error) => UploadOutcome::Failed { error },
        };
        if res_tx.send(outcome).is_err() {
            return;
        }
    }
}

fn push_result(acc: &mut [Frame], entry: &FsEntry, oid: Oid) {
    let frame = acc.last_mut().expect("accumulator is never empty mid-walk");
    frame.collected.push(TreeEntry {
        name: entry.name.clone(),
        oid,
    });
}

fn entry_path(acc: &[Frame], root_path: &Path, entry: &FsEntry) -> PathBuf {
    match acc.last().and_then(|frame| frame.path.as_deref()) {
        Some(parent) => parent.join(os_name(&entry.name)),
        None => root_path.to_path_buf(),
    }
}

#[cfg(unix)]
fn inode_from(meta: &fs::Metadata, chunks: Vec<ChunkRef>) -> Inode {
    use std::os::unix::fs::MetadataExt;
    Inode {
        size: meta.size(),
        ino: meta.ino(),
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode(),
        ctime_ns: meta.ctime() * 1_000_000_000 + meta.ctime_nsec(),
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        chunks,
    }
}

#[cfg(unix)]
fn tree_from(meta: &fs::Metadata, entries: Vec<TreeEntry>) -> Tree {
    use std::os::unix::fs::MetadataExt;
    Tree {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode(),
        entries,
    }
}

#[cfg(unix)]
fn os_name(bytes: &[u8]) -> &std::ffi::OsStr {
    std::os::unix::ffi::OsStrExt::from_bytes(bytes)
}

fn worker_pool_gone() -> Error {
    Error::Storage(io::Error::new(
        io::ErrorKind::Other,
        "upload worker pool shut down unexpectedly",
    ))
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
