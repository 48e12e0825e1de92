//! The garbage collector: two-pass Bloom-filter reachability.
//!
//! Runs after snapshots have been pruned from the registry. Pass 1 walks the
//! relation edges from every live snapshot root, entirely in the local
//! cache (the repository is never read), inserting each reachable object
//! into a Bloom filter. Pass 2 streams the whole object table; anything the
//! filter rejects is provably unreachable and gets queued for deletion.
//!
//! The traversal is exact (the cache walks each reachable object exactly
//! once), so the filter can have no false negatives and no live object is
//! ever deleted. Its false positives (~5%) only make a sliver of garbage
//! survive until a later run.
//!
//! Deletion order is backend first, cache second: if the backend delete
//! fails the cache row stays, and the next collection retries it.

use log::{debug, info, warn};
use magpie_repo::{layout, Repo};

use crate::bloom::Bloom;
use crate::cache::Db;
use crate::cancel::CancelToken;
use crate::error::Result;

/// What one collection did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects reachable from live snapshot roots.
    pub live: u64,
    /// Objects examined in the sweep (the whole object cache).
    pub examined: u64,
    /// Unreachable objects removed from the backend and the cache.
    pub swept: u64,
    /// Garbage retained because the filter answered "maybe live".
    pub retained: u64,
    /// Deletions that failed at the backend and will be retried next run.
    pub failed: u64,
}

/// Collect unreachable objects.
pub fn collect<R: Repo>(db: &Db, repo: &R, cancel: &CancelToken) -> Result<GcStats> {
    let roots = db.snapshot_roots()?;
    debug!("gc: {} live snapshot root(s)", roots.len());

    // Sized for the whole table: an upper bound on the live count, which
    // only drives the false-positive rate down.
    let mut bloom = Bloom::with_capacity(db.object_count()?);
    let mut stats = GcStats::default();

    db.for_each_reachable(&roots, |oid| {
        cancel.check()?;
        bloom.insert(oid);
        stats.live += 1;
        Ok(())
    })?;
    debug!(
        "gc: marked {} live objects in a {} byte filter",
        stats.live,
        bloom.size_in_bytes()
    );

    let mut queue = Vec::new();
    db.for_each_object_oid(|oid| {
        cancel.check()?;
        stats.examined += 1;
        if !bloom.contains(oid) {
            queue.push(oid);
        }
        Ok(())
    })?;
    stats.retained = stats.examined - stats.live - queue.len() as u64;

    for oid in queue {
        cancel.check()?;
        match repo.delete(&layout::object(&oid.to_hex())) {
            Ok(()) => {
                db.delete_object(oid)?;
                stats.swept += 1;
            }
            Err(e) => {
                warn!("gc: deleting {oid} failed: {e}; will retry next run");
                stats.failed += 1;
            }
        }
    }

    info!(
        "gc: {} live, {} swept, {} retained, {} failed",
        stats.live, stats.swept, stats.retained, stats.failed
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use magpie_crypto::Oid;
    use magpie_repo::{Memory, Repo as _};

    use super::*;
    use crate::cache::SnapshotRow;
    use crate::object::Kind;

    fn oid(byte: u8) -> Oid {
        Oid::from_bytes([byte; 32])
    }

    /// root tree (4) -> inodes (2, 3) -> shared blob (1); garbage: 8 -> 9.
    fn seeded() -> (Db, Memory) {
        let db = Db::open_in_memory().unwrap();
        let repo = Memory::new();
        for (id, kind, children) in [
            (oid(1), Kind::Blob, vec![]),
            (oid(2), Kind::Inode, vec![oid(1)]),
            (oid(3), Kind::Inode, vec![oid(1)]),
            (oid(4), Kind::Tree, vec![oid(2), oid(3)]),
            (oid(9), Kind::Blob, vec![]),
            (oid(8), Kind::Inode, vec![oid(9)]),
        ] {
            db.record_object(id, kind, 1, 1, &children).unwrap();
            repo.put(&layout::object(&id.to_hex()), b"sealed").unwrap();
        }
        db.snapshot_insert(&SnapshotRow {
            name: "live".into(),
            root: oid(4),
            created_at_ns: 0,
        })
        .unwrap();
        (db, repo)
    }

    #[test]
    fn sweeps_only_unreachable_objects() {
        let (db, repo) = seeded();
        let stats = collect(&db, &repo, &CancelToken::new()).unwrap();

        assert_eq!(stats.live, 4);
        assert_eq!(stats.examined, 6);
        assert_eq!(stats.swept + stats.retained, 2);
        assert_eq!(stats.failed, 0);

        // Live objects survive in both stores.
        for byte in [1, 2, 3, 4] {
            assert!(db.object_exists(oid(byte)).unwrap());
            assert!(repo.contains(&layout::object(&oid(byte).to_hex())));
        }
        db.check_invariants().unwrap();
    }

    #[test]
    fn empty_registry_collects_everything() {
        let (db, repo) = seeded();
        db.snapshot_delete("live").unwrap();

        let stats = collect(&db, &repo, &CancelToken::new()).unwrap();
        assert_eq!(stats.live, 0);
        // All six objects are garbage now; false positives may retain a few.
        assert_eq!(stats.swept + stats.retained, 6);
        assert_eq!(db.object_count().unwrap(), stats.retained);
    }

    #[test]
    fn failed_backend_deletes_keep_the_cache_row() {
        let (db, repo) = seeded();
        db.snapshot_delete("live").unwrap();

        // A backend wrapper that refuses every delete.
        #[derive(Clone)]
        struct NoDelete(Memory);
        impl Repo for NoDelete {
            type List = <Memory as Repo>::List;
            fn put(&self, key: &str, bytes: &[u8]) -> std::io::Result<()> {
                self.0.put(key, bytes)
            }
            fn get(&self, key: &str) -> std::io::Result<Vec<u8>> {
                self.0.get(key)
            }
            fn delete(&self, _key: &str) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "nope"))
            }
            fn list(&self, prefix: &str) -> std::io::Result<Self::List> {
                self.0.list(prefix)
            }
        }

        let stats = collect(&db, &NoDelete(repo), &CancelToken::new()).unwrap();
        assert_eq!(stats.swept, 0);
        assert_eq!(stats.failed + stats.retained, 6);
        // Everything is still in the cache, so the next run retries.
        assert_eq!(db.object_count().unwrap(), 6);
    }
}
