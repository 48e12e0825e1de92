//! The snapshot registry: named roots, persisted locally and in the
//! repository's reserved `snapshots/` key space.
//!
//! Snapshot metadata objects are sealed and compressed like DAG objects but
//! are *not* content-addressed; they are keyed by their operator-chosen
//! name. The local `snapshot` table is the registry's authoritative side for
//! the garbage collector: pruning a name here is what makes a root's DAG
//! collectable.

use std::io;

use log::info;
use magpie_crypto::KeyRing;
use magpie_repo::{layout, Repo};

use crate::cache::{Db, SnapshotRow};
use crate::error::{Error, Result};
use crate::object::SnapshotMeta;
use crate::wire;
use crate::Options;

/// Upload a snapshot metadata object and register it locally.
pub fn create<R: Repo>(
    db: &Db,
    repo: &R,
    keys: &KeyRing,
    opts: &Options,
    meta: &SnapshotMeta,
) -> Result<()> {
    let key = layout::snapshot(&meta.name)?;
    let (sealed, _) = wire::to_wire(keys, opts.zstd_level, &meta.encode())?;
    repo.put(&key, &sealed)?;
    db.snapshot_insert(&SnapshotRow {
        name: meta.name.clone(),
        root: meta.root,
        created_at_ns: meta.created_at_ns,
    })?;
    Ok(())
}

/// All registered snapshots, oldest first.
pub fn list(db: &Db) -> Result<Vec<SnapshotRow>> {
    db.snapshot_list()
}

/// Remove a snapshot from the repository and the local registry.
///
/// The objects of its DAG stay put until the next garbage collection.
pub fn remove<R: Repo>(db: &Db, repo: &R, name: &str) -> Result<SnapshotRow> {
    let row = db
        .snapshot_get(name)?
        .ok_or_else(|| Error::NoSuchSnapshot(name.to_owned()))?;

    repo.delete(&layout::snapshot(name)?)?;
    db.snapshot_delete(name)?;
    info!("pruned snapshot {name} (root {})", row.root);
    Ok(row)
}

/// Fetch and open a snapshot's metadata object from the repository.
pub fn fetch<R: Repo>(repo: &R, keys: &KeyRing, name: &str) -> Result<SnapshotMeta> {
    let key = layout::snapshot(name)?;
    let sealed = repo.get(&key).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::NoSuchSnapshot(name.to_owned())
        } else {
            Error::Storage(e)
        }
    })?;
    let payload = wire::from_wire(keys, &sealed)?;
    Ok(SnapshotMeta::decode(&payload)?)
}

#[cfg(test)]
mod tests {
    use magpie_repo::Memory;

    use super::*;

    #[test]
    fn create_fetch_remove_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let repo = Memory::new();
        let keys = KeyRing::generate();
        let opts = Options::default();

        let meta = SnapshotMeta {
            name: "first".into(),
            root: keys.mac(b"some tree"),
            created_at_ns: 42,
        };
        create(&db, &repo, &keys, &opts, &meta).unwrap();

        assert!(repo.contains("snapshots/first"));
        assert_eq!(fetch(&repo, &keys, "first").unwrap(), meta);
        assert_eq!(list(&db).unwrap().len(), 1);

        let removed = remove(&db, &repo, "first").unwrap();
        assert_eq!(removed.root, meta.root);
        assert!(!repo.contains("snapshots/first"));
        assert!(matches!(
            fetch(&repo, &keys, "first"),
            Err(Error::NoSuchSnapshot(_))
        ));
        assert!(matches!(
            remove(&db, &repo, "first"),
            Err(Error::NoSuchSnapshot(_))
        ));
    }
}
