//! The object cache and relation edges, plus the registry's local rows.
//!
//! A row in `object` asserts "this object is believed to exist in the
//! repository"; rows are written only after a successful upload and deleted
//! only by the garbage collector. `object_relation` holds the DAG edges the
//! collector walks.

use std::time::{SystemTime, UNIX_EPOCH};

use magpie_crypto::Oid;
use rusqlite::{params, OptionalExtension};

use super::Db;
use crate::error::{Error, Result};
use crate::object::Kind;

/// A row of the local `snapshot` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRow {
    pub name: String,
    pub root: Oid,
    pub created_at_ns: i64,
}

fn oid_from_row(bytes: Vec<u8>) -> Result<Oid> {
    Oid::from_slice(&bytes)
        .map_err(|_| Error::CacheCorruption("stored oid has wrong width".into()))
}

fn kind_from_row(byte: i64) -> Result<Kind> {
    u8::try_from(byte)
        .ok()
        .and_then(|b| Kind::from_frame_byte(b).ok())
        .ok_or_else(|| Error::CacheCorruption(format!("unknown object kind {byte}")))
}

impl Db {
    /// Does the repository (as far as the cache knows) hold `oid`?
    pub fn object_exists(&self, oid: Oid) -> Result<bool> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT 1 FROM object WHERE obj_id = ?1")?;
        Ok(stmt.exists(params![oid.as_bytes().as_slice()])?)
    }

    /// Record a successfully uploaded object and its outgoing edges.
    ///
    /// Idempotent. Callers uphold the children-first contract: every child
    /// must already be recorded, which this verifies so a violation surfaces
    /// as [`Error::CacheCorruption`] instead of a dangling edge.
    pub fn record_object(
        &self,
        oid: Oid,
        kind: Kind,
        payload_len: u64,
        compressed_len: u64,
        children: &[Oid],
    ) -> Result<()> {
        self.with_tx(|db| {
            for child in children {
                if !db.object_exists(*child)? {
                    return Err(Error::CacheCorruption(format!(
                        "recording {oid} before its child {child}"
                    )));
                }
            }

            let uploaded_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            db.conn().execute(
                "INSERT OR IGNORE INTO object (obj_id, kind, payload_len, compressed_len, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    oid.as_bytes().as_slice(),
                    kind.frame_byte(),
                    payload_len as i64,
                    compressed_len as i64,
                    uploaded_at
                ],
            )?;
            let mut edge = db.conn().prepare_cached(
                "INSERT OR IGNORE INTO object_relation (parent_oid, child_oid) VALUES (?1, ?2)",
            )?;
            for child in children {
                edge.execute(params![
                    oid.as_bytes().as_slice(),
                    child.as_bytes().as_slice()
                ])?;
            }
            Ok(())
        })
    }

    /// The kind recorded for `oid`, if present.
    pub fn object_kind(&self, oid: Oid) -> Result<Option<Kind>> {
        let kind = self
            .conn()
            .query_row(
                "SELECT kind FROM object WHERE obj_id = ?1",
                params![oid.as_bytes().as_slice()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        kind.map(kind_from_row).transpose()
    }

    pub fn object_count(&self) -> Result<u64> {
        Ok(self
            .conn()
            .query_row("SELECT count(*) FROM object", [], |row| row.get(0))?)
    }

    pub fn object_count_by_kind(&self, kind: Kind) -> Result<u64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM object WHERE kind = ?1",
            params![kind.frame_byte()],
            |row| row.get(0),
        )?)
    }

    /// Stream every cached object id to `f` without materializing the table.
    pub fn for_each_object_oid(&self, mut f: impl FnMut(Oid) -> Result<()>) -> Result<()> {
        let mut stmt = self.conn().prepare("SELECT obj_id FROM object")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            f(oid_from_row(row.get(0)?)?)?;
        }
        Ok(())
    }

    /// Outgoing edges of `oid`.
    pub fn object_children(&self, oid: Oid) -> Result<Vec<Oid>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT child_oid FROM object_relation WHERE parent_oid = ?1")?;
        let rows = stmt.query_map(params![oid.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        rows.map(|r| oid_from_row(r?)).collect()
    }

    /// Incoming edges of `oid`.
    pub fn object_parents(&self, oid: Oid) -> Result<Vec<Oid>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT parent_oid FROM object_relation WHERE child_oid = ?1")?;
        let rows = stmt.query_map(params![oid.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        rows.map(|r| oid_from_row(r?)).collect()
    }

    /// Forget an object and every edge incident to it.
    pub fn delete_object(&self, oid: Oid) -> Result<()> {
        self.with_tx(|db| {
            db.conn().execute(
                "DELETE FROM object_relation WHERE parent_oid = ?1 OR child_oid = ?1",
                params![oid.as_bytes().as_slice()],
            )?;
            db.conn().execute(
                "DELETE FROM object WHERE obj_id = ?1",
                params![oid.as_bytes().as_slice()],
            )?;
            Ok(())
        })
    }

    /// Stream every object reachable from `roots` over the relation edges.
    ///
    /// SQLite's recursive CTE deduplicates visited rows in a temporary
    /// b-tree, so the traversal is exact (each reachable object is yielded
    /// exactly once) and the engine never holds the live set in memory.
    pub fn for_each_reachable(
        &self,
        roots: &[Oid],
        mut f: impl FnMut(Oid) -> Result<()>,
    ) -> Result<()> {
        self.conn()
            .execute_batch("CREATE TEMP TABLE IF NOT EXISTS reach_root (oid BLOB PRIMARY KEY)")?;
        // Always start from a clean seed set; a previous traversal may have
        // been aborted partway.
        self.conn().execute("DELETE FROM reach_root", [])?;
        {
            let mut seed = self
                .conn()
                .prepare_cached("INSERT OR IGNORE INTO reach_root (oid) VALUES (?1)")?;
            for root in roots {
                seed.execute(params![root.as_bytes().as_slice()])?;
            }
        }

        let mut stmt = self.conn().prepare(
            "WITH RECURSIVE reach(oid) AS (
                 SELECT oid FROM reach_root
                 UNION
                 SELECT r.child_oid FROM object_relation r JOIN reach ON r.parent_oid = reach.oid
             )
             SELECT oid FROM reach",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            f(oid_from_row(row.get(0)?)?)?;
        }
        Ok(())
    }

    pub fn snapshot_insert(&self, snapshot: &SnapshotRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO snapshot (name, root_oid, created_at_ns) VALUES (?1, ?2, ?3)",
            params![
                snapshot.name,
                snapshot.root.as_bytes().as_slice(),
                snapshot.created_at_ns
            ],
        )?;
        Ok(())
    }

    pub fn snapshot_get(&self, name: &str) -> Result<Option<SnapshotRow>> {
        let row = self
            .conn()
            .query_row(
                "SELECT name, root_oid, created_at_ns FROM snapshot WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(name, root, created_at_ns)| {
            Ok(SnapshotRow {
                name,
                root: oid_from_row(root)?,
                created_at_ns,
            })
        })
        .transpose()
    }

    /// All snapshots, oldest first.
    pub fn snapshot_list(&self) -> Result<Vec<SnapshotRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT name, root_oid, created_at_ns FROM snapshot ORDER BY created_at_ns, name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        rows.map(|r| {
            let (name, root, created_at_ns) = r?;
            Ok(SnapshotRow {
                name,
                root: oid_from_row(root)?,
                created_at_ns,
            })
        })
        .collect()
    }

    /// Remove a snapshot row. Returns whether it existed.
    pub fn snapshot_delete(&self, name: &str) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM snapshot WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    /// Root identifiers of all live snapshots: the GC's seed set.
    pub fn snapshot_roots(&self) -> Result<Vec<Oid>> {
        let mut stmt = self.conn().prepare("SELECT root_oid FROM snapshot")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        rows.map(|r| oid_from_row(r?)).collect()
    }
}
