//! The local cache store: one embedded SQLite database.
//!
//! Three concerns share the database, because the invariants that matter cut
//! across them: the files cache (`fs_entry`, `root`), the object cache
//! (`object`, `object_relation`) and the local side of the snapshot registry
//! (`snapshot`). All access is plain parameterized SQL; the journal is WAL;
//! multi-statement mutations go through [`Db::with_tx`].
//!
//! The scanner and walker never run concurrently, so a single connection is
//! the whole concurrency story.

use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};

mod files;
mod objects;

pub use files::FsEntry;
pub use objects::SnapshotRow;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS fs_entry (
    id          INTEGER PRIMARY KEY,
    parent_id   INTEGER REFERENCES fs_entry(id) ON DELETE CASCADE,
    name        BLOB NOT NULL,
    obj_id      BLOB,
    st_mode     INTEGER,
    st_mtime_ns INTEGER,
    st_size     INTEGER,
    new_flag    INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS fs_entry_parent_name ON fs_entry(parent_id, name);
CREATE INDEX IF NOT EXISTS fs_entry_new ON fs_entry(new_flag) WHERE new_flag = 1;

CREATE TABLE IF NOT EXISTS root (
    backup_set_name TEXT PRIMARY KEY,
    root_entry_id   INTEGER NOT NULL REFERENCES fs_entry(id),
    root_path       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS object (
    obj_id         BLOB PRIMARY KEY,
    kind           INTEGER NOT NULL,
    payload_len    INTEGER NOT NULL,
    compressed_len INTEGER NOT NULL,
    uploaded_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS object_relation (
    parent_oid BLOB NOT NULL,
    child_oid  BLOB NOT NULL,
    PRIMARY KEY (parent_oid, child_oid)
);
CREATE INDEX IF NOT EXISTS object_relation_child ON object_relation(child_oid);

CREATE TABLE IF NOT EXISTS snapshot (
    name          TEXT PRIMARY KEY,
    root_oid      BLOB NOT NULL,
    created_at_ns INTEGER NOT NULL
);
";

/// Handle to the local cache database.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (creating and migrating if necessary) the cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// An in-memory cache, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // journal_mode is a query-style pragma: it reports the resulting mode.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`.
    ///
    /// Not reentrant: callers must not nest transactions.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// Verify the cross-table invariants and fail with
    /// [`Error::CacheCorruption`] on the first violation found.
    ///
    /// Checked: no relation edge dangles on either side, every `fs_entry`
    /// `obj_id` is present in the object cache, and `new_flag` entries carry
    /// no stat columns. Together with `record`'s children-first contract this
    /// gives the transitive-closure property.
    pub fn check_invariants(&self) -> Result<()> {
        let dangling: u64 = self.conn.query_row(
            "SELECT count(*) FROM object_relation r
             WHERE NOT EXISTS (SELECT 1 FROM object o WHERE o.obj_id = r.child_oid)
                OR NOT EXISTS (SELECT 1 FROM object o WHERE o.obj_id = r.parent_oid)",
            [],
            |row| row.get(0),
        )?;
        if dangling > 0 {
            return Err(Error::CacheCorruption(format!(
                "{dangling} relation edge(s) reference unknown objects"
            )));
        }

        let unbacked: u64 = self.conn.query_row(
            "SELECT count(*) FROM fs_entry e
             WHERE e.obj_id IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM object o WHERE o.obj_id = e.obj_id)",
            [],
            |row| row.get(0),
        )?;
        if unbacked > 0 {
            return Err(Error::CacheCorruption(format!(
                "{unbacked} fs entr(ies) point at objects missing from the cache"
            )));
        }

        let stat_on_new: u64 = self.conn.query_row(
            "SELECT count(*) FROM fs_entry
             WHERE new_flag = 1
               AND (st_mode IS NOT NULL OR st_mtime_ns IS NOT NULL OR st_size IS NOT NULL)",
            [],
            |row| row.get(0),
        )?;
        if stat_on_new > 0 {
            return Err(Error::CacheCorruption(format!(
                "{stat_on_new} new entr(ies) carry stat columns"
            )));
        }

        Ok(())
    }
}
