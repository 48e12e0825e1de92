//! The files cache: one row per filesystem path under a backup set.

use std::path::{Path, PathBuf};

use magpie_crypto::Oid;
use rusqlite::{params, OptionalExtension};

use super::Db;
use crate::error::{Error, Result};

/// One row of `fs_entry`.
///
/// `obj_id` is the identifier of the entry's last successful backup; `None`
/// means dirty. A `new_flag` entry was discovered by the current scan but not
/// yet stat'd, so its stat columns are null.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsEntry {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: Vec<u8>,
    pub obj_id: Option<Oid>,
    pub st_mode: Option<u32>,
    pub st_mtime_ns: Option<i64>,
    pub st_size: Option<u64>,
    pub new_flag: bool,
}

impl FsEntry {
    /// The change-detection tuple, if this entry has been stat'd.
    pub fn stat_tuple(&self) -> Option<(u32, i64, u64)> {
        Some((self.st_mode?, self.st_mtime_ns?, self.st_size?))
    }

    pub fn is_dir(&self) -> bool {
        self.st_mode
            .is_some_and(|mode| mode & mode_bits::S_IFMT == mode_bits::S_IFDIR)
    }

    pub fn is_file(&self) -> bool {
        self.st_mode
            .is_some_and(|mode| mode & mode_bits::S_IFMT == mode_bits::S_IFREG)
    }
}

/// The `S_IFMT` constants the cache needs, spelled out so the row type stays
/// free of platform imports.
pub(crate) mod mode_bits {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFREG: u32 = 0o100000;
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FsEntry> {
    let obj_id: Option<Vec<u8>> = row.get(3)?;
    Ok(FsEntry {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        obj_id: obj_id.and_then(|bytes| Oid::from_slice(&bytes).ok()),
        st_mode: row.get(4)?,
        st_mtime_ns: row.get(5)?,
        st_size: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        new_flag: row.get(7)?,
    })
}

const ENTRY_COLS: &str = "id, parent_id, name, obj_id, st_mode, st_mtime_ns, st_size, new_flag";

impl Db {
    /// Register (or look up) a backup set rooted at `path`.
    ///
    /// The root entry has a null parent and an empty name; it starts with
    /// null stat columns and `new_flag` clear, which is the state the
    /// scanner's bootstrap pass recognizes.
    pub fn ensure_backup_set(&self, name: &str, path: &Path) -> Result<i64> {
        if let Some((id, _)) = self.backup_set(name)? {
            return Ok(id);
        }
        self.with_tx(|db| {
            db.conn().execute(
                "INSERT INTO fs_entry (parent_id, name, new_flag) VALUES (NULL, x'', 0)",
                [],
            )?;
            let id = db.conn().last_insert_rowid();
            db.conn().execute(
                "INSERT INTO root (backup_set_name, root_entry_id, root_path) VALUES (?1, ?2, ?3)",
                params![name, id, path.to_string_lossy()],
            )?;
            Ok(id)
        })
    }

    /// The root entry id and root path of a backup set.
    pub fn backup_set(&self, name: &str) -> Result<Option<(i64, PathBuf)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT root_entry_id, root_path FROM root WHERE backup_set_name = ?1",
                params![name],
                |row| {
                    let id: i64 = row.get(0)?;
                    let path: String = row.get(1)?;
                    Ok((id, PathBuf::from(path)))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn fs_entry(&self, id: i64) -> Result<Option<FsEntry>> {
        let entry = self
            .conn()
            .query_row(
                &format!("SELECT {ENTRY_COLS} FROM fs_entry WHERE id = ?1"),
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Children of `id`, ordered by name as an unsigned byte sequence,
    /// the same order tree payloads are canonicalized in.
    pub fn fs_children(&self, id: i64) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT {ENTRY_COLS} FROM fs_entry WHERE parent_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt.query_map(params![id], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Insert a newly discovered child with `new_flag` set and no stats.
    pub fn fs_insert_new(&self, parent_id: i64, name: &[u8]) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO fs_entry (parent_id, name, new_flag) VALUES (?1, ?2, 1)",
            params![parent_id, name],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Delete an entry and all its descendants. Returns how many rows went.
    pub fn fs_delete_recursive(&self, id: i64) -> Result<u64> {
        let count: u64 = self.conn().query_row(
            "WITH RECURSIVE sub(id) AS (
                 SELECT id FROM fs_entry WHERE id = ?1
                 UNION ALL
                 SELECT e.id FROM fs_entry e JOIN sub ON e.parent_id = sub.id
             )
             SELECT count(*) FROM sub",
            params![id],
            |row| row.get(0),
        )?;
        // ON DELETE CASCADE takes the descendants with it.
        self.conn()
            .execute("DELETE FROM fs_entry WHERE id = ?1", params![id])?;
        Ok(count)
    }

    /// Refresh the stat columns and mark the entry dirty.
    pub fn fs_set_stat(&self, id: i64, mode: u32, mtime_ns: i64, size: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE fs_entry
             SET st_mode = ?2, st_mtime_ns = ?3, st_size = ?4, obj_id = NULL
             WHERE id = ?1",
            params![id, mode, mtime_ns, size as i64],
        )?;
        Ok(())
    }

    pub fn fs_clear_new_flag(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("UPDATE fs_entry SET new_flag = 0 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Record a successful backup of this entry.
    pub fn fs_set_obj_id(&self, id: i64, oid: Oid) -> Result<()> {
        self.conn().execute(
            "UPDATE fs_entry SET obj_id = ?2 WHERE id = ?1",
            params![id, oid.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Mark an entry dirty.
    pub fn fs_clear_obj_id(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("UPDATE fs_entry SET obj_id = NULL WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// The ids a scan pass should visit: entries with `new_flag` set, or the
    /// whole table on the first pass of a scan.
    ///
    /// Materializing ids (not rows) up front is what guarantees that rows
    /// inserted *during* the pass are not observed by it; they wait for the
    /// next pass.
    pub fn fs_pass_ids(&self, whole_table: bool) -> Result<Vec<i64>> {
        let sql = if whole_table {
            "SELECT id FROM fs_entry"
        } else {
            "SELECT id FROM fs_entry WHERE new_flag = 1"
        };
        let mut stmt = self.conn().prepare(sql)?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<_>>()?)
    }

    pub fn fs_new_count(&self) -> Result<u64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM fs_entry WHERE new_flag = 1",
            [],
            |row| row.get(0),
        )?)
    }

    /// Propagate dirtiness upward: every ancestor of a dirty entry becomes
    /// dirty. One recursive statement reaches the fixed point.
    pub fn fs_invalidate_ancestors(&self) -> Result<u64> {
        let n = self.conn().execute(
            "WITH RECURSIVE dirty(id) AS (
                 SELECT parent_id FROM fs_entry
                 WHERE obj_id IS NULL AND parent_id IS NOT NULL
                 UNION
                 SELECT e.parent_id FROM fs_entry e JOIN dirty d ON e.id = d.id
                 WHERE e.parent_id IS NOT NULL
             )
             UPDATE fs_entry SET obj_id = NULL WHERE id IN (SELECT id FROM dirty)",
            [],
        )?;
        Ok(n as u64)
    }

    /// Number of dirty (unbacked) entries, for stats and tests.
    pub fn fs_dirty_count(&self) -> Result<u64> {
        Ok(self.conn().query_row(
            "SELECT count(*) FROM fs_entry WHERE obj_id IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Resolve the absolute path of an entry by walking its parent chain.
    pub fn fs_entry_path(&self, set_name: &str, entry: &FsEntry) -> Result<PathBuf> {
        let (root_id, root_path) = self
            .backup_set(set_name)?
            .ok_or_else(|| Error::UnknownBackupSet(set_name.to_owned()))?;

        let mut components: Vec<Vec<u8>> = Vec::new();
        let mut cursor = entry.clone();
        while cursor.id != root_id {
            let Some(parent_id) = cursor.parent_id else {
                return Err(Error::CacheCorruption(format!(
                    "entry {} is not connected to the root of {set_name}",
                    entry.id
                )));
            };
            components.push(cursor.name.clone());
            cursor = self.fs_entry(parent_id)?.ok_or_else(|| {
                Error::CacheCorruption(format!("entry {} has a dangling parent", cursor.id))
            })?;
        }

        let mut path = root_path;
        for name in components.iter().rev() {
            path.push(os_name(name));
        }
        Ok(path)
    }
}

#[cfg(unix)]
fn os_name(bytes: &[u8]) -> &std::ffi::OsStr {
    std::os::unix::ffi::OsStrExt::from_bytes(bytes)
}
