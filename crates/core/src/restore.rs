//! Restore: materialize a snapshot back into a directory.
//!
//! This is the engine's read path: every object is fetched from the
//! repository, opened (which requires the password-unlocked private key),
//! decompressed, decoded, and verified against its identifier. A fetched
//! payload whose keyed MAC does not equal the id it was stored under is
//! corruption, not data.
//!
//! Contents, sizes, directory structure and permission bits are restored;
//! ownership is applied best-effort and only sticks when running as root.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use magpie_crypto::{KeyRing, Oid};
use magpie_repo::{layout, Repo};

use crate::buf::DecodeError;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::object::{Inode, Object, Tree};
use crate::snapshot;

/// What one restore did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
}

/// Restore `snapshot_name` into the empty directory `target`.
pub fn restore<R: Repo>(
    repo: &R,
    keys: &KeyRing,
    snapshot_name: &str,
    target: &Path,
    cancel: &CancelToken,
) -> Result<RestoreStats> {
    if !keys.is_unlocked() {
        return Err(Error::Crypto(magpie_crypto::Error::Locked));
    }

    fs::create_dir_all(target).map_err(|e| Error::fs(target, e))?;
    let mut probe = fs::read_dir(target).map_err(|e| Error::fs(target, e))?;
    if probe.next().is_some() {
        return Err(Error::TargetNotEmpty(target.to_path_buf()));
    }

    let meta = snapshot::fetch(repo, keys, snapshot_name)?;
    debug!("restoring {snapshot_name} (root {}) into {}", meta.root, target.display());

    let mut stats = RestoreStats::default();
    // Directory permissions are applied leaves-first at the end, so a
    // read-only directory doesn't block the writes into it.
    let mut dir_perms: Vec<(PathBuf, u32, u32, u32)> = Vec::new();
    let mut stack: Vec<(Oid, PathBuf)> = vec![(meta.root, target.to_path_buf())];

    while let Some((oid, path)) = stack.pop() {
        cancel.check()?;
        match fetch_object(repo, keys, oid)? {
            Object::Tree(tree) => {
                restore_dir(&tree, &path, target, &mut stack, &mut dir_perms)?;
                stats.dirs += 1;
            }
            Object::Inode(inode) => {
                stats.bytes += restore_file(repo, keys, &inode, &path, cancel)?;
                stats.files += 1;
            }
            Object::Blob(_) => {
                return Err(Error::Decode(DecodeError::Malformed(
                    "tree entry resolves to a raw blob",
                )))
            }
        }
    }

    for (path, mode, uid, gid) in dir_perms.into_iter().rev() {
        apply_perms(&path, mode, uid, gid)?;
    }

    info!(
        "restored {snapshot_name}: {} dirs, {} files, {} bytes",
        stats.dirs, stats.files, stats.bytes
    );
    Ok(stats)
}

fn restore_dir(
    tree: &Tree,
    path: &Path,
    target: &Path,
    stack: &mut Vec<(Oid, PathBuf)>,
    dir_perms: &mut Vec<(PathBuf, u32, u32, u32)>,
) -> Result<()> {
    if path != target {
        fs::create_dir(path).map_err(|e| Error::fs(path, e))?;
    }
    dir_perms.push((path.to_path_buf(), tree.mode, tree.uid, tree.gid));

    for entry in &tree.entries {
        // Entry names come from the repository; never let one escape the
        // restore target.
        if entry.name.is_empty()
            || entry.name.contains(&b'/')
            || entry.name == b".."
            || entry.name == b"."
        {
            return Err(Error::Decode(DecodeError::Malformed(
                "tree entry name is not a safe path component",
            )));
        }
        stack.push((entry.oid, path.join(os_name(&entry.name))));
    }
    Ok(())
}

fn restore_file<R: Repo>(
    repo: &R,
    keys: &KeyRing,
    inode: &Inode,
    path: &Path,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut file = fs::File::create(path).map_err(|e| Error::fs(path, e))?;
    let mut written = 0u64;

    for chunk in &inode.chunks {
        cancel.check()?;
        if chunk.offset != written {
            return Err(Error::Decode(DecodeError::Malformed(
                "inode chunks are not contiguous",
            )));
        }
        let Object::Blob(blob) = fetch_object(repo, keys, chunk.oid)? else {
            return Err(Error::Decode(DecodeError::Malformed(
                "data chunk resolves to a non-blob",
            )));
        };
        file.write_all(&blob.data).map_err(|e| Error::fs(path, e))?;
        written += blob.data.len() as u64;
    }

    if written != inode.size {
        warn!(
            "{}: restored {written} bytes but inode says {}",
            path.display(),
            inode.size
        );
    }
    drop(file);

    apply_perms(path, inode.mode, inode.uid, inode.gid)?;
    Ok(written)
}

/// Fetch, open, verify and decode one object.
fn fetch_object<R: Repo>(repo: &R, keys: &KeyRing, oid: Oid) -> Result<Object> {
    let sealed = repo.get(&layout::object(&oid.to_hex())).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::MissingObject(oid)
        } else {
            Error::Storage(e)
        }
    })?;
    let payload = crate::wire::from_wire(keys, &sealed)?;
    if keys.mac(&payload) != oid {
        return Err(Error::IdMismatch { oid });
    }
    Ok(Object::decode(&payload)?)
}

#[cfg(unix)]
fn apply_perms(path: &Path, mode: u32, uid: u32, gid: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::fs(path, e))?;
    // Ownership only sticks for root; anyone else keeps their own.
    if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        if e.kind() != io::ErrorKind::PermissionDenied {
            return Err(Error::fs(path, e));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn os_name(bytes: &[u8]) -> &std::ffi::OsStr {
    std::os::unix::ffi::OsStrExt::from_bytes(bytes)
}
