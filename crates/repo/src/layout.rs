//! The reserved key space of a magpie repository.
//!
//! - `objects/<hex-oid>`: content-addressed tree/inode/blob objects
//! - `snapshots/<name>`: snapshot metadata, named by the operator
//! - `meta/keys`: the password-wrapped key material
//! - `meta/config`: repository-level configuration

use std::io;

/// Prefix under which content-addressed objects live.
pub const OBJECTS: &str = "objects/";
/// Prefix under which snapshot metadata lives.
pub const SNAPSHOTS: &str = "snapshots/";
/// Key of the key-material envelope.
pub const META_KEYS: &str = "meta/keys";
/// Key of the repository configuration document.
pub const META_CONFIG: &str = "meta/config";

/// Key of the object with the given lowercase-hex identifier.
pub fn object(hex_oid: &str) -> String {
    format!("{OBJECTS}{hex_oid}")
}

/// Key of the snapshot named `name`.
///
/// Snapshot names are operator input and become storage keys, so they are
/// restricted to `[A-Za-z0-9._-]`, must not start with a dot, and are capped
/// at 128 bytes. Returns [`io::ErrorKind::InvalidInput`] otherwise.
pub fn snapshot(name: &str) -> io::Result<String> {
    validate_snapshot_name(name)?;
    Ok(format!("{SNAPSHOTS}{name}"))
}

/// The snapshot name embedded in `key`, if `key` lies in the snapshot space.
pub fn snapshot_name(key: &str) -> Option<&str> {
    key.strip_prefix(SNAPSHOTS)
}

pub(crate) fn validate_snapshot_name(name: &str) -> io::Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid snapshot name: {name:?}"),
        ))
    }
}
