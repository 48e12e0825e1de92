//! Storage backends for the magpie repository.
//!
//! A repository is an opaque key/value store holding encrypted objects. The
//! engine only ever issues the four operations of [`Repo`]; everything else
//! (sharding, retries, transport) is a driver concern. Drivers speak
//! [`std::io::Error`] with the usual [`io::ErrorKind`] conventions:
//! [`io::ErrorKind::NotFound`] for missing keys, anything else is a
//! transport-level failure.

use std::io;

mod fs;
pub mod layout;
#[cfg(any(test, feature = "test"))]
pub mod mem;
mod retry;

pub use fs::Fs;
#[cfg(any(test, feature = "test"))]
pub use mem::Memory;
pub use retry::{Backoff, Retrying};

/// A repository of encrypted backup objects.
///
/// Keys are the reserved names built by [`layout`]: `objects/<hex-oid>` for
/// content-addressed objects, `snapshots/<name>` for snapshot metadata, and
/// the `meta/` documents.
pub trait Repo: Clone {
    /// The iterator returned by [`Repo::list`].
    type List: Iterator<Item = io::Result<String>>;

    /// Write `bytes` under `key`.
    ///
    /// Must be idempotent: a put of an existing key with identical bytes
    /// succeeds. A put of an existing key with *different* bytes is a
    /// violated invariant on the caller's side (object keys are derived from
    /// content), and drivers may do either write.
    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()>;

    /// Read the value stored under `key`.
    ///
    /// Returns [`io::ErrorKind::NotFound`] if the key does not exist.
    fn get(&self, key: &str) -> io::Result<Vec<u8>>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> io::Result<()>;

    /// Lazily enumerate all keys starting with `prefix`.
    ///
    /// Enumeration order is unspecified. Keys created or deleted while the
    /// iterator is live may or may not be observed.
    fn list(&self, prefix: &str) -> io::Result<Self::List>;
}
