//! Core of the magpie backup engine.
//!
//! magpie materializes snapshots of a local directory subtree into a
//! content-addressed, encrypted, deduplicated object repository. The moving
//! parts, leaves first:
//!
//! - [`object`]: the tree/inode/blob model and its canonical encoding;
//!   identifiers are keyed MACs of canonical plaintext ([`magpie_crypto`]).
//! - [`cache`]: the embedded SQL store holding filesystem entries, the
//!   "object exists remotely" table, DAG edges, and snapshot registry rows.
//! - [`scanner`]: multi-pass change detection over the files cache.
//! - [`walker`]: post-order backup, dirty entries in, uploaded objects out.
//! - [`gc`]: Bloom-filter reachability over the local DAG, then a sweep.
//! - [`restore`]: the read path back out of the repository.
//!
//! During a normal backup nothing reads object payloads from the
//! repository: deduplication decisions are made entirely against the local
//! cache, and a lost cache only costs re-uploads, never correctness.
//!
//! [`Engine`] wires the pieces together behind one handle; storage drivers
//! live in [`magpie_repo`].

mod bloom;
pub mod buf;
pub mod cache;
mod cancel;
pub mod chunker;
pub mod config;
mod engine;
pub mod error;
pub mod gc;
pub mod object;
pub mod restore;
pub mod scanner;
pub mod snapshot;
mod varint;
pub mod walker;
mod wire;

pub use cancel::CancelToken;
pub use engine::Engine;
pub use error::{Error, Result};
pub use magpie_crypto::Oid;

use config::RepoConfig;

/// Engine tunables.
///
/// The chunking and compression values are repository-level (pinned by
/// `meta/config` so every client produces identical objects); the worker
/// count is a local choice.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Fixed chunk size for files at or above [`Options::min_chunkable`].
    ///
    /// Default: 10 MiB.
    pub chunk_size: u64,
    /// Files below this length are carried as a single chunk.
    ///
    /// Default: 30 MiB.
    pub min_chunkable: u64,
    /// zstd level for the wire layer.
    ///
    /// Default: 3.
    pub zstd_level: i32,
    /// Concurrent blob encode/encrypt/upload tasks during backup.
    ///
    /// Bounds both network and memory pressure; the walker buffers up to
    /// roughly twice this many chunks. Default: 4.
    pub upload_workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: config::DEFAULT_CHUNK_SIZE,
            min_chunkable: config::DEFAULT_MIN_CHUNKABLE,
            zstd_level: config::DEFAULT_ZSTD_LEVEL,
            upload_workers: 4,
        }
    }
}

impl Options {
    /// Tunables pinned by a repository's config document.
    pub fn from_config(config: &RepoConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            min_chunkable: config.min_chunkable,
            zstd_level: config.compression.level,
            ..Self::default()
        }
    }
}
