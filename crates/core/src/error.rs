use std::io;
use std::path::PathBuf;

use magpie_crypto::Oid;
use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type Result<T, E = self::Error> = std::result::Result<T, E>;

/// The engine's error kinds.
///
/// Per-entry filesystem failures ([`Error::Fs`]) are recovered close to where
/// they occur: the entry is logged and skipped, and the operation continues
/// with reduced coverage. Everything else aborts the operation that
/// encountered it.
#[derive(Debug, Error)]
pub enum Error {
    /// `lstat`, `listdir` or a file read failed.
    #[error("filesystem operation failed on {}", path.display())]
    Fs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Storage backend transport failure. Retries are the driver's policy;
    /// a terminal failure aborts the current operation.
    #[error("storage backend failure")]
    Storage(#[from] io::Error),

    /// Crypto provider failure, including failed authentication
    /// ([`magpie_crypto::Error::AuthFail`]), which is always fatal.
    #[error(transparent)]
    Crypto(#[from] magpie_crypto::Error),

    /// The key envelope could not be parsed or unlocked.
    #[error(transparent)]
    Keyfile(#[from] magpie_crypto::KeyfileError),

    /// An object payload could not be decoded.
    #[error("failed to decode object payload")]
    Decode(#[from] crate::buf::DecodeError),

    /// The local cache store failed.
    #[error("local cache failure")]
    Cache(#[from] rusqlite::Error),

    /// A local cache invariant does not hold. The engine halts; the cache
    /// needs a verify/rebuild before further use.
    #[error("local cache corruption: {0}")]
    CacheCorruption(String),

    /// Repository configuration is missing, malformed, or incompatible.
    #[error("repository config error: {0}")]
    Config(String),

    /// The named backup set has not been registered in the files cache.
    #[error("unknown backup set: {0}")]
    UnknownBackupSet(String),

    /// The named snapshot does not exist.
    #[error("no such snapshot: {0}")]
    NoSuchSnapshot(String),

    /// A snapshot with this name already exists.
    #[error("snapshot {0} already exists")]
    SnapshotExists(String),

    /// A referenced object is absent from the repository.
    #[error("object {0} missing from repository")]
    MissingObject(Oid),

    /// A fetched object's payload does not MAC to its identifier.
    #[error("object {oid} does not match its identifier")]
    IdMismatch { oid: Oid },

    /// The restore target directory exists and is not empty.
    #[error("restore target {} is not an empty directory", .0.display())]
    TargetNotEmpty(PathBuf),

    /// Cooperative cancellation. Not a failure: nothing is logged and no
    /// cache mutation beyond what already committed has occurred.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Fs {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a per-entry filesystem failure that the scanner
    /// and walker recover from locally.
    pub fn is_per_entry(&self) -> bool {
        matches!(self, Self::Fs { .. })
    }
}
