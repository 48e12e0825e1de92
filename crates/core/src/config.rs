//! Repository-level configuration, stored at `meta/config`.
//!
//! The document pins the chunking tunables and the algorithm suite a
//! repository was created with, so every client talking to it derives the
//! same identifiers and wire bytes. It is plaintext JSON: it holds no
//! secrets, and a client must be able to read it before any key material is
//! unlocked.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MIN_CHUNKABLE: u64 = 30 * 1024 * 1024;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

const MAC_ALGO: &str = "blake3-keyed";
const SEAL_ALGO: &str = "x25519-xchacha20poly1305";
const KDF_ALGO: &str = "argon2id";
const COMPRESSION_ALGO: &str = "zstd";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algo: String,
    pub level: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CryptoConfig {
    pub mac: String,
    pub seal: String,
    pub kdf: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub chunk_size: u64,
    pub min_chunkable: u64,
    pub compression: CompressionConfig,
    pub crypto: CryptoConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunkable: DEFAULT_MIN_CHUNKABLE,
            compression: CompressionConfig {
                algo: COMPRESSION_ALGO.into(),
                level: DEFAULT_ZSTD_LEVEL,
            },
            crypto: CryptoConfig {
                mac: MAC_ALGO.into(),
                seal: SEAL_ALGO.into(),
                kdf: KDF_ALGO.into(),
            },
        }
    }
}

impl RepoConfig {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("config serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("malformed meta/config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations this build cannot honor byte-for-byte.
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(Error::Config(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        if self.compression.algo != COMPRESSION_ALGO {
            return Err(Error::Config(format!(
                "unsupported compression algorithm {:?}",
                self.compression.algo
            )));
        }
        if self.crypto.mac != MAC_ALGO || self.crypto.seal != SEAL_ALGO || self.crypto.kdf != KDF_ALGO
        {
            return Err(Error::Config("unsupported crypto suite".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        Ok(())
    }
}
