//! The on-wire layer: `seal(compress(plaintext))`.
//!
//! Object identifiers are computed over the *plaintext* payload, before
//! compression and encryption. Deduplication must be semantic, not
//! ciphertext-dependent (sealing is nondeterministic, so ciphertexts of
//! identical payloads never match).

use std::io::Cursor;

use magpie_crypto::KeyRing;

use crate::buf::DecodeError;
use crate::error::{Error, Result};

/// Compress and seal a plaintext payload for storage.
///
/// Returns the sealed bytes together with the compressed length, which the
/// object cache records for accounting.
pub fn to_wire(keys: &KeyRing, zstd_level: i32, plaintext: &[u8]) -> Result<(Vec<u8>, u64)> {
    let compressed = zstd::stream::encode_all(Cursor::new(plaintext), zstd_level)?;
    let compressed_len = compressed.len() as u64;
    Ok((keys.seal(&compressed), compressed_len))
}

/// Open and decompress a payload fetched from storage.
///
/// Authentication failures surface as [`Error::Crypto`]; a decompression
/// failure after successful authentication means the payload was produced by
/// a buggy writer and is reported as a decode error.
pub fn from_wire(keys: &KeyRing, sealed: &[u8]) -> Result<Vec<u8>> {
    let compressed = keys.open(sealed)?;
    zstd::stream::decode_all(Cursor::new(compressed))
        .map_err(|_| Error::Decode(DecodeError::Malformed("authenticated payload failed to decompress")))
}
