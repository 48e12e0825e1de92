use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A content-addressed object identifier.
///
/// An [`Oid`] is the keyed BLAKE3 MAC of an object's canonical plaintext
/// payload, computed by [`crate::KeyRing::mac`]. It is stable across runs,
/// collision-resistant, and reveals nothing about the plaintext to anyone
/// who lacks the MAC key. Storage keys and all foreign references render it
/// as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid([u8; Self::LEN]);

impl Oid {
    /// Width of an identifier in bytes.
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let arr: [u8; Self::LEN] = bytes.try_into().map_err(|_| Error::MalformedOid {
            len: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Lowercase hex rendering, as used in storage keys.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self)
    }
}

impl FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::MalformedOid { len: s.len() })?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Oid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
