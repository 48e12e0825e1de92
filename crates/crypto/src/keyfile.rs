//! The persistent key envelope.
//!
//! A [`Keyfile`] is the JSON document stored as the client's local keyfile
//! and uploaded verbatim to the repository's `meta/keys` slot. The public
//! key and the MAC key are carried in the clear: scan, backup and prune run
//! unattended and must be able to derive identifiers and seal objects
//! without the password. The private scalar is always wrapped: Argon2id
//! stretches the password into an XChaCha20Poly1305 key, and a wrong
//! password surfaces as [`Error::AuthFail`] via the AEAD tag.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, KeyRing};

const KEYFILE_VERSION: u32 = 1;
const NONCE_LEN: usize = 24;

#[derive(Debug, ThisError)]
pub enum KeyfileError {
    #[error("malformed keyfile: {0}")]
    Malformed(String),

    #[error("unsupported keyfile version {0}")]
    Version(u32),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("key derivation failed: {0}")]
    Kdf(argon2::Error),

    #[error(transparent)]
    Crypto(#[from] Error),
}

/// Argon2id parameters, persisted alongside the wrapped key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
    /// Hex-encoded random salt.
    pub salt: String,
}

impl KdfParams {
    /// Interactive-grade parameters with a fresh salt.
    pub fn recommended() -> Self {
        Self::with_costs(19 * 1024, 2, 1)
    }

    /// Deliberately weak parameters for tests that unlock keyrings in a loop.
    /// Never use outside tests.
    pub fn fast_insecure() -> Self {
        Self::with_costs(8, 1, 1)
    }

    fn with_costs(m_cost_kib: u32, t_cost: u32, p_cost: u32) -> Self {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        Self {
            m_cost_kib,
            t_cost,
            p_cost,
            salt: hex::encode(salt),
        }
    }

    fn derive(&self, password: &[u8]) -> Result<[u8; 32], KeyfileError> {
        let salt = hex::decode(&self.salt)
            .map_err(|_| KeyfileError::Malformed("kdf salt is not hex".into()))?;
        let params = Params::new(self.m_cost_kib, self.t_cost, self.p_cost, Some(32))
            .map_err(KeyfileError::Kdf)?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; 32];
        argon
            .hash_password_into(password, &salt, &mut out)
            .map_err(KeyfileError::Kdf)?;
        Ok(out)
    }
}

/// The serialized key envelope. See the module docs for the trust model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keyfile {
    pub version: u32,
    pub kdf: KdfParams,
    /// Hex-encoded X25519 public key.
    public: String,
    /// Hex-encoded MAC key.
    mac_key: String,
    /// Hex-encoded `nonce || aead(private scalar)`.
    sealed_secret: String,
}

impl Keyfile {
    /// Wrap `keys` under `password`. Requires an unlocked keyring.
    pub fn seal(keys: &KeyRing, password: &[u8], kdf: KdfParams) -> Result<Self, KeyfileError> {
        let scalar = keys.secret_bytes().ok_or(Error::Locked)?;
        let wrap_key = kdf.derive(password)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&wrap_key));
        let ct = cipher
            .encrypt(XNonce::from_slice(&nonce), scalar.as_slice())
            .expect("XChaCha20Poly1305 encryption is infallible for in-memory buffers");

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ct);

        Ok(Self {
            version: KEYFILE_VERSION,
            kdf,
            public: hex::encode(keys.public_bytes()),
            mac_key: hex::encode(keys.mac_key_bytes()),
            sealed_secret: hex::encode(sealed),
        })
    }

    /// Recover the full keyring, including the private key.
    pub fn unlock(&self, password: &[u8]) -> Result<KeyRing, KeyfileError> {
        let wrap_key = self.kdf.derive(password)?;
        let sealed = self.hex_field("sealed_secret", &self.sealed_secret)?;
        if sealed.len() < NONCE_LEN {
            return Err(KeyfileError::Malformed("sealed secret too short".into()));
        }
        let (nonce, ct) = sealed.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&wrap_key));
        let scalar: [u8; 32] = cipher
            .decrypt(XNonce::from_slice(nonce), ct)
            .map_err(|_| Error::AuthFail)?
            .try_into()
            .map_err(|_| KeyfileError::Malformed("private scalar has wrong length".into()))?;

        let secret = StaticSecret::from(scalar);
        if PublicKey::from(&secret).as_bytes() != self.public_key()?.as_slice() {
            return Err(KeyfileError::Malformed(
                "private key does not match stored public key".into(),
            ));
        }

        Ok(KeyRing::from_parts(self.mac_key_parsed()?, secret))
    }

    /// Assemble the unattended keyring: no password, no private key.
    pub fn unattended(&self) -> Result<KeyRing, KeyfileError> {
        Ok(KeyRing::unattended(
            self.public_key()?,
            self.mac_key_parsed()?,
        ))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("keyfile serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyfileError> {
        let file: Self = serde_json::from_slice(bytes)?;
        if file.version != KEYFILE_VERSION {
            return Err(KeyfileError::Version(file.version));
        }
        Ok(file)
    }

    fn public_key(&self) -> Result<[u8; 32], KeyfileError> {
        self.hex_field("public", &self.public)?
            .try_into()
            .map_err(|_| KeyfileError::Malformed("public key has wrong length".into()))
    }

    fn mac_key_parsed(&self) -> Result<[u8; 32], KeyfileError> {
        self.hex_field("mac_key", &self.mac_key)?
            .try_into()
            .map_err(|_| KeyfileError::Malformed("mac key has wrong length".into()))
    }

    fn hex_field(&self, name: &str, value: &str) -> Result<Vec<u8>, KeyfileError> {
        hex::decode(value).map_err(|_| KeyfileError::Malformed(format!("{name} is not hex")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unlock_roundtrip() {
        let keys = KeyRing::generate();
        let file = Keyfile::seal(&keys, b"hunter2", KdfParams::fast_insecure()).unwrap();

        let restored = Keyfile::from_bytes(&file.to_bytes()).unwrap();
        let unlocked = restored.unlock(b"hunter2").unwrap();

        assert!(unlocked.is_unlocked());
        assert_eq!(unlocked.public_bytes(), keys.public_bytes());
        assert_eq!(unlocked.mac(b"x"), keys.mac(b"x"));

        // And the sealed channel interoperates across the roundtrip.
        assert_eq!(unlocked.open(&keys.seal(b"hello")).unwrap(), b"hello");
    }

    #[test]
    fn wrong_password_fails_auth() {
        let keys = KeyRing::generate();
        let file = Keyfile::seal(&keys, b"hunter2", KdfParams::fast_insecure()).unwrap();

        assert!(matches!(
            file.unlock(b"hunter3"),
            Err(KeyfileError::Crypto(Error::AuthFail))
        ));
    }

    #[test]
    fn unattended_view_matches() {
        let keys = KeyRing::generate();
        let file = Keyfile::seal(&keys, b"pw", KdfParams::fast_insecure()).unwrap();
        let unattended = file.unattended().unwrap();

        assert!(!unattended.is_unlocked());
        assert_eq!(unattended.mac(b"x"), keys.mac(b"x"));
    }

    #[test]
    fn cannot_wrap_a_locked_keyring() {
        let keys = KeyRing::generate();
        let unattended = KeyRing::unattended(keys.public_bytes(), keys.mac_key_bytes());
        assert!(matches!(
            Keyfile::seal(&unattended, b"pw", KdfParams::fast_insecure()),
            Err(KeyfileError::Crypto(Error::Locked))
        ));
    }

    #[test]
    fn rejects_unknown_versions() {
        let keys = KeyRing::generate();
        let mut file = Keyfile::seal(&keys, b"pw", KdfParams::fast_insecure()).unwrap();
        file.version = 9;
        assert!(matches!(
            Keyfile::from_bytes(&file.to_bytes()),
            Err(KeyfileError::Version(9))
        ));
    }
}
