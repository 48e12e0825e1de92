//! The crypto provider for the magpie backup engine.
//!
//! Three operations over a long-lived key triple:
//!
//! - [`KeyRing::mac`]: deterministic keyed MAC, used for object identifiers.
//! - [`KeyRing::seal`]: nondeterministic sealed-box encryption requiring
//!   only the public key.
//! - [`KeyRing::open`]: authenticated decryption requiring the private key.
//!
//! The asymmetric split is what lets backup and prune run unattended: the
//! scheduler's keyring holds the public key and the MAC key but not the
//! password-unlocked private scalar, which only restore and verify need.
//! The MAC key is distinct key material, not the public key.
//!
//! Construction: the sealed box generates an ephemeral X25519 key pair per
//! message, Diffie-Hellmans it against the recipient key, derives the
//! XChaCha20Poly1305 key and nonce from the shared secret and the two public
//! keys with BLAKE3, and prepends the ephemeral public key to the ciphertext.
//! The AEAD tag makes the result self-authenticating.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error as ThisError;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

mod keyfile;
mod oid;

pub use keyfile::{KdfParams, Keyfile, KeyfileError};
pub use oid::Oid;

const SEAL_KEY_CONTEXT: &str = "magpie 2026-07-14 sealed box key";
const SEAL_NONCE_CONTEXT: &str = "magpie 2026-07-14 sealed box nonce";

/// Length of the ephemeral public key prefixed to every sealed payload.
const EPK_LEN: usize = 32;
/// Length of the Poly1305 authentication tag.
const TAG_LEN: usize = 16;

/// Bytes added to a plaintext by [`KeyRing::seal`].
pub const SEAL_OVERHEAD: usize = EPK_LEN + TAG_LEN;

#[derive(Debug, ThisError)]
pub enum Error {
    /// A ciphertext failed authenticated decryption. Always fatal to the
    /// operation that encountered it; never silently ignored.
    #[error("ciphertext failed authentication")]
    AuthFail,

    /// [`KeyRing::open`] was called on a keyring without the private key.
    #[error("private key is locked; this operation requires the password")]
    Locked,

    /// An object identifier had the wrong width or encoding.
    #[error("malformed object id ({len} bytes)")]
    MalformedOid { len: usize },
}

/// The key material triple: MAC key, public key, optionally the private key.
pub struct KeyRing {
    mac_key: [u8; 32],
    public: PublicKey,
    secret: Option<StaticSecret>,
}

impl KeyRing {
    /// Generate a fresh keyring with a random MAC key and X25519 pair.
    ///
    /// The result is unlocked; persist it with [`Keyfile::seal`].
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let mut mac_key = [0u8; 32];
        OsRng.fill_bytes(&mut mac_key);
        Self {
            mac_key,
            public: PublicKey::from(&secret),
            secret: Some(secret),
        }
    }

    /// Assemble an unattended keyring: can `mac` and `seal`, cannot `open`.
    pub fn unattended(public: [u8; 32], mac_key: [u8; 32]) -> Self {
        Self {
            mac_key,
            public: PublicKey::from(public),
            secret: None,
        }
    }

    pub(crate) fn from_parts(mac_key: [u8; 32], secret: StaticSecret) -> Self {
        Self {
            mac_key,
            public: PublicKey::from(&secret),
            secret: Some(secret),
        }
    }

    /// Whether the private key is present.
    pub fn is_unlocked(&self) -> bool {
        self.secret.is_some()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub(crate) fn mac_key_bytes(&self) -> [u8; 32] {
        self.mac_key
    }

    pub(crate) fn secret_bytes(&self) -> Option<[u8; 32]> {
        self.secret.as_ref().map(StaticSecret::to_bytes)
    }

    /// The deterministic keyed MAC of `payload`: its object identifier.
    pub fn mac(&self, payload: &[u8]) -> Oid {
        Oid::from_bytes(*blake3::keyed_hash(&self.mac_key, payload).as_bytes())
    }

    /// Encrypt `plaintext` so that only the private key can read it.
    ///
    /// Nondeterministic: sealing the same plaintext twice yields unrelated
    /// ciphertexts (fresh ephemeral key each time). Requires only the public
    /// key, so unattended backups can seal.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let esk = EphemeralSecret::random_from_rng(OsRng);
        let epk = PublicKey::from(&esk);
        let shared = esk.diffie_hellman(&self.public);

        let (key, nonce) = derive(shared.as_bytes(), epk.as_bytes(), self.public.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let ct = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .expect("XChaCha20Poly1305 encryption is infallible for in-memory buffers");

        let mut out = Vec::with_capacity(EPK_LEN + ct.len());
        out.extend_from_slice(epk.as_bytes());
        out.extend_from_slice(&ct);
        out
    }

    /// Decrypt a payload produced by [`Self::seal`].
    ///
    /// Fails with [`Error::Locked`] on an unattended keyring and with
    /// [`Error::AuthFail`] if the payload was truncated, corrupted, or sealed
    /// to a different key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        let secret = self.secret.as_ref().ok_or(Error::Locked)?;
        if sealed.len() < SEAL_OVERHEAD {
            return Err(Error::AuthFail);
        }

        let epk_bytes: [u8; EPK_LEN] = sealed[..EPK_LEN].try_into().expect("length checked");
        let epk = PublicKey::from(epk_bytes);
        let shared = secret.diffie_hellman(&epk);

        let (key, nonce) = derive(shared.as_bytes(), &epk_bytes, self.public.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(XNonce::from_slice(&nonce), &sealed[EPK_LEN..])
            .map_err(|_| Error::AuthFail)
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("unlocked", &self.is_unlocked())
            .finish_non_exhaustive()
    }
}

/// Derive the AEAD key and nonce for one sealed box.
///
/// The nonce is bound to both public keys rather than random: the ephemeral
/// key is fresh per message, so the (key, nonce) pair never repeats.
fn derive(shared: &[u8; 32], epk: &[u8; 32], rpk: &[u8; 32]) -> ([u8; 32], [u8; 24]) {
    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(shared);
    ikm[32..64].copy_from_slice(epk);
    ikm[64..].copy_from_slice(rpk);
    let key = blake3::derive_key(SEAL_KEY_CONTEXT, &ikm);

    let mut pks = [0u8; 64];
    pks[..32].copy_from_slice(epk);
    pks[32..].copy_from_slice(rpk);
    let nonce_full = blake3::derive_key(SEAL_NONCE_CONTEXT, &pks);
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&nonce_full[..24]);

    (key, nonce)
}
