//! Key material for the macro ratchet.
//!
//! Root keys are plain 32-byte secrets wiped on drop. Epoch keypairs are
//! X25519 static secrets scoped to a single epoch; only the public half is
//! ever advertised.

use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{RatchetError, Result};

/// Size of root keys, X25519 secrets and X25519 public keys.
pub const KEY_SIZE: usize = 32;

/// The 32-byte secret from which one epoch's message keys are derived.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; KEY_SIZE]);

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey([REDACTED])")
    }
}

impl PartialEq for RootKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for RootKey {}

impl RootKey {
    /// Generate a root key from the OS random source.
    pub fn generate() -> Self {
        let mut key = Self([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut key.0);
        key
    }

    /// Expand HKDF-SHA256 output straight into a new root key, so no
    /// unwiped copy of the bytes is left behind.
    pub(crate) fn expand(hk: &Hkdf<Sha256>, info: &[u8]) -> Result<Self> {
        let mut key = Self([0u8; KEY_SIZE]);
        hk.expand(info, &mut key.0)
            .map_err(|e| RatchetError::KeyDerivationFailed(e.to_string()))?;
        Ok(key)
    }

    /// Wrap raw key bytes. The array is moved in; callers holding a copy are
    /// responsible for wiping it.
    pub const fn from_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy a root key out of a slice, rejecting anything but 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(RatchetError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = Self([0u8; KEY_SIZE]);
        key.0.copy_from_slice(bytes);
        Ok(key)
    }

    /// Parse a hex-encoded root key.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(text.trim())?);
        Self::from_bytes(&bytes)
    }

    /// Borrow the raw key bytes. Handle with care.
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// An X25519 keypair scoped to one macro epoch.
#[derive(Clone)]
pub struct EpochKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for EpochKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl EpochKeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key.
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Get the public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// X25519 with `peer`, rejecting low-order points that would force an
    /// all-zero shared secret.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(RatchetError::WeakPublicKey);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    #[cfg(test)]
    pub(crate) fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }
}

/// Parse a peer public key from raw bytes.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    let arr: [u8; KEY_SIZE] =
        bytes
            .try_into()
            .map_err(|_| RatchetError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
    Ok(PublicKey::from(arr))
}

/// Parse a hex-encoded peer public key, as exchanged out of band.
pub fn public_key_from_hex(text: &str) -> Result<PublicKey> {
    let bytes = hex::decode(text.trim())?;
    public_key_from_bytes(&bytes)
}

/// Short, log-safe identifier for a public key: the first 8 bytes of its
/// SHA-256 digest, hex encoded.
pub fn key_id(public: &PublicKey) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public.as_bytes());
    hex::encode(&hash[..8])
}
