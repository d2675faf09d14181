//! Triple Ratchet
//!
//! An epoch-based macro ratchet layered over a per-message chain ratchet.
//! The chain engine gives every message its own key; the macro ratchet
//! periodically re-keys the root secret the engine is seeded from, so that a
//! compromised epoch cannot decrypt traffic from any other epoch.
//!
//! ## Crypto primitives
//!
//! - **Epoch keys**: X25519 keypair per party per epoch
//! - **Rotation**: X25519 DH between epoch keys → HKDF-SHA256 salted with the previous root
//! - **Chain**: HKDF-SHA256 chain keys → ChaCha20-Poly1305 per-message key and nonce
//! - **Header**: CBOR map carrying epoch, macro public key, key trail and chain fields

pub mod chain;
pub mod config;
pub mod error;
pub mod header;
pub mod keys;
pub mod macro_ratchet;
pub mod session;

pub use chain::{ChainEngine, SymmetricChain};
pub use config::{SessionConfig, load_config};
pub use error::{ErrorKind, RatchetError, Result};
pub use header::{ChainFields, Header};
pub use keys::{EpochKeyPair, KEY_SIZE, RootKey, key_id, public_key_from_bytes, public_key_from_hex};
pub use macro_ratchet::{DEFAULT_ROTATION_INTERVAL, MacroRatchet};
#[cfg(any(test, feature = "test-utils"))]
pub use session::session_pair;
pub use session::{PeerKeyUpdate, TripleSession};
pub use x25519_dalek::PublicKey;
