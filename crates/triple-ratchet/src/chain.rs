//! Chain engine: per-message keys and authenticated encryption under one
//! root key.
//!
//! The macro layer only talks to [`ChainEngine`]. [`SymmetricChain`] is the
//! engine sessions use by default:
//!
//! - a seed is derived from the root key with HKDF-SHA256; the root key itself
//!   is not retained
//! - every engine instance picks a random 16-byte `chain_id` and sends on the
//!   chain keyed by it, so the two parties never need initiator/responder
//!   roles to keep their directions apart
//! - each chain step yields a ChaCha20-Poly1305 key and nonce for exactly one
//!   message, then the chain key moves forward
//! - out-of-order messages are served from a bounded cache of skipped keys
//! - at most [`MAX_RECEIVING_CHAINS`] peer chains are tracked per root; a
//!   chain is never forgotten once opened, so consumed counters stay consumed

use std::collections::HashMap;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ciborium::value::Value;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::SessionConfig;
use crate::error::{RatchetError, Result};
use crate::header::ChainFields;
use crate::keys::{KEY_SIZE, RootKey};

/// Size of the random per-engine chain identifier.
pub const CHAIN_ID_SIZE: usize = 16;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Header field carrying the sender's chain identifier.
pub const CHAIN_ID_FIELD: &str = "chain_id";

/// Header field carrying the message counter within the sender's chain.
pub const COUNTER_FIELD: &str = "n";

/// Receiving chains one engine will open. Messages on further chains are
/// rejected.
pub const MAX_RECEIVING_CHAINS: usize = 4;

const SEED_SALT: &[u8] = b"triple-ratchet-chain-salt-v1";
const SEED_INFO: &[u8] = b"triple-ratchet-chain-seed-v1";
const CHAIN_INFO: &[u8] = b"triple-ratchet-chain-v1";
const MESSAGE_INFO: &[u8] = b"msg";
const NEXT_INFO: &[u8] = b"chain";

/// Derives per-message keys from a root key and encrypts with them.
///
/// An engine is rebuilt from scratch whenever the macro root key changes.
/// `decrypt` must leave the engine untouched unless the message
/// authenticates.
pub trait ChainEngine: Sized {
    /// Build an engine for `root`.
    fn from_root(root: &RootKey, config: &SessionConfig) -> Result<Self>;

    /// Encrypt one message. The returned fields are everything the peer's
    /// engine needs to find the message key; they never contain the root key.
    fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, ChainFields)>;

    /// Decrypt one message produced by a peer engine built from the same root.
    fn decrypt(
        &mut self,
        ciphertext: &[u8],
        fields: &ChainFields,
        associated_data: &[u8],
    ) -> Result<Vec<u8>>;
}

fn kdf_error(e: impl std::fmt::Display) -> RatchetError {
    RatchetError::KeyDerivationFailed(e.to_string())
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ChainKey([u8; KEY_SIZE]);

#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKey {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl ChainKey {
    fn derive(seed: &[u8; KEY_SIZE], chain_id: &[u8; CHAIN_ID_SIZE]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(chain_id), seed);
        let mut key = Self([0u8; KEY_SIZE]);
        hk.expand(CHAIN_INFO, &mut key.0).map_err(kdf_error)?;
        Ok(key)
    }

    /// One symmetric ratchet step: the key for this message and the chain
    /// key for the next.
    fn step(&self) -> Result<(MessageKey, Self)> {
        let hk = Hkdf::<Sha256>::from_prk(&self.0).map_err(kdf_error)?;

        let mut okm = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
        hk.expand(MESSAGE_INFO, &mut *okm).map_err(kdf_error)?;
        let mut message_key = MessageKey {
            key: [0u8; KEY_SIZE],
            nonce: [0u8; NONCE_SIZE],
        };
        message_key.key.copy_from_slice(&okm[..KEY_SIZE]);
        message_key.nonce.copy_from_slice(&okm[KEY_SIZE..]);

        let mut next = Self([0u8; KEY_SIZE]);
        hk.expand(NEXT_INFO, &mut next.0).map_err(kdf_error)?;
        Ok((message_key, next))
    }
}

impl MessageKey {
    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| RatchetError::EncryptionFailed(e.to_string()))
    }

    fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| RatchetError::AuthenticationFailed)
    }
}

struct ReceivingChain {
    key: ChainKey,
    next: u64,
    skipped: HashMap<u64, MessageKey>,
}

/// Symmetric-key chain engine with per-direction chains.
pub struct SymmetricChain {
    seed: Zeroizing<[u8; KEY_SIZE]>,
    chain_id: [u8; CHAIN_ID_SIZE],
    sending: ChainKey,
    sent: u64,
    receiving: HashMap<[u8; CHAIN_ID_SIZE], ReceivingChain>,
    max_skip: usize,
}

impl std::fmt::Debug for SymmetricChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricChain")
            .field("chain_id", &hex::encode(self.chain_id))
            .field("sent", &self.sent)
            .field("receiving_chains", &self.receiving.len())
            .finish_non_exhaustive()
    }
}

fn message_ad(associated_data: &[u8], chain_id: &[u8; CHAIN_ID_SIZE], counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + CHAIN_ID_SIZE + 8);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(chain_id);
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}

fn parse_chain_id(fields: &ChainFields) -> Result<[u8; CHAIN_ID_SIZE]> {
    let bytes = fields.bytes(CHAIN_ID_FIELD)?;
    bytes.try_into().map_err(|_| {
        RatchetError::MalformedHeader(format!(
            "{CHAIN_ID_FIELD} must be {CHAIN_ID_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

impl SymmetricChain {
    /// This engine's sending chain identifier.
    pub const fn chain_id(&self) -> &[u8; CHAIN_ID_SIZE] {
        &self.chain_id
    }

    /// Number of messages sent on this engine.
    pub const fn sent(&self) -> u64 {
        self.sent
    }

    /// Cached out-of-order keys across all receiving chains.
    pub fn skipped_keys(&self) -> usize {
        self.receiving.values().map(|c| c.skipped.len()).sum()
    }

    /// Store a freshly authenticated receiving chain position.
    fn commit_receiving(
        &mut self,
        chain_id: [u8; CHAIN_ID_SIZE],
        key: ChainKey,
        next: u64,
        skipped: Vec<(u64, MessageKey)>,
    ) {
        match self.receiving.get_mut(&chain_id) {
            Some(chain) => {
                chain.key = key;
                chain.next = next;
                chain.skipped.extend(skipped);
            }
            None => {
                self.receiving.insert(
                    chain_id,
                    ReceivingChain {
                        key,
                        next,
                        skipped: skipped.into_iter().collect(),
                    },
                );
            }
        }
    }
}

impl ChainEngine for SymmetricChain {
    fn from_root(root: &RootKey, config: &SessionConfig) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(SEED_SALT), root.as_bytes());
        let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(SEED_INFO, &mut *seed).map_err(kdf_error)?;

        let mut chain_id = [0u8; CHAIN_ID_SIZE];
        OsRng.fill_bytes(&mut chain_id);
        let sending = ChainKey::derive(&seed, &chain_id)?;

        Ok(Self {
            seed,
            chain_id,
            sending,
            sent: 0,
            receiving: HashMap::new(),
            max_skip: config.max_skipped_messages,
        })
    }

    fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, ChainFields)> {
        let counter = self.sent;
        let next_sent = counter
            .checked_add(1)
            .ok_or(RatchetError::CounterExhausted)?;
        let (message_key, next_key) = self.sending.step()?;
        let ciphertext = message_key.seal(
            plaintext,
            &message_ad(associated_data, &self.chain_id, counter),
        )?;
        self.sending = next_key;
        self.sent = next_sent;

        let mut fields = ChainFields::new();
        fields.insert(CHAIN_ID_FIELD, Value::Bytes(self.chain_id.to_vec()));
        fields.insert(COUNTER_FIELD, Value::Integer(counter.into()));
        Ok((ciphertext, fields))
    }

    fn decrypt(
        &mut self,
        ciphertext: &[u8],
        fields: &ChainFields,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        let chain_id = parse_chain_id(fields)?;
        let counter = fields.uint(COUNTER_FIELD)?;
        // Our own messages reflected back at us.
        if chain_id == self.chain_id {
            return Err(RatchetError::AuthenticationFailed);
        }
        let aad = message_ad(associated_data, &chain_id, counter);

        if let Some(chain) = self.receiving.get_mut(&chain_id) {
            if let Some(message_key) = chain.skipped.get(&counter) {
                let plaintext = message_key.open(ciphertext, &aad)?;
                chain.skipped.remove(&counter);
                return Ok(plaintext);
            }
            if counter < chain.next {
                return Err(RatchetError::DuplicateMessage { counter });
            }
        }

        let (mut key, next, stored) = match self.receiving.get(&chain_id) {
            Some(chain) => (chain.key.clone(), chain.next, chain.skipped.len()),
            None if self.receiving.len() >= MAX_RECEIVING_CHAINS => {
                return Err(RatchetError::ChainLimit {
                    limit: MAX_RECEIVING_CHAINS,
                });
            }
            None => (ChainKey::derive(&self.seed, &chain_id)?, 0, 0),
        };
        let limit = self.max_skip;
        let skip = usize::try_from(counter - next)
            .ok()
            .filter(|skip| stored.saturating_add(*skip) <= limit)
            .ok_or(RatchetError::SkipLimit { counter, limit })?;
        let new_next = counter
            .checked_add(1)
            .ok_or(RatchetError::CounterExhausted)?;

        let mut skipped = Vec::with_capacity(skip);
        for index in next..counter {
            let (message_key, next_key) = key.step()?;
            skipped.push((index, message_key));
            key = next_key;
        }
        let (message_key, next_key) = key.step()?;
        let plaintext = message_key.open(ciphertext, &aad)?;

        self.commit_receiving(chain_id, next_key, new_next, skipped);
        Ok(plaintext)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const AD: &[u8] = b"session-ad";

    fn engine_pair(config: &SessionConfig) -> (SymmetricChain, SymmetricChain) {
        let root = RootKey::generate();
        (
            SymmetricChain::from_root(&root, config).unwrap(),
            SymmetricChain::from_root(&root, config).unwrap(),
        )
    }

    fn pair() -> (SymmetricChain, SymmetricChain) {
        engine_pair(&SessionConfig::default())
    }

    #[test]
    fn encrypt_decrypt_roundtrip_both_directions() {
        let (mut alice, mut bob) = pair();

        let (ct, fields) = alice.encrypt(b"hello bob", AD).unwrap();
        assert_eq!(bob.decrypt(&ct, &fields, AD).unwrap(), b"hello bob");

        let (ct, fields) = bob.encrypt(b"hello alice", AD).unwrap();
        assert_eq!(alice.decrypt(&ct, &fields, AD).unwrap(), b"hello alice");
    }

    #[test]
    fn chain_fields_expose_id_and_counter_only() {
        let (mut alice, _bob) = pair();
        alice.encrypt(b"one", AD).unwrap();
        let (_, fields) = alice.encrypt(b"two", AD).unwrap();

        assert_eq!(fields.len(), 2);
        assert_eq!(fields.bytes(CHAIN_ID_FIELD).unwrap(), alice.chain_id());
        assert_eq!(fields.uint(COUNTER_FIELD).unwrap(), 1);
        assert_eq!(alice.sent(), 2);
    }

    #[test]
    fn every_message_gets_a_fresh_key() {
        let (mut alice, _bob) = pair();
        let (first, _) = alice.encrypt(b"same", AD).unwrap();
        let (second, _) = alice.encrypt(b"same", AD).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn out_of_order_messages_decrypt_from_skipped_keys() {
        let (mut alice, mut bob) = pair();
        let messages: Vec<_> = (0..4)
            .map(|i| alice.encrypt(format!("m{i}").as_bytes(), AD).unwrap())
            .collect();

        for i in [3usize, 0, 2, 1] {
            let (ct, fields) = &messages[i];
            assert_eq!(
                bob.decrypt(ct, fields, AD).unwrap(),
                format!("m{i}").as_bytes()
            );
        }
        assert_eq!(bob.skipped_keys(), 0);
    }

    #[test]
    fn replayed_message_is_rejected() {
        let (mut alice, mut bob) = pair();
        let (ct, fields) = alice.encrypt(b"once", AD).unwrap();
        bob.decrypt(&ct, &fields, AD).unwrap();

        assert!(matches!(
            bob.decrypt(&ct, &fields, AD),
            Err(RatchetError::DuplicateMessage { counter: 0 })
        ));
    }

    #[test]
    fn skip_beyond_limit_is_rejected() {
        let config = SessionConfig {
            max_skipped_messages: 3,
            ..SessionConfig::default()
        };
        let (mut alice, mut bob) = engine_pair(&config);
        for _ in 0..4 {
            alice.encrypt(b"lost", AD).unwrap();
        }
        let (ct, fields) = alice.encrypt(b"too far", AD).unwrap();

        assert!(matches!(
            bob.decrypt(&ct, &fields, AD),
            Err(RatchetError::SkipLimit { counter: 4, limit: 3 })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_and_does_not_advance() {
        let (mut alice, mut bob) = pair();
        let (ct, fields) = alice.encrypt(b"secret data", AD).unwrap();

        let mut tampered = ct.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            bob.decrypt(&tampered, &fields, AD),
            Err(RatchetError::AuthenticationFailed)
        ));
        assert_eq!(bob.decrypt(&ct, &fields, AD).unwrap(), b"secret data");
    }

    #[test]
    fn wrong_associated_data_fails() {
        let (mut alice, mut bob) = pair();
        let (ct, fields) = alice.encrypt(b"bound", AD).unwrap();
        assert!(matches!(
            bob.decrypt(&ct, &fields, b"other-ad"),
            Err(RatchetError::AuthenticationFailed)
        ));
    }

    #[test]
    fn engines_from_different_roots_cannot_talk() {
        let config = SessionConfig::default();
        let mut alice = SymmetricChain::from_root(&RootKey::generate(), &config).unwrap();
        let mut mallory = SymmetricChain::from_root(&RootKey::generate(), &config).unwrap();

        let (ct, fields) = alice.encrypt(b"private", AD).unwrap();
        assert!(mallory.decrypt(&ct, &fields, AD).is_err());
    }

    #[test]
    fn reflected_message_is_rejected() {
        let (mut alice, _bob) = pair();
        let (ct, fields) = alice.encrypt(b"echo", AD).unwrap();
        assert!(matches!(
            alice.decrypt(&ct, &fields, AD),
            Err(RatchetError::AuthenticationFailed)
        ));
    }

    #[test]
    fn missing_or_malformed_fields_are_format_errors() {
        let (mut alice, mut bob) = pair();
        let (ct, fields) = alice.encrypt(b"x", AD).unwrap();

        let mut short_id = fields.clone();
        short_id.insert(CHAIN_ID_FIELD, Value::Bytes(vec![0; 4]));
        assert!(matches!(
            bob.decrypt(&ct, &short_id, AD),
            Err(RatchetError::MalformedHeader(_))
        ));

        assert!(matches!(
            bob.decrypt(&ct, &ChainFields::new(), AD),
            Err(RatchetError::MalformedHeader(_))
        ));
    }

    #[test]
    fn receiving_chains_are_capped_and_never_forgotten() {
        let root = RootKey::generate();
        let config = SessionConfig::default();
        let mut receiver = SymmetricChain::from_root(&root, &config).unwrap();

        let mut first = SymmetricChain::from_root(&root, &config).unwrap();
        let (ct0, f0) = first.encrypt(b"a", AD).unwrap();
        let (ct1, f1) = first.encrypt(b"pay 100", AD).unwrap();
        receiver.decrypt(&ct1, &f1, AD).unwrap();

        for _ in 1..MAX_RECEIVING_CHAINS {
            let mut other = SymmetricChain::from_root(&root, &config).unwrap();
            let (ct, fields) = other.encrypt(b"c", AD).unwrap();
            receiver.decrypt(&ct, &fields, AD).unwrap();
        }
        assert_eq!(receiver.receiving.len(), MAX_RECEIVING_CHAINS);

        let mut extra = SymmetricChain::from_root(&root, &config).unwrap();
        let (ct, fields) = extra.encrypt(b"one too many", AD).unwrap();
        assert!(matches!(
            receiver.decrypt(&ct, &fields, AD),
            Err(RatchetError::ChainLimit {
                limit: MAX_RECEIVING_CHAINS
            })
        ));
        assert_eq!(receiver.receiving.len(), MAX_RECEIVING_CHAINS);

        // The first chain still remembers what it consumed and what it skipped.
        assert!(matches!(
            receiver.decrypt(&ct1, &f1, AD),
            Err(RatchetError::DuplicateMessage { counter: 1 })
        ));
        assert_eq!(receiver.decrypt(&ct0, &f0, AD).unwrap(), b"a");
    }

    #[test]
    fn chain_key_steps_are_deterministic() {
        let seed = [9u8; KEY_SIZE];
        let id = [3u8; CHAIN_ID_SIZE];
        let a = ChainKey::derive(&seed, &id).unwrap();
        let b = ChainKey::derive(&seed, &id).unwrap();
        assert_eq!(a.0, b.0);

        let (_, next_a) = a.step().unwrap();
        let (_, next_b) = b.step().unwrap();
        assert_eq!(next_a.0, next_b.0);
        assert_ne!(next_a.0, a.0);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let (alice, _bob) = pair();
        let debug_output = format!("{alice:?}");
        assert!(debug_output.contains("chain_id"));
        assert!(!debug_output.contains(&hex::encode(*alice.seed)));
    }
}
