//! The macro ratchet: slow, epoch-based re-keying of the root secret.
//!
//! Each transition is expressed as a function from the current snapshot to a
//! new one (`rotated`, `followed`, `anchored`). Nothing is mutated until the
//! caller swaps the new snapshot in, so a failed derivation can never leave a
//! half-rotated ratchet behind. Dropping a snapshot wipes its root key and
//! epoch secret.
//!
//! Epoch `e → e + 1` always derives
//!
//! ```text
//! root' = HKDF-SHA256(salt = root, ikm = X25519(sk_A(e), pk_B(e)))
//! ```
//!
//! where `sk_A(e)` / `pk_B(e)` are the two parties' epoch keys while at epoch
//! `e`. The initiator refreshes its keypair after deriving; the follower keeps
//! its own, since the initiator derived against the follower's advertised
//! public key.

use std::time::{Duration, Instant};

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey;

use crate::error::{RatchetError, Result};
use crate::keys::{EpochKeyPair, KEY_SIZE, RootKey};

/// HKDF info string for epoch-to-epoch root derivation.
const EPOCH_INFO: &[u8] = b"triple-ratchet-macro-epoch-v1";

/// HKDF salt for anchoring an unseeded epoch-0 root key.
const ANCHOR_SALT: &[u8] = b"triple-ratchet-anchor-salt-v1";

/// HKDF info string for anchoring an unseeded epoch-0 root key.
const ANCHOR_INFO: &[u8] = b"triple-ratchet-anchor-v1";

/// Default time between automatic rotations.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One party's macro ratchet state for a single epoch.
#[derive(Clone)]
pub struct MacroRatchet {
    root_key: RootKey,
    epoch: u64,
    keypair: EpochKeyPair,
    last_reset: Instant,
}

impl std::fmt::Debug for MacroRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroRatchet")
            .field("epoch", &self.epoch)
            .field("keypair", &self.keypair)
            .field("root_key", &self.root_key)
            .finish_non_exhaustive()
    }
}

fn hkdf_derive(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<RootKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    RootKey::expand(&hk, info)
}

impl MacroRatchet {
    /// Start at epoch 0 with the given root key, or a random one.
    pub fn new(root_key: Option<RootKey>) -> Self {
        Self {
            root_key: root_key.unwrap_or_else(RootKey::generate),
            epoch: 0,
            keypair: EpochKeyPair::generate(),
            last_reset: Instant::now(),
        }
    }

    /// Current epoch counter.
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// This epoch's public key, as advertised to the peer.
    pub const fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// This epoch's public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.keypair.public_bytes()
    }

    /// Borrow the current root key.
    pub const fn root_key(&self) -> &RootKey {
        &self.root_key
    }

    /// Derive the root key the next epoch would have, without changing state.
    pub fn next_epoch_secret(&self, peer: &PublicKey) -> Result<RootKey> {
        let shared = self.keypair.diffie_hellman(peer)?;
        hkdf_derive(self.root_key.as_bytes(), shared.as_ref(), EPOCH_INFO)
    }

    /// The state after this party initiates a rotation against `peer`.
    pub fn rotated(&self, peer: &PublicKey) -> Result<Self> {
        let root_key = self.next_epoch_secret(peer)?;
        Ok(Self {
            root_key,
            epoch: self.next_epoch()?,
            keypair: EpochKeyPair::generate(),
            last_reset: Instant::now(),
        })
    }

    /// Initiate a rotation in place. The previous root key and epoch secret
    /// are dropped, and therefore wiped, before this returns.
    pub fn rotate(&mut self, peer: &PublicKey) -> Result<()> {
        *self = self.rotated(peer)?;
        Ok(())
    }

    /// The state after following a rotation the peer initiated while the
    /// peer was at this epoch with key `peer`.
    pub fn followed(&self, peer: &PublicKey) -> Result<Self> {
        let root_key = self.next_epoch_secret(peer)?;
        Ok(Self {
            root_key,
            epoch: self.next_epoch()?,
            keypair: self.keypair.clone(),
            last_reset: Instant::now(),
        })
    }

    /// Replace an unshared root key with one both parties can compute from
    /// their current epoch keys alone.
    pub fn anchored(&self, peer: &PublicKey) -> Result<Self> {
        let shared = self.keypair.diffie_hellman(peer)?;
        Ok(Self {
            root_key: hkdf_derive(ANCHOR_SALT, shared.as_ref(), ANCHOR_INFO)?,
            epoch: self.epoch,
            keypair: self.keypair.clone(),
            last_reset: Instant::now(),
        })
    }

    /// Check that `peer` is usable with this epoch's secret.
    pub fn check_peer(&self, peer: &PublicKey) -> Result<()> {
        self.keypair.diffie_hellman(peer).map(drop)
    }

    /// Whether `interval` has elapsed since the last rotation.
    pub fn due(&self, interval: Duration) -> bool {
        self.due_at(interval, Instant::now())
    }

    /// Whether `interval` has elapsed between the last rotation and `now`.
    pub fn due_at(&self, interval: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_reset) >= interval
    }

    fn next_epoch(&self) -> Result<u64> {
        self.epoch
            .checked_add(1)
            .ok_or(RatchetError::CounterExhausted)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_ratchet_starts_at_epoch_zero() {
        let ratchet = MacroRatchet::new(None);
        assert_eq!(ratchet.epoch(), 0);
        assert_eq!(ratchet.public_bytes().len(), 32);
        assert_eq!(ratchet.keypair.secret_bytes().len(), 32);
    }

    #[test]
    fn new_ratchet_keeps_supplied_root_key() {
        let root = RootKey::from_array([7u8; KEY_SIZE]);
        let ratchet = MacroRatchet::new(Some(root.clone()));
        assert_eq!(ratchet.root_key(), &root);
    }

    #[test]
    fn unseeded_ratchets_get_distinct_roots_and_keys() {
        let a = MacroRatchet::new(None);
        let b = MacroRatchet::new(None);
        assert_ne!(a.root_key(), b.root_key());
        assert_ne!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn rotate_increments_epoch_and_refreshes_everything() {
        let mut ratchet = MacroRatchet::new(None);
        let peer = EpochKeyPair::generate();

        for expected in 1..=5 {
            let old_root = ratchet.root_key().clone();
            let old_secret = ratchet.keypair.secret_bytes();
            let old_public = ratchet.public_bytes();

            ratchet.rotate(peer.public_key()).unwrap();

            assert_eq!(ratchet.epoch(), expected);
            assert_ne!(ratchet.root_key(), &old_root);
            assert_ne!(ratchet.keypair.secret_bytes(), old_secret);
            assert_ne!(ratchet.public_bytes(), old_public);
        }
    }

    #[test]
    fn rotate_commits_next_epoch_secret() {
        let mut ratchet = MacroRatchet::new(None);
        let peer = EpochKeyPair::generate();

        let expected = ratchet.next_epoch_secret(peer.public_key()).unwrap();
        ratchet.rotate(peer.public_key()).unwrap();
        assert_eq!(ratchet.root_key(), &expected);
    }

    #[test]
    fn next_epoch_secret_is_pure() {
        let ratchet = MacroRatchet::new(None);
        let peer = EpochKeyPair::generate();

        let first = ratchet.next_epoch_secret(peer.public_key()).unwrap();
        let second = ratchet.next_epoch_secret(peer.public_key()).unwrap();

        assert_eq!(first, second);
        assert_eq!(ratchet.epoch(), 0);
    }

    #[test]
    fn next_epoch_secret_binds_previous_root() {
        let keypair = EpochKeyPair::generate();
        let peer = EpochKeyPair::generate();
        let mut a = MacroRatchet::new(Some(RootKey::from_array([1u8; KEY_SIZE])));
        let mut b = MacroRatchet::new(Some(RootKey::from_array([2u8; KEY_SIZE])));
        a.keypair = keypair.clone();
        b.keypair = keypair;

        let from_a = a.next_epoch_secret(peer.public_key()).unwrap();
        let from_b = b.next_epoch_secret(peer.public_key()).unwrap();
        assert_ne!(from_a, from_b);
    }

    #[test]
    fn rotating_a_snapshot_twice_reuses_root_but_not_keypair() {
        let ratchet = MacroRatchet::new(None);
        let peer = EpochKeyPair::generate();

        let first = ratchet.rotated(peer.public_key()).unwrap();
        let second = ratchet.rotated(peer.public_key()).unwrap();

        assert_eq!(first.root_key(), second.root_key());
        assert_ne!(first.public_bytes(), second.public_bytes());
        assert_eq!(ratchet.epoch(), 0);
    }

    #[test]
    fn initiator_and_follower_agree() {
        let root = RootKey::generate();
        let alice = MacroRatchet::new(Some(root.clone()));
        let bob = MacroRatchet::new(Some(root));

        let alice_next = alice.rotated(bob.public_key()).unwrap();
        let bob_next = bob.followed(alice.public_key()).unwrap();

        assert_eq!(alice_next.epoch(), 1);
        assert_eq!(bob_next.epoch(), 1);
        assert_eq!(alice_next.root_key(), bob_next.root_key());
        assert_ne!(alice_next.public_bytes(), alice.public_bytes());
        assert_eq!(bob_next.public_bytes(), bob.public_bytes());
    }

    #[test]
    fn follower_keeps_up_with_repeated_rotations() {
        let root = RootKey::generate();
        let mut alice = MacroRatchet::new(Some(root.clone()));
        let mut bob = MacroRatchet::new(Some(root));
        let bob_public = *bob.public_key();

        for _ in 0..4 {
            let alice_public = *alice.public_key();
            alice.rotate(&bob_public).unwrap();
            bob = bob.followed(&alice_public).unwrap();
            assert_eq!(alice.root_key(), bob.root_key());
            assert_eq!(alice.epoch(), bob.epoch());
        }
        assert_eq!(bob.epoch(), 4);
    }

    #[test]
    fn anchoring_agrees_without_shared_root() {
        let alice = MacroRatchet::new(None);
        let bob = MacroRatchet::new(None);

        let alice = alice.anchored(bob.public_key()).unwrap();
        let bob = bob.anchored(alice.public_key()).unwrap();

        assert_eq!(alice.root_key(), bob.root_key());
        assert_eq!(alice.epoch(), 0);
        assert_eq!(bob.epoch(), 0);
    }

    #[test]
    fn rotate_against_weak_key_leaves_state_untouched() {
        let mut ratchet = MacroRatchet::new(None);
        let root = ratchet.root_key().clone();
        let public = ratchet.public_bytes();

        let err = ratchet.rotate(&PublicKey::from([0u8; KEY_SIZE])).unwrap_err();

        assert!(matches!(err, RatchetError::WeakPublicKey));
        assert_eq!(ratchet.epoch(), 0);
        assert_eq!(ratchet.root_key(), &root);
        assert_eq!(ratchet.public_bytes(), public);
    }

    #[test]
    fn epoch_overflow_is_an_error() {
        let mut ratchet = MacroRatchet::new(None);
        ratchet.epoch = u64::MAX;
        let peer = EpochKeyPair::generate();
        assert!(matches!(
            ratchet.rotate(peer.public_key()),
            Err(RatchetError::CounterExhausted)
        ));
        assert_eq!(ratchet.epoch(), u64::MAX);
    }

    #[test]
    fn due_respects_interval() {
        let ratchet = MacroRatchet::new(None);
        let hour = Duration::from_secs(3600);

        assert!(!ratchet.due(hour));
        assert!(ratchet.due(Duration::ZERO));
        assert!(ratchet.due_at(hour, ratchet.last_reset + hour));
        assert!(!ratchet.due_at(hour, ratchet.last_reset + hour - Duration::from_secs(1)));
    }

    #[test]
    fn rotation_resets_due_clock() {
        let mut ratchet = MacroRatchet::new(None);
        let before = ratchet.last_reset;
        let peer = EpochKeyPair::generate();
        ratchet.rotate(peer.public_key()).unwrap();
        assert!(ratchet.last_reset >= before);
        assert!(!ratchet.due(DEFAULT_ROTATION_INTERVAL));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let ratchet = MacroRatchet::new(None);
        let debug_output = format!("{ratchet:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(&hex::encode(ratchet.root_key().as_bytes())));
    }
}
