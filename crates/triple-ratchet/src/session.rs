//! Session orchestration: one macro ratchet driving one chain engine.
//!
//! Every mutating operation stages its new state (ratchet snapshot, engine,
//! epoch keys) and commits only after the last fallible step has succeeded,
//! so an error leaves the session exactly as it was.

use std::collections::VecDeque;

use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use crate::chain::{ChainEngine, SymmetricChain};
use crate::config::SessionConfig;
use crate::error::{RatchetError, Result};
use crate::header::{ChainFields, Header};
use crate::keys::{KEY_SIZE, RootKey, key_id, public_key_from_bytes};
use crate::macro_ratchet::MacroRatchet;

/// What an authenticated header told us about the peer's macro key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKeyUpdate {
    /// No peer key was known before.
    FirstContact,
    /// The peer advertised a different key than the one on record.
    Changed,
    /// Same key as before, or the header carried none.
    Unchanged,
}

/// One party's end of a triple-ratchet session.
pub struct TripleSession<E: ChainEngine = SymmetricChain> {
    config: SessionConfig,
    ratchet: MacroRatchet,
    engine: E,
    peer_macro_pk: Option<PublicKey>,
    anchored: bool,
    peer_epoch: u64,
    /// Our public keys for recent epochs, oldest first, for the header trail.
    epoch_keys: VecDeque<(u64, PublicKey)>,
}

impl<E: ChainEngine> std::fmt::Debug for TripleSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleSession")
            .field("epoch", &self.ratchet.epoch())
            .field("macro_pk", &key_id(self.ratchet.public_key()))
            .field("peer_macro_pk", &self.peer_macro_pk.as_ref().map(key_id))
            .field("peer_epoch", &self.peer_epoch)
            .field("anchored", &self.anchored)
            .finish_non_exhaustive()
    }
}

/// A rotation or catch-up that has been computed but not yet committed.
struct Staged<E> {
    ratchet: MacroRatchet,
    engine: E,
    retired: Vec<(u64, PublicKey)>,
}

impl TripleSession<SymmetricChain> {
    /// Create a session with default configuration.
    ///
    /// Without a `root_key` the session is unanchored until the peer's macro
    /// key arrives, either from `peer_pk`, [`set_peer_macro_pk`], or the
    /// peer's first message.
    ///
    /// [`set_peer_macro_pk`]: TripleSession::set_peer_macro_pk
    pub fn new(root_key: Option<RootKey>, peer_pk: Option<&[u8]>) -> Result<Self> {
        Self::with_config(SessionConfig::default(), root_key, peer_pk)
    }
}

impl<E: ChainEngine> TripleSession<E> {
    /// Create a session with explicit configuration and chain engine.
    pub fn with_config(
        config: SessionConfig,
        root_key: Option<RootKey>,
        peer_pk: Option<&[u8]>,
    ) -> Result<Self> {
        config.validate()?;
        let anchored = root_key.is_some();
        let ratchet = MacroRatchet::new(root_key);
        let engine = E::from_root(ratchet.root_key(), &config)?;

        let mut session = Self {
            config,
            ratchet,
            engine,
            peer_macro_pk: None,
            anchored,
            peer_epoch: 0,
            epoch_keys: VecDeque::new(),
        };
        if let Some(pk) = peer_pk {
            session.set_peer_macro_pk(pk)?;
        }
        debug!(
            macro_pk = %key_id(session.ratchet.public_key()),
            anchored = session.anchored,
            "session created"
        );
        Ok(session)
    }

    /// Record the peer's macro public key, as exchanged out of band.
    ///
    /// An unanchored session derives its shared epoch-0 root key from this
    /// key.
    pub fn set_peer_macro_pk(&mut self, pk: &[u8]) -> Result<()> {
        let peer = public_key_from_bytes(pk)?;
        self.ratchet.check_peer(&peer)?;

        if !self.anchored {
            let ratchet = self.ratchet.anchored(&peer)?;
            let engine = E::from_root(ratchet.root_key(), &self.config)?;
            self.ratchet = ratchet;
            self.engine = engine;
            self.anchored = true;
            info!(peer = %key_id(&peer), "session anchored");
        }
        self.peer_macro_pk = Some(peer);
        Ok(())
    }

    /// Our current macro public key.
    pub fn macro_pk(&self) -> [u8; KEY_SIZE] {
        self.ratchet.public_bytes()
    }

    /// Our current epoch.
    pub const fn epoch(&self) -> u64 {
        self.ratchet.epoch()
    }

    /// The peer's macro public key, if known.
    pub fn peer_macro_pk(&self) -> Option<[u8; KEY_SIZE]> {
        self.peer_macro_pk.map(|pk| *pk.as_bytes())
    }

    /// Highest epoch seen in an authenticated message from the peer.
    pub const fn peer_epoch(&self) -> u64 {
        self.peer_epoch
    }

    /// Whether this session shares a root key with its peer.
    pub const fn is_anchored(&self) -> bool {
        self.anchored
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Borrow the chain engine.
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Advance to the next epoch without sending a message.
    pub fn rotate(&mut self) -> Result<()> {
        if !self.anchored {
            return Err(RatchetError::NotAnchored);
        }
        let staged = self.stage_rotation()?;
        self.commit(staged);
        Ok(())
    }

    /// Encrypt `plaintext`, rotating first when forced or when the rotation
    /// interval has elapsed. Returns `(ciphertext, header)`.
    pub fn encrypt(&mut self, plaintext: &[u8], force_rotate: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        if !self.anchored {
            return Err(RatchetError::NotAnchored);
        }

        let rotate = force_rotate || self.ratchet.due(self.config.rotation_interval());
        if !rotate {
            let trail = self.trail(self.ratchet.epoch(), &[]);
            let sealed = seal(&self.ratchet, &mut self.engine, trail, plaintext)?;
            debug!(epoch = self.ratchet.epoch(), len = plaintext.len(), "encrypted message");
            return Ok(sealed);
        }

        let mut staged = self.stage_rotation()?;
        let trail = self.trail(staged.ratchet.epoch(), &staged.retired);
        let sealed = seal(&staged.ratchet, &mut staged.engine, trail, plaintext)?;
        self.commit(staged);
        debug!(epoch = self.ratchet.epoch(), len = plaintext.len(), "encrypted message");
        Ok(sealed)
    }

    /// Decrypt a message, catching up to the sender's epoch first if needed.
    pub fn decrypt(&mut self, ciphertext: &[u8], header: &[u8]) -> Result<Vec<u8>> {
        let header = Header::decode(header)?;
        let local = self.ratchet.epoch();

        if header.epoch < local {
            warn!(received = header.epoch, local, "rejecting message from a past epoch");
            return Err(RatchetError::StaleEpoch {
                received: header.epoch,
                local,
            });
        }
        if header.epoch > local && header.macro_pk.is_none() {
            return Err(RatchetError::MalformedHeader(
                "macro_pk is required when the sender is ahead".into(),
            ));
        }
        let ad = header.associated_data();

        if header.epoch == local && self.anchored {
            let plaintext = self
                .engine
                .decrypt(ciphertext, &header.chain, &ad)
                .inspect_err(|e| warn!(epoch = local, error = %e, "message rejected"))?;
            self.learn_peer_key(&header);
            debug!(epoch = local, len = plaintext.len(), "decrypted message");
            return Ok(plaintext);
        }

        let mut staged = self.stage_catch_up(&header)?;
        let plaintext = staged
            .engine
            .decrypt(ciphertext, &header.chain, &ad)
            .inspect_err(|e| warn!(epoch = header.epoch, local, error = %e, "message rejected"))?;

        if !self.anchored {
            info!("session anchored from first contact");
        }
        if header.epoch > local {
            info!(from = local, to = header.epoch, "caught up with peer");
        }
        self.commit(staged);
        self.anchored = true;
        self.learn_peer_key(&header);
        debug!(epoch = header.epoch, len = plaintext.len(), "decrypted message");
        Ok(plaintext)
    }

    /// Adopt what an authenticated header says about the peer.
    ///
    /// Only ever called after the message carrying `header` decrypted.
    fn learn_peer_key(&mut self, header: &Header) -> PeerKeyUpdate {
        if header.epoch > self.peer_epoch {
            self.peer_epoch = header.epoch;
            let floor = self.peer_epoch;
            self.epoch_keys.retain(|(epoch, _)| *epoch >= floor);
        }

        let Some(pk) = header.macro_pk else {
            return PeerKeyUpdate::Unchanged;
        };
        let update = match self.peer_macro_pk {
            None => PeerKeyUpdate::FirstContact,
            Some(current) if current == pk => PeerKeyUpdate::Unchanged,
            Some(_) => PeerKeyUpdate::Changed,
        };
        match update {
            PeerKeyUpdate::FirstContact => {
                info!(peer = %key_id(&pk), epoch = header.epoch, "learned peer macro key");
            }
            PeerKeyUpdate::Changed => {
                info!(peer = %key_id(&pk), epoch = header.epoch, "peer macro key changed");
            }
            PeerKeyUpdate::Unchanged => {}
        }
        self.peer_macro_pk = Some(pk);
        update
    }

    fn stage_rotation(&self) -> Result<Staged<E>> {
        let peer = self
            .peer_macro_pk
            .as_ref()
            .ok_or(RatchetError::MissingPeerKey)?;
        let ratchet = self.ratchet.rotated(peer)?;
        let engine = E::from_root(ratchet.root_key(), &self.config)?;
        Ok(Staged {
            ratchet,
            engine,
            retired: vec![(self.ratchet.epoch(), *self.ratchet.public_key())],
        })
    }

    /// Replay the peer's rotations from our epoch up to the header's, one
    /// epoch at a time, on a copy of our ratchet.
    fn stage_catch_up(&self, header: &Header) -> Result<Staged<E>> {
        let local = self.ratchet.epoch();
        let gap = header.epoch - local;
        let limit = self.config.max_catch_up_epochs;
        if gap > limit {
            warn!(received = header.epoch, local, "epoch gap too large");
            return Err(RatchetError::CatchUpLimit { gap, limit });
        }

        let mut ratchet = if self.anchored {
            self.ratchet.clone()
        } else {
            let first = header
                .sender_key_at(local)
                .ok_or(RatchetError::MissingEpochKey(local))?;
            self.ratchet.anchored(&first)?
        };

        let mut retired = Vec::new();
        for epoch in local..header.epoch {
            let peer = header
                .sender_key_at(epoch)
                .or(if epoch == local { self.peer_macro_pk } else { None })
                .ok_or(RatchetError::MissingEpochKey(epoch))?;
            retired.push((epoch, *ratchet.public_key()));
            ratchet = ratchet.followed(&peer)?;
        }

        let engine = E::from_root(ratchet.root_key(), &self.config)?;
        Ok(Staged {
            ratchet,
            engine,
            retired,
        })
    }

    fn commit(&mut self, staged: Staged<E>) {
        let from = self.ratchet.epoch();
        self.ratchet = staged.ratchet;
        self.engine = staged.engine;
        let cap = usize::try_from(self.config.max_catch_up_epochs).unwrap_or(usize::MAX);
        for entry in staged.retired {
            self.epoch_keys.push_back(entry);
        }
        while self.epoch_keys.len() > cap {
            self.epoch_keys.pop_front();
        }
        if self.ratchet.epoch() != from {
            info!(
                from,
                to = self.ratchet.epoch(),
                macro_pk = %key_id(self.ratchet.public_key()),
                "macro ratchet advanced"
            );
        }
    }

    /// Our keys for the epochs the peer may still need to step through to
    /// reach `epoch`, oldest first. `pending` holds keys retired by a staged
    /// transition.
    fn trail(&self, epoch: u64, pending: &[(u64, PublicKey)]) -> Vec<PublicKey> {
        let floor = self
            .peer_epoch
            .max(epoch.saturating_sub(self.config.max_catch_up_epochs));
        self.epoch_keys
            .iter()
            .chain(pending)
            .filter(|(e, _)| (floor..epoch).contains(e))
            .map(|(_, pk)| *pk)
            .collect()
    }
}

fn seal<E: ChainEngine>(
    ratchet: &MacroRatchet,
    engine: &mut E,
    trail: Vec<PublicKey>,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut header = Header {
        epoch: ratchet.epoch(),
        macro_pk: Some(*ratchet.public_key()),
        trail,
        chain: ChainFields::new(),
    };
    let (ciphertext, fields) = engine.encrypt(plaintext, &header.associated_data())?;
    header.chain = fields;
    Ok((ciphertext, header.encode()?))
}

/// Two sessions that have exchanged macro keys, anchored without a shared
/// root key.
#[cfg(any(test, feature = "test-utils"))]
#[allow(clippy::expect_used)]
pub fn session_pair() -> (TripleSession, TripleSession) {
    let mut alice = TripleSession::new(None, None).expect("new session");
    let bob = TripleSession::new(None, Some(&alice.macro_pk())).expect("new session");
    alice
        .set_peer_macro_pk(&bob.macro_pk())
        .expect("valid peer key");
    (alice, bob)
}
