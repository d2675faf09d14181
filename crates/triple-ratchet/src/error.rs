//! Ratchet error types.

/// Result type alias using [`RatchetError`].
pub type Result<T> = std::result::Result<T, RatchetError>;

/// Errors from ratchet and session operations.
///
/// Every variant is a local, recoverable condition: a session that returned
/// one of these is left exactly as it was before the call.
#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    #[error("cannot rotate without peer's macro public key")]
    MissingPeerKey,

    #[error("session has no shared root key yet; set the peer's macro public key first")]
    NotAnchored,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("peer public key is a low-order point")]
    WeakPublicKey,

    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("message authentication failed")]
    AuthenticationFailed,

    #[error("message {counter} was already received or its key was discarded")]
    DuplicateMessage { counter: u64 },

    #[error("stale epoch: message from epoch {received}, local epoch is {local}")]
    StaleEpoch { received: u64, local: u64 },

    #[error("epoch gap of {gap} exceeds catch-up limit of {limit}")]
    CatchUpLimit { gap: u64, limit: u64 },

    #[error("no macro public key known for epoch {0}")]
    MissingEpochKey(u64),

    #[error("message counter {counter} would skip more than {limit} message keys")]
    SkipLimit { counter: u64, limit: usize },

    #[error("peer opened more than {limit} sending chains under one root key")]
    ChainLimit { limit: usize },

    #[error("counter exhausted; session must be re-established")]
    CounterExhausted,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of [`RatchetError`] for callers that only need to
/// decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required input is missing; supply it and retry.
    Precondition,
    /// Bytes at the boundary could not be parsed.
    Format,
    /// Ciphertext or header did not verify.
    Authentication,
    /// The message belongs to an epoch this party has already left.
    StaleEpoch,
    /// A configured or protocol bound was exceeded.
    Limit,
    /// Primitive failure or bad configuration.
    Internal,
}

impl RatchetError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingPeerKey | Self::NotAnchored => ErrorKind::Precondition,
            Self::InvalidKeyLength { .. }
            | Self::WeakPublicKey
            | Self::InvalidHex(_)
            | Self::MalformedHeader(_) => ErrorKind::Format,
            Self::AuthenticationFailed | Self::DuplicateMessage { .. } => {
                ErrorKind::Authentication
            }
            Self::StaleEpoch { .. } => ErrorKind::StaleEpoch,
            Self::CatchUpLimit { .. }
            | Self::MissingEpochKey(_)
            | Self::SkipLimit { .. }
            | Self::ChainLimit { .. }
            | Self::CounterExhausted => ErrorKind::Limit,
            Self::KeyDerivationFailed(_)
            | Self::EncryptionFailed(_)
            | Self::Config(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_peer_key_message_names_the_precondition() {
        let err = RatchetError::MissingPeerKey;
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(
            err.to_string(),
            "cannot rotate without peer's macro public key"
        );
    }

    #[test]
    fn stale_epoch_is_its_own_kind() {
        let err = RatchetError::StaleEpoch {
            received: 1,
            local: 3,
        };
        assert_eq!(err.kind(), ErrorKind::StaleEpoch);
        assert!(err.to_string().contains("epoch 1"));
    }

    #[test]
    fn hex_errors_convert_to_format_errors() {
        let err: RatchetError = hex::decode("zz").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
