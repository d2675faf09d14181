//! Wire header codec.
//!
//! A header is a single CBOR map of field name to value. The macro layer owns
//! three names:
//!
//! | field      | CBOR type            | meaning                                   |
//! |------------|----------------------|-------------------------------------------|
//! | `epoch`    | unsigned integer     | sender's macro epoch at encryption time   |
//! | `macro_pk` | 32-byte byte string  | sender's current epoch public key         |
//! | `trail`    | array of byte strings| sender's keys for the epochs just before  |
//!
//! Every other entry belongs to the chain engine and is carried verbatim.

use ciborium::value::Value;
use x25519_dalek::PublicKey;

use crate::error::{RatchetError, Result};
use crate::keys::public_key_from_bytes;

const EPOCH: &str = "epoch";
const MACRO_PK: &str = "macro_pk";
const TRAIL: &str = "trail";

/// Field names the chain engine may not use.
pub const RESERVED_FIELDS: [&str; 3] = [EPOCH, MACRO_PK, TRAIL];

/// Prefix of the associated data bound into every message.
const AD_LABEL: &[u8] = b"triple-ratchet-v1";

fn malformed(msg: impl Into<String>) -> RatchetError {
    RatchetError::MalformedHeader(msg.into())
}

/// Header fields produced and consumed by a chain engine.
///
/// Opaque to the macro layer; order of insertion is preserved on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainFields(Vec<(String, Value)>);

impl ChainFields {
    /// An empty field set.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Set `name` to `value`, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.0.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    /// Look up a raw field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Look up a byte-string field.
    pub fn bytes(&self, name: &str) -> Result<&[u8]> {
        self.get(name)
            .ok_or_else(|| malformed(format!("missing {name}")))?
            .as_bytes()
            .map(Vec::as_slice)
            .ok_or_else(|| malformed(format!("{name} is not a byte string")))
    }

    /// Look up an unsigned integer field.
    pub fn uint(&self, name: &str) -> Result<u64> {
        let value = self
            .get(name)
            .ok_or_else(|| malformed(format!("missing {name}")))?;
        as_u64(value, name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }
}

fn as_u64(value: &Value, name: &str) -> Result<u64> {
    let int = value
        .as_integer()
        .ok_or_else(|| malformed(format!("{name} is not an integer")))?;
    u64::try_from(int).map_err(|_| malformed(format!("{name} is out of range")))
}

fn as_public_key(value: &Value, name: &str) -> Result<PublicKey> {
    let bytes = value
        .as_bytes()
        .ok_or_else(|| malformed(format!("{name} is not a byte string")))?;
    public_key_from_bytes(bytes)
}

/// A decoded message header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Sender's epoch when the message was encrypted.
    pub epoch: u64,
    /// Sender's epoch public key. Always present on headers this crate
    /// produces; only required on receipt when the receiver must catch up.
    pub macro_pk: Option<PublicKey>,
    /// Sender's public keys for epochs `epoch - trail.len()` up to
    /// `epoch - 1`, oldest first.
    pub trail: Vec<PublicKey>,
    /// Chain engine fields.
    pub chain: ChainFields,
}

impl Header {
    /// Serialize to a CBOR map.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = Vec::with_capacity(self.chain.len() + RESERVED_FIELDS.len());
        map.push((Value::Text(EPOCH.into()), Value::Integer(self.epoch.into())));
        if let Some(pk) = &self.macro_pk {
            map.push((
                Value::Text(MACRO_PK.into()),
                Value::Bytes(pk.as_bytes().to_vec()),
            ));
        }
        if !self.trail.is_empty() {
            let keys = self
                .trail
                .iter()
                .map(|pk| Value::Bytes(pk.as_bytes().to_vec()))
                .collect();
            map.push((Value::Text(TRAIL.into()), Value::Array(keys)));
        }
        for (name, value) in self.chain.iter() {
            if RESERVED_FIELDS.contains(&name) {
                return Err(malformed(format!(
                    "chain field {name} collides with a macro field"
                )));
            }
            map.push((Value::Text(name.to_owned()), value.clone()));
        }

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Value::Map(map), &mut buf)
            .map_err(|e| malformed(format!("encoding failed: {e}")))?;
        Ok(buf)
    }

    /// Parse a CBOR header, rejecting anything but a single well-formed map.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let value: Value = ciborium::de::from_reader(&mut reader)
            .map_err(|e| malformed(format!("not valid CBOR: {e}")))?;
        if !reader.is_empty() {
            return Err(malformed(format!(
                "{} trailing bytes after header",
                reader.len()
            )));
        }
        let Value::Map(entries) = value else {
            return Err(malformed("header is not a map"));
        };

        let mut epoch = None;
        let mut macro_pk = None;
        let mut trail = None;
        let mut chain = ChainFields::new();

        for (key, value) in entries {
            let Value::Text(name) = key else {
                return Err(malformed("field names must be text"));
            };
            let duplicate = match name.as_str() {
                EPOCH => epoch.replace(as_u64(&value, EPOCH)?).is_some(),
                MACRO_PK => macro_pk
                    .replace(as_public_key(&value, MACRO_PK)?)
                    .is_some(),
                TRAIL => {
                    let items = value
                        .as_array()
                        .ok_or_else(|| malformed("trail is not an array"))?;
                    let keys = items
                        .iter()
                        .map(|item| as_public_key(item, TRAIL))
                        .collect::<Result<Vec<_>>>()?;
                    trail.replace(keys).is_some()
                }
                _ => {
                    let seen = chain.get(&name).is_some();
                    chain.insert(name.clone(), value);
                    seen
                }
            };
            if duplicate {
                return Err(malformed(format!("duplicate field {name}")));
            }
        }

        let epoch = epoch.ok_or_else(|| malformed("missing epoch"))?;
        let trail = trail.unwrap_or_default();
        if trail.len() as u64 > epoch {
            return Err(malformed("trail reaches before epoch 0"));
        }

        Ok(Self {
            epoch,
            macro_pk,
            trail,
            chain,
        })
    }

    /// The sender's public key while it was at `epoch`, if this header
    /// carries it.
    pub fn sender_key_at(&self, epoch: u64) -> Option<PublicKey> {
        if epoch == self.epoch {
            return self.macro_pk;
        }
        let back = self.epoch.checked_sub(epoch)?;
        let index = (self.trail.len() as u64).checked_sub(back)?;
        self.trail.get(usize::try_from(index).ok()?).copied()
    }

    /// Associated data binding the macro fields to the ciphertext.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut ad = Vec::with_capacity(AD_LABEL.len() + 8 + 32);
        ad.extend_from_slice(AD_LABEL);
        ad.extend_from_slice(&self.epoch.to_be_bytes());
        if let Some(pk) = &self.macro_pk {
            ad.extend_from_slice(pk.as_bytes());
        }
        ad
    }
}
