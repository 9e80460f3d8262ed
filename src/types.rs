//! Core types for the event bus.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Content hash identifying an event in the store (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Publish order, assigned by the bus.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Encoding used for event payloads at rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl PayloadEncoding {
    pub(crate) fn tag(self) -> u8 {
        match self {
            PayloadEncoding::Json => 0,
            PayloadEncoding::MessagePack => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PayloadEncoding::Json),
            1 => Some(PayloadEncoding::MessagePack),
            _ => None,
        }
    }
}

/// An opaque structured message published to the bus.
///
/// Plain text events are carried as JSON strings, so filters see one
/// uniform document model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(serde_json::Value);

impl Event {
    /// A plain string event.
    pub fn text(value: impl Into<String>) -> Self {
        Event(serde_json::Value::String(value.into()))
    }

    /// A structured event.
    pub fn json(value: serde_json::Value) -> Self {
        Event(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Content-derived store key.
    ///
    /// serde_json keeps object keys sorted, so equal documents hash equally
    /// regardless of the field order they were published with.
    pub fn key(&self) -> crate::Result<Hash> {
        let canonical = serde_json::to_vec(&self.0)?;
        Ok(Hash::from_bytes(&canonical))
    }

    /// Render for a text event stream: strings go out raw, everything else
    /// as compact JSON.
    pub fn render(&self) -> crate::Result<String> {
        match &self.0 {
            serde_json::Value::String(s) => Ok(s.clone()),
            other => Ok(serde_json::to_string(other)?),
        }
    }
}

impl From<serde_json::Value> for Event {
    fn from(value: serde_json::Value) -> Self {
        Event(value)
    }
}

impl From<&str> for Event {
    fn from(value: &str) -> Self {
        Event::text(value)
    }
}

/// A single entry handed to an event store.
#[derive(Clone, Debug)]
pub struct StoreEntry {
    pub key: Hash,
    pub sequence: Sequence,
    pub event: Event,
}
