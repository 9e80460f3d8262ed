//! Event store backed by a TTL key-value service.
//!
//! Each event is written as a self-checking frame:
//!
//! ```text
//! magic "EVT\0" | version u8 | encoding u8 | sequence u64 | len u32 | payload | crc32
//! ```
//!
//! Integers are little endian. The sequence travels with the payload so
//! `values()` can restore insertion order from a backend that has none.

use super::{EventStore, StoreStats};
use crate::error::{BusError, Result};
use crate::types::{Event, Hash, PayloadEncoding, Sequence, StoreEntry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Magic bytes for event frames.
const FRAME_MAGIC: &[u8; 4] = b"EVT\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// magic + version + encoding + sequence + payload length.
const HEADER_LEN: usize = 4 + 1 + 1 + 8 + 4;

/// Key prefix separating bus entries from anything else in the keyspace.
const KEY_PREFIX: &str = "events:";

/// Failure talking to the key-value service.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("operation timed out")]
    Timeout,
}

/// Minimal client surface of a TTL key-value service.
pub trait KvClient: Send + Sync {
    /// Store `value` under `key`, expiring `ttl` after this write.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> std::result::Result<(), KvError>;

    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, KvError>;

    /// All live entries whose key starts with `prefix`.
    fn scan(&self, prefix: &str) -> std::result::Result<Vec<(String, Vec<u8>)>, KvError>;
}

impl<C: KvClient + ?Sized> KvClient for Arc<C> {
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> std::result::Result<(), KvError> {
        (**self).set(key, value, ttl)
    }

    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, KvError> {
        (**self).get(key)
    }

    fn scan(&self, prefix: &str) -> std::result::Result<Vec<(String, Vec<u8>)>, KvError> {
        (**self).scan(prefix)
    }
}

impl From<KvError> for BusError {
    fn from(e: KvError) -> Self {
        BusError::StoreUnavailable(e.to_string())
    }
}

/// [`EventStore`] over any [`KvClient`]. Entries expire a fixed TTL after
/// their last write; the service owns expiry.
pub struct RemoteStore<C> {
    client: C,
    ttl: Duration,
    encoding: PayloadEncoding,
    /// Frames skipped because they could not be decoded.
    skipped_frames: AtomicU64,
}

impl<C: KvClient> RemoteStore<C> {
    pub fn new(client: C, ttl: Duration, encoding: PayloadEncoding) -> Self {
        Self {
            client,
            ttl,
            encoding,
            skipped_frames: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Number of stored frames that failed to decode so far.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames.load(Ordering::Relaxed)
    }

    fn storage_key(key: &Hash) -> String {
        format!("{}{}", KEY_PREFIX, key.to_hex())
    }

    fn decode_logged(&self, key: &str, frame: &[u8]) -> Option<(Sequence, Event)> {
        match decode_frame(frame) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                self.skipped_frames.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "Skipping undecodable stored event");
                None
            }
        }
    }
}

impl<C: KvClient> EventStore for RemoteStore<C> {
    fn put(&self, entry: StoreEntry) -> Result<()> {
        let frame = encode_frame(entry.sequence, &entry.event, self.encoding)?;
        self.client
            .set(&Self::storage_key(&entry.key), frame, self.ttl)?;
        Ok(())
    }

    fn get(&self, key: &Hash) -> Result<Option<Event>> {
        let storage_key = Self::storage_key(key);
        let Some(frame) = self.client.get(&storage_key)? else {
            return Ok(None);
        };
        Ok(self
            .decode_logged(&storage_key, &frame)
            .map(|(_, event)| event))
    }

    fn values(&self) -> Result<Vec<Event>> {
        let mut live: Vec<(Sequence, Event)> = self
            .client
            .scan(KEY_PREFIX)?
            .into_iter()
            .filter_map(|(key, frame)| self.decode_logged(&key, &frame))
            .collect();
        live.sort_by_key(|(sequence, _)| *sequence);

        Ok(live.into_iter().map(|(_, event)| event).collect())
    }

    fn stats(&self) -> StoreStats {
        let entries = match self.client.scan(KEY_PREFIX) {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!(error = %e, "Could not count remote entries");
                0
            }
        };

        StoreStats {
            backend: "remote",
            entries,
            evicted_capacity: 0,
            evicted_expired: 0,
        }
    }
}

/// Encode an event into a frame.
pub(crate) fn encode_frame(
    sequence: Sequence,
    event: &Event,
    encoding: PayloadEncoding,
) -> Result<Vec<u8>> {
    let payload = match encoding {
        PayloadEncoding::Json => serde_json::to_vec(event.as_value())?,
        PayloadEncoding::MessagePack => rmp_serde::to_vec(event.as_value())?,
    };
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| BusError::Serialization(format!("event too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.push(encoding.tag());
    frame.extend_from_slice(&sequence.0.to_le_bytes());
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    Ok(frame)
}

/// Decode and verify a frame.
pub(crate) fn decode_frame(frame: &[u8]) -> Result<(Sequence, Event)> {
    if frame.len() < HEADER_LEN + 4 {
        return Err(BusError::InvalidFormat(format!(
            "Frame too short: {} bytes",
            frame.len()
        )));
    }

    if &frame[0..4] != FRAME_MAGIC {
        return Err(BusError::InvalidFormat("Invalid frame magic".into()));
    }

    if frame[4] != FRAME_VERSION {
        return Err(BusError::InvalidFormat(format!(
            "Unsupported frame version: {}",
            frame[4]
        )));
    }

    let encoding = PayloadEncoding::from_tag(frame[5])
        .ok_or_else(|| BusError::InvalidFormat(format!("Unknown encoding tag: {}", frame[5])))?;

    let mut sequence_bytes = [0u8; 8];
    sequence_bytes.copy_from_slice(&frame[6..14]);
    let sequence = Sequence(u64::from_le_bytes(sequence_bytes));

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&frame[14..18]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;

    if frame.len() != HEADER_LEN + payload_len + 4 {
        return Err(BusError::Corruption(format!(
            "Frame length {} does not match payload length {}",
            frame.len(),
            payload_len
        )));
    }

    let payload = &frame[HEADER_LEN..HEADER_LEN + payload_len];

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&frame[HEADER_LEN + payload_len..]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(payload);
    if stored_checksum != computed_checksum {
        return Err(BusError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let value: serde_json::Value = match encoding {
        PayloadEncoding::Json => serde_json::from_slice(payload)
            .map_err(|e| BusError::Deserialization(e.to_string()))?,
        PayloadEncoding::MessagePack => rmp_serde::from_slice(payload)?,
    };

    Ok((sequence, Event::json(value)))
}
