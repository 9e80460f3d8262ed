//! Expiring event storage.
//!
//! Two backends sit behind [`EventStore`]:
//! - [`LocalStore`]: bounded in-process LRU with a TTL
//! - [`RemoteStore`]: a TTL key-value service reached through [`KvClient`]
//!
//! Which one the bus uses is decided by configuration only; the bus never
//! branches on the backend.

mod local;
mod memory_kv;
mod remote;

pub use local::LocalStore;
pub use memory_kv::InMemoryKv;
pub use remote::{KvClient, KvError, RemoteStore};

use crate::error::Result;
use crate::types::{Event, Hash, StoreEntry};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the expiry clock of an entry restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// TTL counted from the last `put`.
    AfterWrite(Duration),
    /// TTL counted from the last `put` or `get`.
    AfterAccess(Duration),
}

impl ExpiryPolicy {
    pub fn ttl(&self) -> Duration {
        match self {
            ExpiryPolicy::AfterWrite(ttl) | ExpiryPolicy::AfterAccess(ttl) => *ttl,
        }
    }
}

/// Why an entry left the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionCause {
    Capacity,
    Expired,
}

/// Eviction notice sent to an optional listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eviction {
    pub key: Hash,
    pub cause: EvictionCause,
}

/// Counters reported by a store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub entries: usize,
    pub evicted_capacity: u64,
    pub evicted_expired: u64,
}

/// Key/event mapping with expiry.
///
/// Implementations do their own synchronization; every method takes `&self`
/// and may be called from any number of threads.
pub trait EventStore: Send + Sync {
    /// Insert or replace the entry for `entry.key`, restarting its expiry clock.
    fn put(&self, entry: StoreEntry) -> Result<()>;

    /// Look up a live entry.
    fn get(&self, key: &Hash) -> Result<Option<Event>>;

    /// Live events in insertion order. Expired entries never appear.
    fn values(&self) -> Result<Vec<Event>>;

    fn stats(&self) -> StoreStats;
}
