//! Bounded in-process event store.

use super::{EventStore, Eviction, EvictionCause, ExpiryPolicy, StoreStats};
use crate::error::Result;
use crate::types::{Event, Hash, Sequence, StoreEntry};
use crossbeam_channel::Sender;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Cached event plus the clocks the expiry policy reads.
#[derive(Clone)]
struct CachedEvent {
    sequence: Sequence,
    event: Event,
    written: Instant,
    accessed: Instant,
}

/// LRU-bounded store with a TTL.
///
/// Expired entries are purged lazily on every operation, so a read never
/// returns them even if nothing has touched the store for a while.
pub struct LocalStore {
    /// Entries by content key, least recently used first out.
    cache: Mutex<LruCache<Hash, CachedEvent>>,

    policy: ExpiryPolicy,

    evicted_capacity: AtomicU64,
    evicted_expired: AtomicU64,

    /// Optional eviction listener (best effort, never blocks).
    listener: Option<Sender<Eviction>>,
}

impl LocalStore {
    /// Create a store holding at most `capacity` entries.
    pub fn new(capacity: usize, policy: ExpiryPolicy) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            policy,
            evicted_capacity: AtomicU64::new(0),
            evicted_expired: AtomicU64::new(0),
            listener: None,
        }
    }

    /// Report evictions on `listener`.
    pub fn with_eviction_listener(mut self, listener: Sender<Eviction>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    fn is_expired(&self, entry: &CachedEvent, now: Instant) -> bool {
        match self.policy {
            ExpiryPolicy::AfterWrite(ttl) => now.saturating_duration_since(entry.written) >= ttl,
            ExpiryPolicy::AfterAccess(ttl) => now.saturating_duration_since(entry.accessed) >= ttl,
        }
    }

    fn purge_expired(&self, cache: &mut LruCache<Hash, CachedEvent>, now: Instant) {
        let expired: Vec<Hash> = cache
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            cache.pop(&key);
            self.record_eviction(key, EvictionCause::Expired);
        }
    }

    fn record_eviction(&self, key: Hash, cause: EvictionCause) {
        match cause {
            EvictionCause::Capacity => self.evicted_capacity.fetch_add(1, Ordering::Relaxed),
            EvictionCause::Expired => self.evicted_expired.fetch_add(1, Ordering::Relaxed),
        };
        debug!(%key, ?cause, "Evicted event");

        if let Some(listener) = &self.listener {
            let _ = listener.try_send(Eviction { key, cause });
        }
    }
}

impl EventStore for LocalStore {
    fn put(&self, entry: StoreEntry) -> Result<()> {
        let now = Instant::now();
        let mut cache = self.cache.lock();

        // Expired entries go first so they never push out live ones.
        self.purge_expired(&mut cache, now);

        let cached = CachedEvent {
            sequence: entry.sequence,
            event: entry.event,
            written: now,
            accessed: now,
        };

        // `push` hands back either the replaced value for the same key or
        // the least recently used entry it had to drop.
        if let Some((evicted, _)) = cache.push(entry.key, cached) {
            if evicted != entry.key {
                self.record_eviction(evicted, EvictionCause::Capacity);
            }
        }

        Ok(())
    }

    fn get(&self, key: &Hash) -> Result<Option<Event>> {
        let now = Instant::now();
        let mut cache = self.cache.lock();

        let expired = match cache.peek(key) {
            Some(entry) => self.is_expired(entry, now),
            None => return Ok(None),
        };
        if expired {
            cache.pop(key);
            self.record_eviction(*key, EvictionCause::Expired);
            return Ok(None);
        }

        Ok(cache.get_mut(key).map(|entry| {
            entry.accessed = now;
            entry.event.clone()
        }))
    }

    fn values(&self) -> Result<Vec<Event>> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        self.purge_expired(&mut cache, now);

        // LRU order is access order; insertion order comes from the sequence.
        let mut live: Vec<(Sequence, Event)> = cache
            .iter()
            .map(|(_, entry)| (entry.sequence, entry.event.clone()))
            .collect();
        live.sort_by_key(|(sequence, _)| *sequence);

        Ok(live.into_iter().map(|(_, event)| event).collect())
    }

    fn stats(&self) -> StoreStats {
        let mut cache = self.cache.lock();
        self.purge_expired(&mut cache, Instant::now());

        StoreStats {
            backend: "local",
            entries: cache.len(),
            evicted_capacity: self.evicted_capacity.load(Ordering::Relaxed),
            evicted_expired: self.evicted_expired.load(Ordering::Relaxed),
        }
    }
}
