//! In-process [`KvClient`] with per-key TTLs.

use super::remote::{KvClient, KvError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct KvEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Shared TTL map. Clones share the same keyspace, the way several bus
/// instances would share one external cache.
#[derive(Clone, Default)]
pub struct InMemoryKv {
    entries: Arc<RwLock<HashMap<String, KvEntry>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

impl KvClient for InMemoryKv {
    fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.purge_expired();
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ttl_expiry() {
        let kv = InMemoryKv::new();
        kv.set("a", b"1".to_vec(), Duration::from_millis(50)).unwrap();
        kv.set("b", b"2".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(kv.get("a").unwrap(), Some(b"1".to_vec()));

        thread::sleep(Duration::from_millis(100));

        assert_eq!(kv.get("a").unwrap(), None);
        assert_eq!(kv.scan("").unwrap().len(), 1);
    }

    #[test]
    fn test_set_restarts_ttl() {
        let kv = InMemoryKv::new();
        kv.set("a", b"1".to_vec(), Duration::from_millis(80)).unwrap();
        thread::sleep(Duration::from_millis(50));
        kv.set("a", b"2".to_vec(), Duration::from_millis(80)).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(kv.get("a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_clones_share_keyspace() {
        let kv = InMemoryKv::new();
        let other = kv.clone();
        kv.set("shared", b"x".to_vec(), Duration::from_secs(60)).unwrap();
        assert_eq!(other.get("shared").unwrap(), Some(b"x".to_vec()));
    }
}
