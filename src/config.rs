//! Bus configuration with validation.
//!
//! Defaults match a small single-node deployment: a local store of 100
//! events that expire 10 seconds after last access.

use crate::error::{BusError, Result};
use crate::store::{EventStore, ExpiryPolicy, InMemoryKv, KvClient, LocalStore, RemoteStore};
use crate::types::PayloadEncoding;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DATABUS_";

/// Which event store backs the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Bounded in-process cache.
    #[default]
    Local,
    /// TTL key-value service.
    Remote,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StoreBackend::Local),
            "remote" => Ok(StoreBackend::Remote),
            other => Err(format!("unknown backend {other:?} (expected local or remote)")),
        }
    }
}

/// What restarts a local entry's expiry clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryMode {
    AfterWrite,
    #[default]
    AfterAccess,
}

impl FromStr for ExpiryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "after_write" => Ok(ExpiryMode::AfterWrite),
            "after_access" => Ok(ExpiryMode::AfterAccess),
            other => Err(format!(
                "unknown expiry mode {other:?} (expected after_write or after_access)"
            )),
        }
    }
}

impl FromStr for PayloadEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(PayloadEncoding::Json),
            "msgpack" | "message_pack" => Ok(PayloadEncoding::MessagePack),
            other => Err(format!("unknown encoding {other:?} (expected json or msgpack)")),
        }
    }
}

/// Main bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address the HTTP server listens on.
    pub bind_addr: SocketAddr,
    pub backend: StoreBackend,
    /// Maximum events kept by the local store. The remote backend is bounded
    /// by `ttl` alone and ignores this.
    pub capacity: usize,
    /// Event time-to-live.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    /// Local store only; the remote backend always expires after write.
    pub expiry: ExpiryMode,
    /// A stream with no events for this long is closed.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Events buffered per subscriber before it counts as too slow.
    pub subscriber_buffer: usize,
    /// Remote store only.
    pub encoding: PayloadEncoding,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            backend: StoreBackend::Local,
            capacity: 100,
            ttl: Duration::from_millis(10_000),
            expiry: ExpiryMode::AfterAccess,
            idle_timeout: Duration::from_millis(1_000_000),
            subscriber_buffer: 1000,
            encoding: PayloadEncoding::Json,
        }
    }
}

impl BusConfig {
    /// Defaults overlaid with `DATABUS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `DATABUS_*` name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_from(&lookup, "BIND_ADDR", &mut config.bind_addr)?;
        override_from(&lookup, "BACKEND", &mut config.backend)?;
        override_from(&lookup, "CAPACITY", &mut config.capacity)?;
        override_from(&lookup, "EXPIRY", &mut config.expiry)?;
        override_from(&lookup, "SUBSCRIBER_BUFFER", &mut config.subscriber_buffer)?;
        override_from(&lookup, "ENCODING", &mut config.encoding)?;

        let mut ttl_ms = config.ttl.as_millis() as u64;
        override_from(&lookup, "TTL_MS", &mut ttl_ms)?;
        config.ttl = Duration::from_millis(ttl_ms);

        let mut idle_ms = config.idle_timeout.as_millis() as u64;
        override_from(&lookup, "IDLE_TIMEOUT_MS", &mut idle_ms)?;
        config.idle_timeout = Duration::from_millis(idle_ms);

        let capacity_set = lookup(&format!("{ENV_PREFIX}CAPACITY")).is_some();
        if config.backend == StoreBackend::Remote && capacity_set {
            warn!("{ENV_PREFIX}CAPACITY has no effect on the remote backend");
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BusError::Config("capacity cannot be 0".into()));
        }
        if self.ttl.is_zero() {
            return Err(BusError::Config("ttl cannot be 0".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(BusError::Config("idle_timeout cannot be 0".into()));
        }
        if self.subscriber_buffer == 0 {
            return Err(BusError::Config("subscriber_buffer cannot be 0".into()));
        }
        Ok(())
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        match self.expiry {
            ExpiryMode::AfterWrite => ExpiryPolicy::AfterWrite(self.ttl),
            ExpiryMode::AfterAccess => ExpiryPolicy::AfterAccess(self.ttl),
        }
    }

    /// Build the configured store. The remote backend gets an in-process
    /// key-value client; use [`BusConfig::build_remote_store`] to plug in a
    /// real one.
    pub fn build_store(&self) -> Arc<dyn EventStore> {
        match self.backend {
            StoreBackend::Local => Arc::new(LocalStore::new(self.capacity, self.expiry_policy())),
            StoreBackend::Remote => self.build_remote_store(InMemoryKv::new()),
        }
    }

    pub fn build_remote_store<C: KvClient + 'static>(&self, client: C) -> Arc<dyn EventStore> {
        Arc::new(RemoteStore::new(client, self.ttl, self.encoding))
    }
}

fn override_from<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    if let Some(raw) = lookup(&key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| BusError::Config(format!("{key}: {e}")))?;
    }
    Ok(())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity, 100);
        assert_eq!(config.ttl, Duration::from_secs(10));
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(
            config.expiry_policy(),
            ExpiryPolicy::AfterAccess(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = BusConfig::from_lookup(lookup(&[
            ("DATABUS_BACKEND", "remote"),
            ("DATABUS_CAPACITY", "5"),
            ("DATABUS_TTL_MS", "250"),
            ("DATABUS_EXPIRY", "after-write"),
            ("DATABUS_ENCODING", "msgpack"),
            ("DATABUS_BIND_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();

        assert_eq!(config.backend, StoreBackend::Remote);
        assert_eq!(config.capacity, 5);
        assert_eq!(config.ttl, Duration::from_millis(250));
        assert_eq!(config.expiry, ExpiryMode::AfterWrite);
        assert_eq!(config.encoding, PayloadEncoding::MessagePack);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.build_store().stats().backend, "remote");
    }

    #[test]
    fn test_remote_backend_not_bounded_by_capacity() {
        let config = BusConfig::from_lookup(lookup(&[
            ("DATABUS_BACKEND", "remote"),
            ("DATABUS_CAPACITY", "2"),
        ]))
        .unwrap();
        let store = config.build_store();

        for i in 0..5u64 {
            let event = crate::types::Event::text(format!("e{i}"));
            store
                .put(crate::types::StoreEntry {
                    key: event.key().unwrap(),
                    sequence: crate::types::Sequence(i + 1),
                    event,
                })
                .unwrap();
        }
        assert_eq!(store.values().unwrap().len(), 5);
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = BusConfig::from_lookup(lookup(&[("DATABUS_CAPACITY", "lots")])).unwrap_err();
        assert!(matches!(err, BusError::Config(msg) if msg.contains("DATABUS_CAPACITY")));

        let err = BusConfig::from_lookup(lookup(&[("DATABUS_BACKEND", "redis")])).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));

        let err = BusConfig::from_lookup(lookup(&[("DATABUS_TTL_MS", "0")])).unwrap_err();
        assert!(matches!(err, BusError::Config(msg) if msg.contains("ttl")));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: BusConfig =
            serde_json::from_str(r#"{"backend": "remote", "ttl": 500}"#).unwrap();
        assert_eq!(config.backend, StoreBackend::Remote);
        assert_eq!(config.ttl, Duration::from_millis(500));
        assert_eq!(config.capacity, 100);
    }
}
