//! The bus coordinator: publish and subscribe over a store and a registry.

use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::filter::FilterQuery;
use crate::store::{EventStore, ExpiryPolicy, LocalStore, StoreStats};
use crate::subscriptions::{
    ConnectionState, Delivery, EventSink, SubscriberId, SubscriberRegistry,
};
use crate::types::{Event, Hash, Sequence, StoreEntry, Timestamp};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one published event.
#[derive(Debug)]
pub struct PublishReceipt {
    /// Content key, if the event could be rendered to compute one.
    pub key: Option<Hash>,
    pub sequence: Sequence,
    pub published_at: Timestamp,
    /// Subscribers the event (or a projection of it) was pushed to.
    pub delivered: usize,
    /// Subscribers removed because their push failed.
    pub removed: usize,
    /// Set when the store write failed; fan-out still happened.
    pub store_error: Option<BusError>,
}

impl PublishReceipt {
    pub fn stored(&self) -> bool {
        self.store_error.is_none()
    }
}

/// Bus-wide counters.
#[derive(Clone, Debug, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub store: StoreStats,
}

/// Live registration of one subscriber.
///
/// Dropping the handle unregisters the subscriber, whatever ended the
/// connection. Unregistering twice is harmless, so a failed push racing
/// with the drop is fine.
pub struct Subscription {
    id: SubscriberId,
    registry: Arc<SubscriberRegistry>,
    replayed: usize,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Events sent during the initial replay.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    pub fn state(&self) -> ConnectionState {
        self.registry
            .get(self.id)
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    /// Unregister now rather than at drop.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Publishes events into the store and fans them out to subscribers.
pub struct EventBus {
    store: Arc<dyn EventStore>,

    registry: Arc<SubscriberRegistry>,

    /// Held shared by publishers around "store write + registry snapshot"
    /// and exclusively by subscribers around "register + store read", so an
    /// event is either in a new subscriber's replay or in its live feed,
    /// never both and never neither. Fan-out happens outside the gate.
    gate: RwLock<()>,

    next_sequence: AtomicU64,
}

impl EventBus {
    /// Create a bus over any store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            registry: Arc::new(SubscriberRegistry::new()),
            gate: RwLock::new(()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Create a bus over a bounded local store.
    pub fn local(capacity: usize, policy: ExpiryPolicy) -> Self {
        Self::new(Arc::new(LocalStore::new(capacity, policy)))
    }

    /// Create a bus with the store backend selected by `config`.
    pub fn from_config(config: &BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.build_store()))
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Store an event and push it to every subscriber whose filter matches.
    ///
    /// A failing store write is reported in the receipt, not as an error:
    /// subscribers that are connected right now still get the event.
    pub fn publish(&self, event: Event) -> PublishReceipt {
        let published_at = Timestamp::now();
        let (sequence, key, store_error, subscribers) = {
            let _gate = self.gate.read();
            let sequence = Sequence(self.next_sequence.fetch_add(1, Ordering::SeqCst));

            let (key, store_error) = match event.key() {
                Ok(key) => {
                    let entry = StoreEntry {
                        key,
                        sequence,
                        event: event.clone(),
                    };
                    (Some(key), self.store.put(entry).err())
                }
                Err(e) => (None, Some(e)),
            };

            (sequence, key, store_error, self.registry.snapshot())
        };

        if let Some(e) = &store_error {
            warn!(%sequence, error = %e, "Event not stored; delivering to live subscribers only");
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for subscriber in &subscribers {
            match subscriber.offer(&event) {
                Delivery::Delivered(n) if n > 0 => delivered += 1,
                Delivery::Failed(e) => {
                    warn!(subscriber_id = %subscriber.id(), error = %e, "Push failed; closing subscriber");
                    failed.push(subscriber.id());
                }
                _ => {}
            }
        }

        // Remove failed subscribers
        let removed = failed
            .into_iter()
            .filter(|id| self.registry.unregister(*id))
            .count();

        debug!(%sequence, delivered, removed, "Published event");

        PublishReceipt {
            key,
            sequence,
            published_at,
            delivered,
            removed,
            store_error,
        }
    }

    /// Open a subscription: replay the matching live events, then stream
    /// every matching event published from here on.
    ///
    /// An invalid query fails before anything is registered. A connection
    /// that is already gone fails with [`BusError::SubscriberClosed`] and
    /// leaves nothing registered.
    pub fn subscribe(&self, query: &str, sink: Arc<dyn EventSink>) -> Result<Subscription> {
        let query = FilterQuery::parse(query)?;

        let (subscriber, snapshot) = {
            let _gate = self.gate.write();

            let subscriber = self.registry.insert(sink, query);
            let snapshot = match self.store.values() {
                Ok(values) => values,
                Err(e) => {
                    warn!(subscriber_id = %subscriber.id(), error = %e, "Store unavailable; skipping replay");
                    Vec::new()
                }
            };

            (subscriber, snapshot)
        };

        let mut subscription = Subscription {
            id: subscriber.id(),
            registry: Arc::clone(&self.registry),
            replayed: 0,
        };

        let replay = subscriber.query().apply(&snapshot);
        subscription.replayed = subscriber.replay(&replay).map_err(|e| {
            debug!(subscriber_id = %subscriber.id(), error = %e, "Connection lost during replay");
            BusError::SubscriberClosed
        })?;

        subscriber.go_live().map_err(|e| {
            debug!(subscriber_id = %subscriber.id(), error = %e, "Connection lost before streaming");
            BusError::SubscriberClosed
        })?;

        debug!(
            subscriber_id = %subscriber.id(),
            replayed = subscription.replayed,
            "Subscriber streaming"
        );

        Ok(subscription)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.registry.len(),
            published: self.next_sequence.load(Ordering::SeqCst) - 1,
            store: self.store.stats(),
        }
    }
}
