//! Registry of live subscribers.

use crate::error::SinkError;
use crate::filter::FilterQuery;
use crate::types::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{ConnectionState, EventSink, SubscriberId};

/// Internal lifecycle, with the matches held back while connecting.
enum Phase {
    Connecting { pending: Vec<Event> },
    Streaming,
    Closed,
}

/// Outcome of offering one published event to a subscriber.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Filtered out, or the subscriber is already closed.
    Skipped,
    /// Held back until replay finishes.
    Buffered(usize),
    Delivered(usize),
    /// The subscriber was closed by this push.
    Failed(SinkError),
}

/// One registered subscriber.
pub struct Subscriber {
    id: SubscriberId,
    query: FilterQuery,
    sink: Arc<dyn EventSink>,
    /// Serializes pushes so each subscriber sees publishes whole and in order.
    phase: Mutex<Phase>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn query(&self) -> &FilterQuery {
        &self.query
    }

    pub fn state(&self) -> ConnectionState {
        match *self.phase.lock() {
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Streaming => ConnectionState::Streaming,
            Phase::Closed => ConnectionState::Closed,
        }
    }

    /// Filter a freshly published event and push or hold back the matches.
    pub(crate) fn offer(&self, event: &Event) -> Delivery {
        let matches = self.query.apply(std::slice::from_ref(event));
        if matches.is_empty() {
            return Delivery::Skipped;
        }

        let mut phase = self.phase.lock();
        let pushed = match &mut *phase {
            Phase::Closed => return Delivery::Skipped,
            Phase::Connecting { pending } => {
                let count = matches.len();
                pending.extend(matches);
                return Delivery::Buffered(count);
            }
            Phase::Streaming => self.push_all(&matches),
        };

        match pushed {
            Ok(delivered) => Delivery::Delivered(delivered),
            Err(e) => {
                *phase = Phase::Closed;
                Delivery::Failed(e)
            }
        }
    }

    /// Push the initial replay. Per-event failures are skipped; only a
    /// disconnected peer stops the replay.
    pub(crate) fn replay(&self, events: &[Event]) -> Result<usize, SinkError> {
        let sent = self.sink.replay(events)?;
        if sent < events.len() {
            warn!(
                subscriber_id = %self.id,
                dropped = events.len() - sent,
                "Replay events dropped"
            );
        }
        Ok(sent)
    }

    /// Flush whatever arrived during replay and start streaming.
    pub(crate) fn go_live(&self) -> Result<usize, SinkError> {
        let mut phase = self.phase.lock();
        let pending = match std::mem::replace(&mut *phase, Phase::Streaming) {
            Phase::Connecting { pending } => pending,
            Phase::Streaming => return Ok(0),
            Phase::Closed => {
                *phase = Phase::Closed;
                return Err(SinkError::Disconnected);
            }
        };

        let flushed = self.push_all(&pending);
        if flushed.is_err() {
            *phase = Phase::Closed;
        }
        flushed
    }

    /// Mark closed. Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        let mut phase = self.phase.lock();
        !matches!(std::mem::replace(&mut *phase, Phase::Closed), Phase::Closed)
    }

    /// Push in order. Unrenderable events are skipped; anything else is fatal.
    fn push_all(&self, events: &[Event]) -> Result<usize, SinkError> {
        let mut delivered = 0;
        for event in events {
            match self.sink.push(event) {
                Ok(()) => delivered += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(subscriber_id = %self.id, error = %e, "Event dropped for subscriber"),
            }
        }
        Ok(delivered)
    }
}

/// Tracks active subscribers by id.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    /// Counter for generating subscriber ids.
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a subscriber that streams every later matching event right away.
    /// There is no replay; use the bus to subscribe with one.
    pub fn register(&self, sink: Arc<dyn EventSink>, query: FilterQuery) -> SubscriberId {
        let subscriber = self.insert(sink, query);
        // Nothing can be pending yet, so this only moves it to Streaming.
        if subscriber.go_live().is_err() {
            debug!(subscriber_id = %subscriber.id, "Registered subscriber already closed");
        }
        subscriber.id
    }

    /// Add a subscriber in `Connecting`; live matches are held back until
    /// [`Subscriber::go_live`].
    pub(crate) fn insert(&self, sink: Arc<dyn EventSink>, query: FilterQuery) -> Arc<Subscriber> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let subscriber = Arc::new(Subscriber {
            id,
            query,
            sink,
            phase: Mutex::new(Phase::Connecting {
                pending: Vec::new(),
            }),
        });

        self.subscribers.write().insert(id, Arc::clone(&subscriber));
        debug!(subscriber_id = %id, query = subscriber.query.as_str(), "Registered subscriber");

        subscriber
    }

    /// Remove a subscriber. Removing an unknown id is a no-op; returns
    /// whether this call did the removal.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.close();
                debug!(subscriber_id = %id, "Unregistered subscriber");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(&id).cloned()
    }

    /// Point-in-time copy for iterating while others register or leave.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        let mut subscribers: Vec<Arc<Subscriber>> =
            self.subscribers.read().values().cloned().collect();
        subscribers.sort_by_key(|s| s.id);
        subscribers
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
