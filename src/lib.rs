//! # Data Bus
//!
//! An in-process event bus that keeps a short, expiring window of recent
//! events and streams them to any number of subscribers, each with its own
//! structural filter.
//!
//! ## Core Concepts
//!
//! - **Events**: arbitrary JSON documents (plain strings included), keyed by
//!   a hash of their content
//! - **Store**: bounded or TTL-expiring window of recent events, local or remote
//! - **Filters**: JSONPath queries over the event sequence
//! - **Subscribers**: replay of the current window on connect, then live
//!   matches in publish order
//!
//! ## Example
//!
//! ```ignore
//! use databus::{ChannelSink, EventBus, Event, ExpiryPolicy};
//!
//! let bus = EventBus::local(100, ExpiryPolicy::AfterAccess(Duration::from_secs(10)));
//!
//! let (sink, receiver) = ChannelSink::bounded(1000);
//! let subscription = bus.subscribe("$[?@.a == 2]", Arc::new(sink))?;
//!
//! bus.publish(Event::json(json!({"a": 1})));
//! bus.publish(Event::json(json!({"a": 2})));
//!
//! assert_eq!(receiver.recv()?, Event::json(json!({"a": 2})));
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod filter;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use bus::{BusStats, EventBus, PublishReceipt, Subscription};
pub use config::{BusConfig, ExpiryMode, StoreBackend};
pub use error::{BusError, Result, SinkError};
pub use filter::FilterQuery;
pub use store::{
    EventStore, Eviction, EvictionCause, ExpiryPolicy, InMemoryKv, KvClient, KvError,
    LocalStore, RemoteStore, StoreStats,
};
pub use subscriptions::{
    ChannelSink, ConnectionState, EventSink, Subscriber, SubscriberId, SubscriberRegistry,
};
pub use types::*;
