//! Subscriber bookkeeping for live fan-out.
//!
//! This module tracks who is listening and pushes to them:
//! - [`SubscriberRegistry`] holds every active subscriber with its filter
//! - [`EventSink`] is the push side of a subscriber's connection
//! - [`ChannelSink`] is an in-process sink over a bounded channel
//!
//! A subscriber whose push fails for any reason other than an unrenderable
//! event is closed and removed, the same way a slow or vanished consumer is
//! dropped.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriberRegistry::new();
//! let (sink, receiver) = ChannelSink::bounded(1000);
//! let id = registry.register(Arc::new(sink), FilterQuery::parse("$[?@.a == 2]")?);
//!
//! for subscriber in registry.snapshot() {
//!     println!("{} is {:?}", subscriber.id(), subscriber.state());
//! }
//!
//! registry.unregister(id);
//! ```

mod registry;
mod types;

pub(crate) use registry::Delivery;
pub use registry::{Subscriber, SubscriberRegistry};
pub use types::{ChannelSink, ConnectionState, EventSink, SubscriberId};
