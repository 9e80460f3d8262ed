//! Subscriber identity, lifecycle, and delivery targets.

use crate::error::SinkError;
use crate::types::Event;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::fmt;

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle of one subscriber connection.
///
/// `Connecting -> Streaming -> Closed`, or straight to `Closed` if the
/// connection dies during replay. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, replay in progress; live matches are held back.
    Connecting,
    /// Replay done; live matches are pushed as they are published.
    Streaming,
    Closed,
}

/// The push side of a subscriber connection.
///
/// The connection itself belongs to the transport; the bus only pushes into
/// it. `push` must not block for long: a full or dead peer is reported, not
/// waited on.
pub trait EventSink: Send + Sync {
    /// Deliver one live event.
    fn push(&self, event: &Event) -> Result<(), SinkError>;

    /// Deliver the initial replay, in order, before any live event.
    ///
    /// Returns how many events were sent. Events that fail for any reason
    /// other than a hang-up are skipped. Sinks that bound their live buffer
    /// should queue the replay outside that bound.
    fn replay(&self, events: &[Event]) -> Result<usize, SinkError> {
        let mut sent = 0;
        for event in events {
            match self.push(event) {
                Ok(()) => sent += 1,
                Err(SinkError::Disconnected) => return Err(SinkError::Disconnected),
                Err(_) => {}
            }
        }
        Ok(sent)
    }
}

/// In-process sink over a bounded crossbeam channel.
pub struct ChannelSink {
    sender: Sender<Event>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Event>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn push(&self, event: &Event) -> Result<(), SinkError> {
        match self.sender.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SinkError::Disconnected),
        }
    }
}
