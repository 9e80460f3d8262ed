//! Sink feeding an HTTP event stream.
//!
//! The replay and the live feed travel on separate channels. The replay is
//! queued in full however long it is; only live events count against the
//! subscriber buffer. The response reads the replay to its end before the
//! first live event.

use crate::error::SinkError;
use crate::subscriptions::EventSink;
use crate::types::Event;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::{Stream, StreamExt};

/// Renders events to stream payloads and hands them to the response task.
pub struct StreamSink {
    /// Dropped once the replay is handed over, which ends the replay half.
    replay: Mutex<Option<mpsc::UnboundedSender<String>>>,
    live: mpsc::Sender<String>,
}

/// Receiving half of a [`StreamSink`].
pub struct StreamReceiver {
    replay: mpsc::UnboundedReceiver<String>,
    live: mpsc::Receiver<String>,
}

impl StreamSink {
    /// Create a sink whose live feed holds at most `capacity` unread events.
    pub fn channel(capacity: usize) -> (Self, StreamReceiver) {
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        let (live_tx, live_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                replay: Mutex::new(Some(replay_tx)),
                live: live_tx,
            },
            StreamReceiver {
                replay: replay_rx,
                live: live_rx,
            },
        )
    }

    fn finish_replay(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.replay.lock().take()
    }
}

impl StreamReceiver {
    /// Replay payloads, then live payloads.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        UnboundedReceiverStream::new(self.replay).chain(ReceiverStream::new(self.live))
    }
}

fn render(event: &Event) -> Result<String, SinkError> {
    let data = event
        .render()
        .map_err(|e| SinkError::Serialization(e.to_string()))?;

    // A data field can carry newlines but not carriage returns.
    if data.contains('\r') {
        return Err(SinkError::Serialization(
            "carriage return cannot be sent in an event stream".into(),
        ));
    }
    Ok(data)
}

impl EventSink for StreamSink {
    fn push(&self, event: &Event) -> Result<(), SinkError> {
        // A live push means replay is over, even if none was sent.
        drop(self.finish_replay());

        let data = render(event)?;
        match self.live.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Full),
            Err(TrySendError::Closed(_)) => Err(SinkError::Disconnected),
        }
    }

    fn replay(&self, events: &[Event]) -> Result<usize, SinkError> {
        let Some(sender) = self.finish_replay() else {
            return Ok(0);
        };

        let mut sent = 0;
        for event in events {
            let Ok(data) = render(event) else {
                continue;
            };
            sender.send(data).map_err(|_| SinkError::Disconnected)?;
            sent += 1;
        }
        Ok(sent)
    }
}
