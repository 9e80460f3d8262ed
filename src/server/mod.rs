//! HTTP transport for the bus.
//!
//! - `POST /events/{text}` publishes a plain string event
//! - `POST /events` publishes a JSON or form-encoded body
//! - `GET /events/{key}` fetches a live event by its hex content key
//! - `GET /events?query=<jsonpath>` streams matching events as
//!   `text/event-stream`, starting with a replay of what the store holds
//! - `GET /stats`, `GET /health`

mod routes;
mod sink;

pub use routes::{router, ApiError, AppState, PublishResponse};
pub use sink::{StreamReceiver, StreamSink};

use crate::bus::EventBus;
use crate::config::BusConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Serve `state` on an already bound listener until the server fails.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Build a bus from `config`, bind, and serve.
pub async fn run(config: BusConfig) -> Result<()> {
    let bus = Arc::new(EventBus::from_config(&config)?);
    let listener = TcpListener::bind(config.bind_addr).await?;

    info!(
        addr = %listener.local_addr()?,
        backend = ?config.backend,
        capacity = config.capacity,
        ttl_ms = config.ttl.as_millis() as u64,
        "Event bus listening"
    );

    serve(listener, AppState::new(bus, config)).await
}
