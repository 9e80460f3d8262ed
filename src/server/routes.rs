//! HTTP routes for publishing and streaming events.

use super::sink::StreamSink;
use crate::bus::{BusStats, EventBus, PublishReceipt};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::store::EventStore;
use crate::types::{Event, Hash};
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub config: Arc<BusConfig>,
}

impl AppState {
    pub fn new(bus: Arc<EventBus>, config: BusConfig) -> Self {
        Self {
            bus,
            config: Arc::new(config),
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(subscribe).post(publish_body))
        .route("/events/:event", get(lookup).post(publish_text))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response with a JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        let status = match &e {
            BusError::InvalidFilter { .. } => StatusCode::BAD_REQUEST,
            BusError::SubscriberClosed => StatusCode::GONE,
            BusError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Body returned to publishers.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub sequence: u64,
    /// Microseconds since the Unix epoch.
    pub published_at: i64,
    pub delivered: usize,
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<PublishReceipt> for PublishResponse {
    fn from(receipt: PublishReceipt) -> Self {
        Self {
            key: receipt.key.map(|k| k.to_hex()),
            sequence: receipt.sequence.0,
            published_at: receipt.published_at.0,
            delivered: receipt.delivered,
            stored: receipt.stored(),
            error: receipt.store_error.map(|e| e.to_string()),
        }
    }
}

/// 200 when stored, 202 when only live subscribers got it.
fn publish_response(receipt: PublishReceipt) -> (StatusCode, Json<PublishResponse>) {
    let status = if receipt.stored() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(receipt.into()))
}

async fn publish_text(
    State(state): State<AppState>,
    Path(event): Path<String>,
) -> (StatusCode, Json<PublishResponse>) {
    publish_response(state.bus.publish(Event::text(event)))
}

async fn publish_body(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let event = if content_type.starts_with("application/json") {
        let Json(value) = Json::<Value>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
        Event::json(value)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(fields) = Form::<BTreeMap<String, String>>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
        Event::json(Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        ))
    } else {
        return Err(ApiError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported content type {content_type:?}"),
        ));
    };

    Ok(publish_response(state.bus.publish(event)))
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    query: String,
}

async fn subscribe(
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let (sink, receiver) = StreamSink::channel(state.config.subscriber_buffer);
    let subscription = state.bus.subscribe(&params.query, Arc::new(sink))?;
    debug!(subscriber_id = %subscription.id(), replayed = subscription.replayed(), "Stream opened");

    // The subscription rides along with the stream: when the client goes
    // away or the idle timeout ends the stream, dropping it unregisters.
    let stream = receiver
        .into_stream()
        .timeout(state.config.idle_timeout)
        .take_while(|item| item.is_ok())
        .filter_map(move |item| {
            let _subscription = &subscription;
            item.ok()
                .map(|data| Ok::<_, Infallible>(SseEvent::default().data(data)))
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Fetch a live event by the hex content key a publish returned.
async fn lookup(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = Hash::from_hex(&key)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid key: {e}")))?;

    match state.bus.store().get(&key)? {
        Some(event) => Ok(Json(event.into_value())),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "no live event with that key")),
    }
}

async fn stats(State(state): State<AppState>) -> Json<BusStats> {
    Json(state.bus.stats())
}

async fn health() -> &'static str {
    "ok"
}
