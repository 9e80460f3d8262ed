//! End-to-end tests of the HTTP transport.

use databus::server::{self, AppState};
use databus::{BusConfig, EventBus, StoreBackend};
use reqwest::{Client, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    bus: Arc<EventBus>,
    client: Client,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(BusConfig::default()).await
    }

    async fn start_with(config: BusConfig) -> Self {
        let bus = Arc::new(EventBus::from_config(&config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(Arc::clone(&bus), config);
        tokio::spawn(server::serve(listener, state));

        Self {
            addr,
            bus,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn subscribe(&self, query: &str) -> Response {
        self.client
            .get(self.url("/events"))
            .query(&[("query", query)])
            .send()
            .await
            .unwrap()
    }

    async fn publish_text(&self, text: &str) -> serde_json::Value {
        let response = self
            .client
            .post(self.url(&format!("/events/{text}")))
            .send()
            .await
            .unwrap();
        serde_json::from_str(&response.text().await.unwrap()).unwrap()
    }

    async fn wait_for_subscribers(&self, n: usize) {
        timeout(READ_TIMEOUT, async {
            while self.bus.subscriber_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

/// Read stream chunks until `n` data lines have arrived.
async fn read_data(response: &mut Response, n: usize) -> Vec<String> {
    let mut buffer = String::new();
    let mut data = Vec::new();

    timeout(READ_TIMEOUT, async {
        while data.len() < n {
            let chunk = response.chunk().await.unwrap().expect("stream ended early");
            buffer.push_str(std::str::from_utf8(&chunk).unwrap());

            while let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                data.extend(
                    frame
                        .lines()
                        .filter_map(|line| line.strip_prefix("data:"))
                        .map(|d| d.trim_start().to_string()),
                );
            }
        }
    })
    .await
    .expect("timed out waiting for stream data");

    data
}

// --- Publishing ---

#[tokio::test]
async fn test_publish_literal_path() {
    let server = TestServer::start().await;

    let response = server
        .client
        .post(server.url("/events/PID%3A42"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["stored"], true);
    assert_eq!(body["sequence"], 1);
    assert!(body["published_at"].as_i64().unwrap() > 0);

    let values = server.bus.store().values().unwrap();
    assert_eq!(values, vec![databus::Event::text("PID:42")]);
}

#[tokio::test]
async fn test_publish_json_body() {
    let server = TestServer::start().await;

    let response = server
        .client
        .post(server.url("/events"))
        .header("content-type", "application/json")
        .body(r#"{"a": 1, "f": {"g": 2}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let values = server.bus.store().values().unwrap();
    assert_eq!(
        values,
        vec![databus::Event::json(serde_json::json!({"a": 1, "f": {"g": 2}}))]
    );
}

#[tokio::test]
async fn test_publish_form_body() {
    let server = TestServer::start().await;

    let response = server
        .client
        .post(server.url("/events"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("name=sensor&status=up")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let values = server.bus.store().values().unwrap();
    assert_eq!(
        values,
        vec![databus::Event::json(
            serde_json::json!({"name": "sensor", "status": "up"})
        )]
    );
}

#[tokio::test]
async fn test_publish_rejects_bad_bodies() {
    let server = TestServer::start().await;

    let malformed = server
        .client
        .post(server.url("/events"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let unsupported = server
        .client
        .post(server.url("/events"))
        .header("content-type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(unsupported.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    assert!(server.bus.store().values().unwrap().is_empty());
}

// --- Streaming ---

#[tokio::test]
async fn test_stream_replays_then_goes_live() {
    let server = TestServer::start().await;
    for body in [r#"{"a": 1}"#, r#"{"a": 2}"#] {
        server
            .client
            .post(server.url("/events"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
    }

    let mut stream = server.subscribe("$[?@.a >= 2]").await;
    assert_eq!(stream.status(), StatusCode::OK);
    assert!(stream.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(read_data(&mut stream, 1).await, vec![r#"{"a":2}"#]);

    server.wait_for_subscribers(1).await;
    server
        .client
        .post(server.url("/events"))
        .header("content-type", "application/json")
        .body(r#"{"a": 1}"#)
        .send()
        .await
        .unwrap();
    server
        .client
        .post(server.url("/events"))
        .header("content-type", "application/json")
        .body(r#"{"a": 3}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(read_data(&mut stream, 1).await, vec![r#"{"a":3}"#]);
}

#[tokio::test]
async fn test_replay_longer_than_subscriber_buffer() {
    let config = BusConfig {
        capacity: 10,
        subscriber_buffer: 3,
        ..Default::default()
    };
    let server = TestServer::start_with(config).await;
    for n in 0..6 {
        server.publish_text(&format!("event-{n}")).await;
    }
    assert_eq!(server.bus.store().values().unwrap().len(), 6);

    let mut stream = server.subscribe("").await;
    let expected: Vec<String> = (0..6).map(|n| format!("event-{n}")).collect();
    assert_eq!(read_data(&mut stream, 6).await, expected);

    server.publish_text("live").await;
    assert_eq!(read_data(&mut stream, 1).await, vec!["live"]);
}

#[tokio::test]
async fn test_remote_backend_stream() {
    let config = BusConfig {
        backend: StoreBackend::Remote,
        subscriber_buffer: 2,
        ..Default::default()
    };
    let server = TestServer::start_with(config).await;
    for text in ["a", "b", "a", "c", "d"] {
        server.publish_text(text).await;
    }

    let mut stream = server.subscribe("$[?@ != 'c']").await;
    assert_eq!(read_data(&mut stream, 3).await, vec!["b", "a", "d"]);

    server.publish_text("c").await;
    server.publish_text("e").await;
    assert_eq!(read_data(&mut stream, 1).await, vec!["e"]);

    let stats = server.client.get(server.url("/stats")).send().await.unwrap();
    let stats: serde_json::Value = serde_json::from_str(&stats.text().await.unwrap()).unwrap();
    assert_eq!(stats["store"]["backend"], "remote");
    assert_eq!(stats["store"]["entries"], 5);
}

#[tokio::test]
async fn test_stream_without_query_gets_everything() {
    let server = TestServer::start().await;
    let mut stream = server.subscribe("").await;
    server.wait_for_subscribers(1).await;

    server
        .client
        .post(server.url("/events/hello"))
        .send()
        .await
        .unwrap();
    server
        .client
        .post(server.url("/events/world"))
        .send()
        .await
        .unwrap();

    assert_eq!(read_data(&mut stream, 2).await, vec!["hello", "world"]);
}

#[tokio::test]
async fn test_invalid_query_is_bad_request() {
    let server = TestServer::start().await;

    let response = server.subscribe("$[?@.a ==").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.text().await.unwrap();
    assert!(body.contains("error"), "body: {body}");
    assert_eq!(server.bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let server = TestServer::start().await;
    let stream = server.subscribe("").await;
    server.wait_for_subscribers(1).await;

    drop(stream);

    // The bus notices on the next push to the closed connection.
    timeout(READ_TIMEOUT, async {
        while server.bus.subscriber_count() != 0 {
            server
                .client
                .post(server.url("/events/ping"))
                .send()
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_idle_stream_times_out() {
    let config = BusConfig {
        idle_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let server = TestServer::start_with(config).await;
    let mut stream = server.subscribe("").await;
    server.wait_for_subscribers(1).await;

    let ended = timeout(READ_TIMEOUT, async {
        loop {
            match stream.chunk().await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    server.wait_for_subscribers(0).await;
}

// --- Lookup and introspection ---

#[tokio::test]
async fn test_lookup_by_key() {
    let server = TestServer::start().await;
    let receipt = server.publish_text("PID:7").await;
    let key = receipt["key"].as_str().unwrap().to_string();

    let found = server
        .client
        .get(server.url(&format!("/events/{key}")))
        .send()
        .await
        .unwrap();
    assert_eq!(found.status(), StatusCode::OK);
    assert_eq!(found.text().await.unwrap(), r#""PID:7""#);

    let missing = server
        .client
        .get(server.url(&format!("/events/{}", "0".repeat(64))))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let malformed = server
        .client
        .get(server.url("/events/not-hex"))
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_and_health() {
    let server = TestServer::start().await;
    server
        .client
        .post(server.url("/events/x"))
        .send()
        .await
        .unwrap();

    let health = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "ok");

    let stats = server.client.get(server.url("/stats")).send().await.unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&stats.text().await.unwrap()).unwrap();
    assert_eq!(stats["published"], 1);
    assert_eq!(stats["subscribers"], 0);
    assert_eq!(stats["store"]["backend"], "local");
    assert_eq!(stats["store"]["entries"], 1);
}
