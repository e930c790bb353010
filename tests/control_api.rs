//! HTTP control surface tests: requests go through the axum router into a
//! live dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use tickflow::config::Config;
use tickflow::export::health::{router, HealthMetrics};
use tickflow::feed::event::EventRecord;
use tickflow::feed::{FeedConnector, FeedEvent, FeedLink};
use tickflow::ingest::control::ControlHandle;
use tickflow::ingest::Ingester;
use tickflow::sink::{Publisher, RowStore};

/// Connector whose sessions never produce events.
struct IdleFeed;

impl FeedConnector for IdleFeed {
    fn open(&self, session: u64, _events: mpsc::UnboundedSender<FeedEvent>) -> FeedLink {
        let (tx, _rx) = mpsc::unbounded_channel();
        FeedLink::detached(session, tx)
    }
}

struct NullStore;

impl RowStore for NullStore {
    fn name(&self) -> &str {
        "null"
    }

    async fn insert(&self, _table: &str, _rows: &[EventRecord]) -> Result<()> {
        Ok(())
    }
}

/// Publisher that can never connect.
struct UnreachablePublisher;

impl Publisher for UnreachablePublisher {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn connect(&self) -> Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, _topic: &str, _rows: &[EventRecord]) -> Result<()> {
        anyhow::bail!("not connected")
    }
}

struct Server {
    app: Router,
    control: ControlHandle,
    cancel: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn serve(publisher: Option<UnreachablePublisher>) -> Server {
    let mut cfg = Config::default();
    cfg.feed.api_key = "test-key".to_string();

    let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let registry = metrics.registry().clone();

    let ingester = Ingester::new(
        &cfg,
        Arc::new(NullStore),
        publisher.map(Arc::new),
        IdleFeed,
        metrics,
    );
    let control = ingester.handle();
    let cancel = CancellationToken::new();
    tokio::spawn(ingester.run(cancel.clone()));

    Server {
        app: router(registry, control.clone()),
        control,
        cancel,
    }
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, body.to_vec())
}

async fn call_json(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let (status, body) = call(app, method, uri).await;
    (status, serde_json::from_slice(&body).expect("json body"))
}

#[tokio::test]
async fn test_healthz_and_metrics() {
    let server = serve(None);

    let (status, body) = call(&server.app, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");

    let (status, body) = call(&server.app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    assert!(text.contains("tickflow_feed_connected"), "{text}");
}

#[tokio::test]
async fn test_status_serves_snapshot() {
    let server = serve(None);

    for uri in ["/status", "/health"] {
        let (status, json) = call_json(&server.app, "GET", uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connected"], false);
        assert_eq!(json["paused"], false);
        assert_eq!(json["maxConcurrentInserts"], 50);
        assert_eq!(json["batchSizes"]["trades"], 0);
        assert!(json["memoryUsageMB"].is_u64());
        assert!(json["connectionHistory"].is_array());
    }
}

#[tokio::test]
async fn test_lifecycle_commands() {
    let server = serve(None);

    let (status, json) = call_json(&server.app, "POST", "/control/pause").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "Ingestion paused");

    let (_, json) = call_json(&server.app, "GET", "/status").await;
    assert_eq!(json["status"], "paused");

    let (status, json) = call_json(&server.app, "POST", "/control/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Ingestion stopped");

    let (_, json) = call_json(&server.app, "GET", "/status").await;
    assert_eq!(json["status"], "stopped");
    assert_eq!(json["shouldRun"], false);

    let (status, json) = call_json(&server.app, "POST", "/control/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "Ingestion started");
}

#[tokio::test]
async fn test_unknown_command_not_found() {
    let server = serve(None);

    let (status, json) = call_json(&server.app, "POST", "/control/explode").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert_eq!(json["message"], "unknown command: explode");

    let (status, _) = call_json(&server.app, "POST", "/control/publisher/start").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&server.app, "GET", "/control/stop").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_publisher_routes_when_disabled() {
    let server = serve(None);

    let (status, json) = call_json(&server.app, "GET", "/control/publisher/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], false);
    assert_eq!(json["connected"], false);

    let (status, json) = call_json(&server.app, "POST", "/control/publisher/test").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);

    let (status, _) = call_json(&server.app, "POST", "/control/publisher/reconnect").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_publisher_reconnect_failure_is_server_error() {
    let server = serve(Some(UnreachablePublisher));

    // Wait for the startup connect attempt to fail.
    for _ in 0..100 {
        let status = server.control.publisher_status().await.expect("status");
        if status.errors > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (status, json) = call_json(&server.app, "POST", "/control/publisher/reconnect").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["success"], false);
    assert_eq!(json["connected"], false);
    assert!(json["message"]
        .as_str()
        .is_some_and(|m| m.starts_with("Publisher reconnection failed")));

    let (_, json) = call_json(&server.app, "GET", "/control/publisher/status").await;
    assert_eq!(json["enabled"], true);
    assert_eq!(json["connected"], false);
    assert!(json["errors"].as_u64().is_some_and(|n| n >= 2));
    assert_eq!(json["messagesProduced"], 0);
}

#[tokio::test]
async fn test_routes_unavailable_after_loop_exits() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let registry = prometheus::Registry::new();
    let app = router(registry, ControlHandle::new(tx));

    let (status, json) = call_json(&app, "GET", "/status").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);

    let (status, _) = call_json(&app, "POST", "/control/start").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
