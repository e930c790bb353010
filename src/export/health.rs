use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::ingest::control::{Command, CommandResponse, ControlHandle, Outcome};

const NAMESPACE: &str = "tickflow";

/// Prometheus metrics for the ingester plus the HTTP server exposing them
/// alongside the status and control routes.
///
/// All metrics use the "tickflow" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Feed ===
    /// Total frames received from the upstream feed.
    pub frames_received: Counter,
    /// Frames discarded under memory pressure.
    pub frames_dropped: Counter,
    /// Frames that failed to parse.
    pub malformed_frames: Counter,
    /// Records with an unknown discriminator.
    pub unrecognized_events: Counter,
    /// Classified records by category.
    pub events_received: CounterVec,
    /// Whether the upstream link is connected (1=yes, 0=no).
    pub feed_connected: Gauge,
    /// Current consecutive reconnect attempts.
    pub feed_reconnect_attempts: Gauge,
    /// Connection state transitions by event.
    pub connection_events: CounterVec,

    // === Batching and writes ===
    /// Flushed batches by category and trigger.
    pub batches_flushed: CounterVec,
    /// Flushed batch size by category.
    pub batch_size: HistogramVec,
    /// Records currently buffered by category.
    pub buffered_events: GaugeVec,
    /// Records dropped by overflow-queue eviction, by category.
    pub events_dropped: CounterVec,
    /// Rows successfully inserted by category.
    pub rows_inserted: CounterVec,
    /// Failed inserts by category.
    pub insert_errors: CounterVec,
    /// Insert duration by category (1ms-10s buckets).
    pub insert_duration: HistogramVec,
    /// Writes currently in flight.
    pub running_inserts: Gauge,
    /// Batches waiting for a write slot.
    pub insert_queue_length: Gauge,
    /// Rolling inserted records per second by category.
    pub throughput: GaugeVec,

    // === Process ===
    /// Resident memory used by the process.
    pub memory_used_bytes: Gauge,

    // === Publisher ===
    /// Whether the event-log publisher is connected (1=yes, 0=no).
    pub publisher_connected: Gauge,
    /// Records published.
    pub publisher_messages: Counter,
    /// Publisher send and connect failures.
    pub publisher_errors: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let frames_received = Counter::with_opts(
            Opts::new(
                "frames_received_total",
                "Total frames received from the upstream feed.",
            )
            .namespace(NAMESPACE),
        )?;
        let frames_dropped = Counter::with_opts(
            Opts::new(
                "frames_dropped_total",
                "Total frames discarded under memory pressure.",
            )
            .namespace(NAMESPACE),
        )?;
        let malformed_frames = Counter::with_opts(
            Opts::new("malformed_frames_total", "Total frames that failed to parse.")
                .namespace(NAMESPACE),
        )?;
        let unrecognized_events = Counter::with_opts(
            Opts::new(
                "unrecognized_events_total",
                "Total records with an unknown event type.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_received = CounterVec::new(
            Opts::new(
                "events_received_total",
                "Total classified records by category.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let feed_connected = Gauge::with_opts(
            Opts::new(
                "feed_connected",
                "Whether the upstream feed is connected (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let feed_reconnect_attempts = Gauge::with_opts(
            Opts::new(
                "feed_reconnect_attempts",
                "Current consecutive reconnect attempts.",
            )
            .namespace(NAMESPACE),
        )?;
        let connection_events = CounterVec::new(
            Opts::new(
                "connection_events_total",
                "Upstream connection transitions by event.",
            )
            .namespace(NAMESPACE),
            &["event"],
        )?;

        let batches_flushed = CounterVec::new(
            Opts::new(
                "batches_flushed_total",
                "Total flushed batches by category and trigger.",
            )
            .namespace(NAMESPACE),
            &["category", "trigger"],
        )?;
        let batch_size = HistogramVec::new(
            HistogramOpts::new("batch_size", "Flushed batch size in records.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
                ]),
            &["category"],
        )?;
        let buffered_events = GaugeVec::new(
            Opts::new("buffered_events", "Records currently buffered by category.")
                .namespace(NAMESPACE),
            &["category"],
        )?;
        let events_dropped = CounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Total records dropped by overflow-queue eviction.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;
        let rows_inserted = CounterVec::new(
            Opts::new("rows_inserted_total", "Total rows inserted by category.")
                .namespace(NAMESPACE),
            &["category"],
        )?;
        let insert_errors = CounterVec::new(
            Opts::new("insert_errors_total", "Total failed inserts by category.")
                .namespace(NAMESPACE),
            &["category"],
        )?;
        let insert_duration = HistogramVec::new(
            HistogramOpts::new(
                "insert_duration_seconds",
                "Duration of store inserts by category.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["category"],
        )?;
        let running_inserts = Gauge::with_opts(
            Opts::new("running_inserts", "Store writes currently in flight.").namespace(NAMESPACE),
        )?;
        let insert_queue_length = Gauge::with_opts(
            Opts::new(
                "insert_queue_length",
                "Batches waiting for a write slot.",
            )
            .namespace(NAMESPACE),
        )?;
        let throughput = GaugeVec::new(
            Opts::new(
                "throughput_records_per_second",
                "Rolling inserted records per second by category.",
            )
            .namespace(NAMESPACE),
            &["category"],
        )?;

        let memory_used_bytes = Gauge::with_opts(
            Opts::new("memory_used_bytes", "Resident memory used by the process.")
                .namespace(NAMESPACE),
        )?;

        let publisher_connected = Gauge::with_opts(
            Opts::new(
                "publisher_connected",
                "Whether the event-log publisher is connected (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let publisher_messages = Counter::with_opts(
            Opts::new("publisher_messages_total", "Total records published.")
                .namespace(NAMESPACE),
        )?;
        let publisher_errors = Counter::with_opts(
            Opts::new(
                "publisher_errors_total",
                "Total publisher send and connect failures.",
            )
            .namespace(NAMESPACE),
        )?;

        // Feed
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(malformed_frames.clone()))?;
        registry.register(Box::new(unrecognized_events.clone()))?;
        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(feed_connected.clone()))?;
        registry.register(Box::new(feed_reconnect_attempts.clone()))?;
        registry.register(Box::new(connection_events.clone()))?;

        // Batching and writes
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(buffered_events.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(rows_inserted.clone()))?;
        registry.register(Box::new(insert_errors.clone()))?;
        registry.register(Box::new(insert_duration.clone()))?;
        registry.register(Box::new(running_inserts.clone()))?;
        registry.register(Box::new(insert_queue_length.clone()))?;
        registry.register(Box::new(throughput.clone()))?;

        // Process
        registry.register(Box::new(memory_used_bytes.clone()))?;

        // Publisher
        registry.register(Box::new(publisher_connected.clone()))?;
        registry.register(Box::new(publisher_messages.clone()))?;
        registry.register(Box::new(publisher_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            frames_received,
            frames_dropped,
            malformed_frames,
            unrecognized_events,
            events_received,
            feed_connected,
            feed_reconnect_attempts,
            connection_events,
            batches_flushed,
            batch_size,
            buffered_events,
            events_dropped,
            rows_inserted,
            insert_errors,
            insert_duration,
            running_inserts,
            insert_queue_length,
            throughput,
            memory_used_bytes,
            publisher_connected,
            publisher_messages,
            publisher_errors,
        })
    }

    /// Returns the metrics registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Starts the HTTP server serving metrics, status and control routes.
    pub async fn start(&self, control: ControlHandle) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":34567"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = router(self.registry.clone(), control);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Builds the HTTP router.
pub fn router(registry: Registry, control: ControlHandle) -> Router {
    let state = Arc::new(AppState { registry, control });

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/health", get(status_handler))
        .route("/status", get(status_handler))
        .route("/control/publisher/status", get(publisher_status_handler))
        .route("/control/publisher/:action", post(publisher_command_handler))
        .route("/control/:action", post(command_handler))
        .with_state(state)
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    control: ControlHandle,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - liveness probe.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /health, /status - full status snapshot.
async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.control.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => unavailable(e.to_string()),
    }
}

/// GET /control/publisher/status
async fn publisher_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.control.publisher_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => unavailable(e.to_string()),
    }
}

/// POST /control/{start,stop,pause,restart}
async fn command_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Response {
    dispatch(&state.control, Command::from_action(&action), &action).await
}

/// POST /control/publisher/{reconnect,test}
async fn publisher_command_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Response {
    dispatch(&state.control, Command::from_publisher_action(&action), &action).await
}

async fn dispatch(control: &ControlHandle, command: Option<Command>, action: &str) -> Response {
    let Some(command) = command else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": format!("unknown command: {action}")})),
        )
            .into_response();
    };

    match control.send(command).await {
        Ok(resp) => {
            let status = match resp.outcome {
                Outcome::Ok => StatusCode::OK,
                Outcome::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                Outcome::Failed => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(resp)).into_response()
        }
        Err(e) => unavailable(e.to_string()),
    }
}

fn unavailable(message: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(CommandResponse::unavailable(message)),
    )
        .into_response()
}
