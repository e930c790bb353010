//! End-to-end tests of the dispatch loop with a scripted feed, an in-memory
//! store and a recording publisher. Time is paused, so timers and backoff
//! delays advance deterministically.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tickflow::config::Config;
use tickflow::export::health::HealthMetrics;
use tickflow::feed::connection::{ConnectionEventKind, LinkState};
use tickflow::feed::event::EventRecord;
use tickflow::feed::{FeedConnector, FeedEvent, FeedEventKind, FeedLink, Outbound};
use tickflow::ingest::control::{Command, ControlHandle, Outcome};
use tickflow::ingest::memory::MemoryProbe;
use tickflow::ingest::status::{RunStatus, StatusSnapshot};
use tickflow::ingest::Ingester;
use tickflow::sink::{Publisher, RowStore};

// --- Test doubles ---

struct ScriptedSession {
    id: u64,
    events: mpsc::UnboundedSender<FeedEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Connector whose sessions are driven by the test.
#[derive(Clone, Default)]
struct ScriptedFeed {
    sessions: Arc<Mutex<Vec<ScriptedSession>>>,
}

impl FeedConnector for ScriptedFeed {
    fn open(&self, session: u64, events: mpsc::UnboundedSender<FeedEvent>) -> FeedLink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().push(ScriptedSession {
            id: session,
            events,
            outbound: rx,
        });
        FeedLink::detached(session, tx)
    }
}

impl ScriptedFeed {
    fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Emits on the most recent session.
    fn emit(&self, kind: FeedEventKind) {
        let sessions = self.sessions.lock();
        let session = sessions.last().expect("no feed session opened");
        session
            .events
            .send(FeedEvent {
                session: session.id,
                kind,
            })
            .expect("ingester dropped feed channel");
    }

    /// Emits on an earlier session by index.
    fn emit_on(&self, index: usize, kind: FeedEventKind) {
        let sessions = self.sessions.lock();
        let session = &sessions[index];
        session
            .events
            .send(FeedEvent {
                session: session.id,
                kind,
            })
            .expect("ingester dropped feed channel");
    }

    fn frame(&self, raw: &str) {
        self.emit(FeedEventKind::Frame(raw.to_string()));
    }

    /// Text messages the ingester sent on the most recent session.
    fn sent_texts(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let session = sessions.last_mut().expect("no feed session opened");
        let mut texts = Vec::new();
        while let Ok(message) = session.outbound.try_recv() {
            if let Outbound::Text(text) = message {
                texts.push(text);
            }
        }
        texts
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Insert {
    table: String,
    count: usize,
}

#[derive(Default)]
struct MemoryStore {
    inserts: Mutex<Vec<Insert>>,
    delay: Duration,
    fail: AtomicBool,
}

impl MemoryStore {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn inserts(&self) -> Vec<Insert> {
        self.inserts.lock().clone()
    }

    fn rows(&self, table: &str) -> usize {
        self.inserts
            .lock()
            .iter()
            .filter(|i| i.table == table)
            .map(|i| i.count)
            .sum()
    }
}

impl RowStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, table: &str, rows: &[EventRecord]) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        self.inserts.lock().push(Insert {
            table: table.to_string(),
            count: rows.len(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, usize)>>,
    connects: AtomicU64,
    refused_connects: AtomicU64,
}

impl RecordingPublisher {
    /// Refuses the first `n` connection attempts.
    fn refusing(n: u64) -> Self {
        Self {
            refused_connects: AtomicU64::new(n),
            ..Default::default()
        }
    }
}

impl Publisher for RecordingPublisher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, topic: &str, rows: &[EventRecord]) -> Result<()> {
        self.sent.lock().push((topic.to_string(), rows.len()));
        Ok(())
    }
}

/// Memory figure set by the test; counts how often it is read.
struct SharedMemory {
    used: Arc<AtomicU64>,
    reads: Arc<AtomicU64>,
}

impl MemoryProbe for SharedMemory {
    fn used_bytes(&self) -> u64 {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.used.load(Ordering::SeqCst)
    }
}

// --- Harness ---

struct Harness {
    feed: ScriptedFeed,
    store: Arc<MemoryStore>,
    publisher: Option<Arc<RecordingPublisher>>,
    memory: Arc<AtomicU64>,
    memory_reads: Arc<AtomicU64>,
    control: ControlHandle,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.feed.api_key = "test-key".to_string();
    cfg
}

fn spawn(cfg: Config, store: MemoryStore, publisher: Option<RecordingPublisher>) -> Harness {
    let feed = ScriptedFeed::default();
    let store = Arc::new(store);
    let publisher = publisher.map(Arc::new);
    let memory = Arc::new(AtomicU64::new(1024));
    let memory_reads = Arc::new(AtomicU64::new(0));
    let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));

    let ingester = Ingester::new(
        &cfg,
        Arc::clone(&store),
        publisher.clone(),
        feed.clone(),
        metrics,
    )
    .with_memory_probe(Box::new(SharedMemory {
        used: Arc::clone(&memory),
        reads: Arc::clone(&memory_reads),
    }));

    let control = ingester.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(ingester.run(cancel.clone()));

    Harness {
        feed,
        store,
        publisher,
        memory,
        memory_reads,
        control,
        cancel,
        task,
    }
}

/// Lets the dispatch loop and spawned writes run to idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

impl Harness {
    async fn snapshot(&self) -> StatusSnapshot {
        self.control.snapshot().await.expect("snapshot")
    }

    /// Opens, authenticates and subscribes the current session.
    async fn handshake(&self) {
        settle().await;
        self.feed.emit(FeedEventKind::Opened);
        self.feed.frame(
            r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#,
        );
        self.feed
            .frame(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#);
        settle().await;
    }

    /// Cancels the loop, waits for the drain and returns the store.
    async fn shutdown(self) -> Arc<MemoryStore> {
        self.cancel.cancel();
        self.task.await.expect("join").expect("run");
        self.store
    }
}

fn trades(n: usize) -> String {
    let rows: Vec<String> = (0..n)
        .map(|i| format!(r#"{{"ev":"T","sym":"AAPL","p":189.5,"s":{},"t":{}}}"#, 100 + i, i))
        .collect();
    format!("[{}]", rows.join(","))
}

// --- Tests ---

#[tokio::test(start_paused = true)]
async fn test_handshake_sends_auth_and_subscriptions() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    let sent: Vec<Value> = h
        .feed
        .sent_texts()
        .iter()
        .map(|t| serde_json::from_str(t).expect("json"))
        .collect();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0]["action"], "auth");
    assert_eq!(sent[0]["params"], "test-key");
    assert_eq!(sent[1]["action"], "subscribe");
    assert_eq!(sent[1]["params"], "T.*");
    assert_eq!(sent[2]["params"], "Q.*");

    let snap = h.snapshot().await;
    assert_eq!(snap.link_state, LinkState::Active);
    assert_eq!(snap.status, RunStatus::Connected);
    assert!(snap.authenticated);
    assert_eq!(snap.status_message, "Active - Receiving data");
    assert_eq!(snap.processed_messages, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mixed_frame_buffers_without_flush() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    h.feed.frame(
        r#"[
            {"ev":"T","sym":"AAPL","p":1.0,"s":1,"t":1},
            {"ev":"Q","sym":"AAPL","bp":1.0,"ap":1.1,"t":1},
            {"ev":"T","sym":"MSFT","p":2.0,"s":2,"t":2},
            {"ev":"XA","sym":"AAPL"},
            {"ev":"Q","sym":"MSFT","bp":2.0,"ap":2.1,"t":2},
            {"ev":"T","sym":"NVDA","p":3.0,"s":3,"t":3}
        ]"#,
    );
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.batch_sizes.trades, 3);
    assert_eq!(snap.batch_sizes.quotes, 2);
    assert_eq!(snap.processed_messages, 1);
    assert_eq!(snap.unrecognized_events, 1);
    assert!(h.store.inserts().is_empty());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_size_trigger_flushes_when_threshold_reached() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 5;
    let h = spawn(cfg, MemoryStore::default(), None);
    h.handshake().await;

    h.feed.frame(&trades(4));
    settle().await;
    assert!(h.store.inserts().is_empty());
    assert_eq!(h.snapshot().await.batch_sizes.trades, 4);

    h.feed.frame(&trades(1));
    settle().await;
    assert_eq!(
        h.store.inserts(),
        vec![Insert {
            table: "trades".to_string(),
            count: 5
        }]
    );

    let snap = h.snapshot().await;
    assert_eq!(snap.batch_sizes.trades, 0);
    assert_eq!(snap.trades_inserted, 5);
    assert_eq!(snap.total_records_inserted, 5);
    assert_eq!(snap.running_inserts, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_partial_batches() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    h.feed.frame(&trades(2));
    h.feed
        .frame(r#"[{"ev":"Q","sym":"AAPL","bp":1.0,"ap":1.1,"t":1}]"#);
    settle().await;
    assert!(h.store.inserts().is_empty());

    tokio::time::sleep(Duration::from_millis(2000)).await;
    settle().await;

    assert_eq!(h.store.rows("trades"), 2);
    assert_eq!(h.store.rows("quotes"), 1);
    let snap = h.snapshot().await;
    assert_eq!(snap.batch_sizes.trades, 0);
    assert_eq!(snap.quotes_inserted, 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_1006_schedules_reconnect_after_base_delay() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;
    assert_eq!(h.feed.session_count(), 1);

    h.feed.emit(FeedEventKind::Closed {
        code: Some(1006),
        reason: String::new(),
    });
    settle().await;

    let snap = h.snapshot().await;
    assert!(!snap.connected);
    assert_eq!(snap.status, RunStatus::Disconnected);
    assert_eq!(snap.reconnect_attempts, 1);
    assert!(snap.last_disconnected_at.is_some());
    let events: Vec<ConnectionEventKind> =
        snap.connection_history.iter().map(|e| e.event).collect();
    assert!(events.ends_with(&[
        ConnectionEventKind::Disconnected,
        ConnectionEventKind::ReconnectScheduled
    ]));

    tokio::time::sleep(Duration::from_millis(4900)).await;
    assert_eq!(h.feed.session_count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.feed.session_count(), 2);

    // A successful open resets the attempt counter.
    h.handshake().await;
    assert_eq!(h.snapshot().await.reconnect_attempts, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_events_from_stale_session_ignored() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    h.feed.emit(FeedEventKind::Error("connection reset".to_string()));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.feed.session_count(), 2);
    h.handshake().await;

    h.feed.emit_on(0, FeedEventKind::Frame(trades(3)));
    h.feed.emit_on(
        0,
        FeedEventKind::Closed {
            code: Some(1000),
            reason: String::new(),
        },
    );
    settle().await;

    let snap = h.snapshot().await;
    assert!(snap.connected);
    assert_eq!(snap.batch_sizes.trades, 0);
    assert_eq!(snap.processed_messages, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let mut cfg = config();
    cfg.feed.reconnect.base_delay = Duration::from_secs(1);
    cfg.feed.reconnect.max_attempts = 2;
    let h = spawn(cfg, MemoryStore::default(), None);
    settle().await;

    for expected_sessions in 2..=3 {
        h.feed
            .emit(FeedEventKind::ConnectFailed("connection refused".to_string()));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(h.feed.session_count(), expected_sessions);
    }

    h.feed
        .emit(FeedEventKind::ConnectFailed("connection refused".to_string()));
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.link_state, LinkState::GivenUp);
    assert_eq!(snap.status, RunStatus::Stopped);
    assert!(!snap.should_run);
    assert_eq!(snap.status_message, "Max reconnection attempts reached");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.feed.session_count(), 3);

    // A manual start connects again.
    let resp = h.control.send(Command::Start).await.expect("start");
    assert!(resp.success);
    settle().await;
    assert_eq!(h.feed.session_count(), 4);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_stop_start() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    let resp = h.control.send(Command::Pause).await.expect("pause");
    assert!(resp.success);
    assert_eq!(resp.message, "Ingestion paused");

    h.feed.frame(&trades(3));
    settle().await;
    let snap = h.snapshot().await;
    assert_eq!(snap.status, RunStatus::Paused);
    assert_eq!(snap.batch_sizes.trades, 0);
    assert_eq!(snap.processed_messages, 0);

    let resp = h.control.send(Command::Start).await.expect("start");
    assert_eq!(resp.message, "Ingestion started");
    h.feed.frame(&trades(3));
    settle().await;
    let snap = h.snapshot().await;
    assert!(!snap.paused);
    assert_eq!(snap.batch_sizes.trades, 3);
    assert_eq!(h.feed.session_count(), 1);

    let resp = h.control.send(Command::Stop).await.expect("stop");
    assert_eq!(resp.message, "Ingestion stopped");
    let snap = h.snapshot().await;
    assert_eq!(snap.status, RunStatus::Stopped);
    assert!(!snap.connected);
    assert_eq!(snap.status_message, "Ingestion stopped");
    assert_eq!(
        snap.connection_history.last().map(|e| e.event),
        Some(ConnectionEventKind::Stopped)
    );

    // Stopped connections are not re-established.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.feed.session_count(), 1);

    h.control.send(Command::Start).await.expect("start");
    settle().await;
    assert_eq!(h.feed.session_count(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_reconnects_after_delay() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    let resp = h.control.send(Command::Restart).await.expect("restart");
    assert_eq!(resp.message, "Ingestion restarting");
    let snap = h.snapshot().await;
    assert!(!snap.connected);
    assert_eq!(snap.status_message, "Restarting ingestion...");

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(h.feed.session_count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.feed.session_count(), 2);
    assert!(h.snapshot().await.should_run);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_drops_whole_frames() {
    let mut cfg = config();
    cfg.memory.max_bytes = 4096;
    cfg.batching.flush_interval = Duration::from_secs(600);
    let h = spawn(cfg, MemoryStore::default(), None);
    h.handshake().await;

    // Frames are checked against the last sample, not the live figure.
    h.memory.store(8192, Ordering::SeqCst);
    h.feed.frame(&trades(3));
    settle().await;
    assert_eq!(h.snapshot().await.batch_sizes.trades, 3);

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.feed.frame(&trades(3));
    settle().await;

    let snap = h.snapshot().await;
    assert!(snap.memory_pressure);
    assert_eq!(snap.dropped_frames, 1);
    assert_eq!(snap.dropped_messages, 1);
    assert_eq!(snap.batch_sizes.trades, 3);
    assert_eq!(snap.processed_messages, 1);

    h.memory.store(1024, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.feed.frame(&trades(3));
    settle().await;

    let snap = h.snapshot().await;
    assert!(!snap.memory_pressure);
    assert_eq!(snap.batch_sizes.trades, 6);
    assert_eq!(snap.processed_messages, 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shedding_frames_does_not_read_memory_per_frame() {
    let mut cfg = config();
    cfg.memory.max_bytes = 4096;
    cfg.batching.flush_interval = Duration::from_secs(600);
    let h = spawn(cfg, MemoryStore::default(), None);
    h.handshake().await;

    h.memory.store(8192, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let reads = h.memory_reads.load(Ordering::SeqCst);

    for _ in 0..200 {
        h.feed.frame(&trades(1));
    }
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.dropped_frames, 200);
    assert_eq!(snap.batch_sizes.trades, 0);
    assert_eq!(h.memory_reads.load(Ordering::SeqCst), reads);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_flushes_buffers_on_health_check() {
    let mut cfg = config();
    cfg.memory.max_bytes = 4096;
    cfg.batching.flush_interval = Duration::from_secs(600);
    let h = spawn(cfg, MemoryStore::default(), None);
    h.handshake().await;

    h.feed.frame(&trades(3));
    settle().await;
    h.memory.store(8192, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(h.store.inserts().is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(h.store.rows("trades"), 3);
    assert_eq!(h.snapshot().await.batch_sizes.trades, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_feed_forced_to_reconnect() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    // Health checks run at 30s, 60s and 90s; only the last sees more than
    // 60s of silence.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(h.snapshot().await.connected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let snap = h.snapshot().await;
    assert!(!snap.connected);
    assert!(snap.time_since_last_message > 90.0);
    assert!(snap
        .connection_history
        .iter()
        .any(|e| e.event == ConnectionEventKind::Stale));
    assert_eq!(h.feed.session_count(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.feed.session_count(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_steady_traffic_keeps_connection() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        h.feed.frame(&trades(1));
    }
    settle().await;

    let snap = h.snapshot().await;
    assert!(snap.connected);
    assert!(snap.time_since_last_message < 1.0);
    assert_eq!(h.feed.session_count(), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_ingester_never_forced_to_reconnect() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;
    h.control.send(Command::Pause).await.expect("pause");

    tokio::time::sleep(Duration::from_secs(200)).await;

    let snap = h.snapshot().await;
    assert!(snap.connected);
    assert!(snap.paused);
    assert!(!snap
        .connection_history
        .iter()
        .any(|e| e.event == ConnectionEventKind::Stale));
    assert_eq!(h.feed.session_count(), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_counted_and_processing_continues() {
    let h = spawn(config(), MemoryStore::default(), None);
    h.handshake().await;

    h.feed.frame("{not json");
    h.feed.frame("42");
    h.feed.frame(&trades(1));
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.malformed_frames, 2);
    assert_eq!(snap.batch_sizes.trades, 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_drops_batch_and_counts() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 2;
    let store = MemoryStore::default();
    store.fail.store(true, Ordering::SeqCst);
    let h = spawn(cfg, store, None);
    h.handshake().await;

    h.feed.frame(&trades(2));
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.insert_failures, 1);
    assert_eq!(snap.trades_inserted, 0);
    assert_eq!(snap.running_inserts, 0);

    // Later batches are unaffected.
    h.store.fail.store(false, Ordering::SeqCst);
    h.feed.frame(&trades(2));
    settle().await;
    assert_eq!(h.snapshot().await.trades_inserted, 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overflow_queue_drops_oldest() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 1;
    cfg.dispatch.max_concurrent = 1;
    cfg.dispatch.max_queue = 1;
    let h = spawn(cfg, MemoryStore::with_delay(Duration::from_secs(1)), None);
    h.handshake().await;

    h.feed.frame(&trades(1));
    h.feed.frame(&trades(1));
    h.feed.frame(&trades(1));
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.running_inserts, 1);
    assert_eq!(snap.queue_length, 1);
    assert_eq!(snap.dropped_events, 1);
    assert_eq!(snap.dropped_batches, 1);
    assert_eq!(snap.dropped_messages, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let snap = h.snapshot().await;
    assert_eq!(snap.trades_inserted, 2);
    assert_eq!(snap.queue_length, 0);
    assert_eq!(snap.running_inserts, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_capacity_queue_drops_submitted_batch() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 1;
    cfg.dispatch.max_concurrent = 1;
    cfg.dispatch.max_queue = 0;
    let h = spawn(cfg, MemoryStore::with_delay(Duration::from_secs(1)), None);
    h.handshake().await;

    h.feed.frame(&trades(1));
    h.feed.frame(&trades(1));
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.running_inserts, 1);
    assert_eq!(snap.queue_length, 0);
    assert_eq!(snap.dropped_batches, 1);
    assert_eq!(snap.dropped_events, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.snapshot().await.trades_inserted, 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_saturated_writes_queue_then_dispatch_on_completion() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 1;
    cfg.dispatch.max_concurrent = 2;
    let h = spawn(cfg, MemoryStore::with_delay(Duration::from_secs(1)), None);
    h.handshake().await;

    for _ in 0..3 {
        h.feed.frame(&trades(1));
    }
    settle().await;

    let snap = h.snapshot().await;
    assert_eq!(snap.running_inserts, 2);
    assert_eq!(snap.queue_length, 1);

    // The first two complete at 1s and the queued batch starts immediately.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let snap = h.snapshot().await;
    assert_eq!(snap.trades_inserted, 2);
    assert_eq!(snap.running_inserts, 1);
    assert_eq!(snap.queue_length, 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_only_for_inflight_writes() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 1;
    let h = spawn(cfg, MemoryStore::with_delay(Duration::from_secs(2)), None);
    h.handshake().await;

    for _ in 0..3 {
        h.feed.frame(&trades(1));
    }
    settle().await;
    assert_eq!(h.snapshot().await.running_inserts, 3);

    let started = Instant::now();
    let store = h.shutdown().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(1900), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    assert_eq!(store.rows("trades"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_buffers_and_rejects_commands() {
    let h = spawn(config(), MemoryStore::with_delay(Duration::from_secs(1)), None);
    h.handshake().await;

    h.feed.frame(&trades(2));
    settle().await;
    assert!(h.store.inserts().is_empty());

    h.cancel.cancel();
    settle().await;

    let resp = h.control.send(Command::Start).await.expect("command");
    assert!(!resp.success);
    assert_eq!(resp.outcome, Outcome::Unavailable);
    assert!(h.snapshot().await.shutting_down);

    let store = h.shutdown().await;
    assert_eq!(store.rows("trades"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_bounds_shutdown() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 1;
    cfg.shutdown.drain_timeout = Duration::from_secs(5);
    let h = spawn(cfg, MemoryStore::with_delay(Duration::from_secs(600)), None);
    h.handshake().await;

    h.feed.frame(&trades(1));
    settle().await;

    let started = Instant::now();
    let store = h.shutdown().await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "elapsed {elapsed:?}");
    assert!(store.inserts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_successful_writes_forwarded_to_publisher() {
    let mut cfg = config();
    cfg.batching.max_batch_size = 2;
    let h = spawn(
        cfg,
        MemoryStore::default(),
        Some(RecordingPublisher::default()),
    );
    h.handshake().await;

    h.feed.frame(&trades(2));
    settle().await;

    let publisher = h.publisher.as_ref().expect("publisher");
    assert_eq!(
        publisher.sent.lock().clone(),
        vec![("stocks-trades".to_string(), 2)]
    );

    let status = h.control.publisher_status().await.expect("status");
    assert!(status.enabled);
    assert!(status.connected);
    assert_eq!(status.messages_produced, 2);
    assert_eq!(status.errors, 0);

    let resp = h
        .control
        .send(Command::PublisherTest)
        .await
        .expect("publisher test");
    assert!(resp.success);

    let resp = h
        .control
        .send(Command::PublisherReconnect)
        .await
        .expect("publisher reconnect");
    assert!(resp.success);
    assert_eq!(resp.connected, Some(true));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_publisher_commands_unavailable_when_disabled() {
    let h = spawn(config(), MemoryStore::default(), None);
    settle().await;

    let resp = h
        .control
        .send(Command::PublisherTest)
        .await
        .expect("publisher test");
    assert!(!resp.success);
    assert_eq!(resp.outcome, Outcome::Unavailable);

    let status = h.control.publisher_status().await.expect("status");
    assert!(!status.enabled);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_check_reconnects_publisher() {
    let h = spawn(config(), MemoryStore::default(), Some(RecordingPublisher::refusing(1)));
    settle().await;

    let status = h.control.publisher_status().await.expect("status");
    assert!(!status.connected);
    assert_eq!(status.errors, 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;

    let status = h.control.publisher_status().await.expect("status");
    assert!(status.connected);
    let publisher = h.publisher.as_ref().expect("publisher");
    assert_eq!(publisher.connects.load(Ordering::SeqCst), 2);

    h.shutdown().await;
}
