//! The ingester: one dispatch loop owning every piece of mutable pipeline
//! state.
//!
//! Transport events, write completions, control requests and the flush and
//! health timers all arrive at a single `tokio::select!` loop, so buffers,
//! counters and the overflow queue are only ever touched from one task.
//! Store writes, publisher sends and publisher connects run as spawned tasks
//! and report back over the completion channel.

pub mod control;
pub mod health;
pub mod memory;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PerCategory};
use crate::export::health::HealthMetrics;
use crate::feed::classify;
use crate::feed::connection::{ConnectionManager, Disconnect, ReconnectDecision};
use crate::feed::event::{Category, EventRecord, Payload};
use crate::feed::{FeedConnector, FeedEvent, FeedEventKind, FeedLink};
use crate::sink::accumulator::BatchAccumulator;
use crate::sink::dispatch::{Admission, WriteDispatcher};
use crate::sink::{Batch, FlushTrigger, Publisher, RowStore};

use self::control::{Command, CommandResponse, ControlHandle, ControlRequest, ControlState};
use self::health::HealthInputs;
use self::memory::{MemoryGuard, MemoryProbe, ProcessMemory};
use self::status::{
    BatchSizes, Counters, InsertHistory, PublisherStatus, StatusSnapshot, SNAPSHOT_HISTORY_LEN,
};

const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// How often the shutdown drain reports progress.
const DRAIN_LOG_INTERVAL: Duration = Duration::from_secs(1);

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Outcome of a spawned task, delivered back to the dispatch loop.
#[derive(Debug)]
enum Completion {
    Write {
        batch: Batch,
        elapsed: Duration,
        result: Result<(), String>,
    },
    Publish {
        category: Category,
        count: usize,
        result: Result<(), String>,
    },
    PublisherConnect {
        result: Result<(), String>,
        reply: Option<oneshot::Sender<CommandResponse>>,
    },
    PublisherTest {
        result: Result<(), String>,
        reply: oneshot::Sender<CommandResponse>,
    },
}

/// Loop-level tunables taken from [`Config`].
#[derive(Debug, Clone)]
struct Settings {
    tables: PerCategory<String>,
    topics: PerCategory<String>,
    flush_interval: Duration,
    check_interval: Duration,
    sample_interval: Duration,
    stale_after: Duration,
    restart_delay: Duration,
    drain_timeout: Duration,
}

/// Real-time ingestion pipeline from the upstream feed into a [`RowStore`].
pub struct Ingester<S: RowStore, P: Publisher, F: FeedConnector> {
    settings: Settings,
    store: Arc<S>,
    publisher: Option<Arc<P>>,
    connector: F,
    metrics: Arc<HealthMetrics>,
    memory: MemoryGuard,

    control: ControlState,
    link: ConnectionManager,
    link_events_seen: u64,
    // Stale watchdog clock; the snapshot's wall-clock time comes from `link`.
    last_activity: Instant,
    feed: Option<FeedLink>,
    reconnect_at: Option<Instant>,
    restart_at: Option<Instant>,

    accumulator: BatchAccumulator,
    dispatcher: WriteDispatcher,
    history: InsertHistory,
    counters: Counters,

    publisher_connected: bool,
    publisher_connecting: bool,

    feed_tx: mpsc::UnboundedSender<FeedEvent>,
    feed_rx: Option<mpsc::UnboundedReceiver<FeedEvent>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Option<mpsc::UnboundedReceiver<Completion>>,
    control_tx: mpsc::Sender<ControlRequest>,
    control_rx: Option<mpsc::Receiver<ControlRequest>>,
}

impl<S: RowStore, P: Publisher, F: FeedConnector> Ingester<S, P, F> {
    /// Creates an idle ingester. Nothing connects until [`Ingester::run`].
    ///
    /// `publisher` is `None` when the secondary publisher is disabled.
    pub fn new(
        cfg: &Config,
        store: Arc<S>,
        publisher: Option<Arc<P>>,
        connector: F,
        metrics: Arc<HealthMetrics>,
    ) -> Self {
        let subscriptions = Category::ALL
            .iter()
            .map(|category| cfg.feed.subscriptions.get(*category).clone())
            .collect();

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        Self {
            settings: Settings {
                tables: cfg.clickhouse.tables.clone(),
                topics: cfg.publisher.topics.clone(),
                flush_interval: cfg.batching.flush_interval,
                check_interval: cfg.health.check_interval,
                sample_interval: cfg.memory.sample_interval,
                stale_after: cfg.feed.stale_after,
                restart_delay: cfg.feed.restart_delay,
                drain_timeout: cfg.shutdown.drain_timeout,
            },
            store,
            publisher,
            connector,
            metrics,
            memory: MemoryGuard::new(Box::new(ProcessMemory), cfg.memory.max_bytes),
            control: ControlState::default(),
            link: ConnectionManager::new(
                cfg.feed.reconnect.policy(),
                cfg.feed.api_key.clone(),
                subscriptions,
                Utc::now(),
            ),
            link_events_seen: 0,
            last_activity: Instant::now(),
            feed: None,
            reconnect_at: None,
            restart_at: None,
            accumulator: BatchAccumulator::new(cfg.batching.max_batch_size),
            dispatcher: WriteDispatcher::new(cfg.dispatch.max_concurrent, cfg.dispatch.max_queue),
            history: InsertHistory::new(cfg.health.throughput_window),
            counters: Counters::default(),
            publisher_connected: false,
            publisher_connecting: false,
            feed_tx,
            feed_rx: Some(feed_rx),
            completion_tx,
            completion_rx: Some(completion_rx),
            control_tx,
            control_rx: Some(control_rx),
        }
    }

    /// Replaces the memory source used for the pressure check.
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.memory = MemoryGuard::new(probe, self.memory.ceiling());
        self
    }

    /// Returns a handle for status requests and control commands.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle::new(self.control_tx.clone())
    }

    /// Runs the dispatch loop until `cancel` fires, then drains and returns.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut feed_rx = self.feed_rx.take().context("feed channel already taken")?;
        let mut completion_rx = self
            .completion_rx
            .take()
            .context("completion channel already taken")?;
        let mut control_rx = self
            .control_rx
            .take()
            .context("control channel already taken")?;

        let flush_period = self.settings.flush_interval;
        let mut flush_ticker = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let check_period = self.settings.check_interval;
        let mut health_ticker =
            tokio::time::interval_at(Instant::now() + check_period, check_period);
        health_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let sample_period = self.settings.sample_interval;
        let mut memory_ticker =
            tokio::time::interval_at(Instant::now() + sample_period, sample_period);
        memory_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.sample_memory();

        info!(
            store = self.store.name(),
            publisher = self.publisher.as_ref().map(|p| p.name()),
            max_batch_size = self.accumulator.max_batch_size(),
            max_concurrent = self.dispatcher.max_concurrent(),
            flush_interval = ?flush_period,
            "ingester started",
        );

        if self.publisher.is_some() {
            self.reconnect_publisher(None);
        }
        self.connect();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(completion) = completion_rx.recv() => self.handle_completion(completion),

                Some(event) = feed_rx.recv() => self.handle_feed_event(event),

                Some(request) = control_rx.recv() => self.handle_control(request),

                _ = flush_ticker.tick() => {
                    if !self.control.paused {
                        self.flush_all(FlushTrigger::Timer);
                    }
                }

                _ = health_ticker.tick() => self.health_check(),

                _ = memory_ticker.tick() => self.sample_memory(),

                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect();
                }

                _ = sleep_until(self.restart_at) => {
                    self.restart_at = None;
                    self.start();
                }
            }
        }

        self.shutdown(&mut completion_rx, &mut control_rx).await;

        Ok(())
    }

    // --- Feed ---

    fn connect(&mut self) {
        if !self.control.can_connect() || self.feed.is_some() {
            return;
        }

        self.reconnect_at = None;
        let session = self.link.begin_connect(Utc::now());
        info!(
            session,
            attempt = self.link.state().reconnect_attempts + 1,
            "connecting to feed",
        );

        self.feed = Some(self.connector.open(session, self.feed_tx.clone()));
        self.sync_link_metrics();
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        if self.feed.as_ref().map(FeedLink::session) != Some(event.session) {
            debug!(session = event.session, "ignoring event from stale feed session");
            return;
        }

        match event.kind {
            FeedEventKind::Opened => self.on_open(),
            FeedEventKind::Frame(raw) => self.handle_frame(&raw),
            FeedEventKind::Closed { code, reason } => {
                self.handle_disconnect(Disconnect::Closed { code, reason });
            }
            FeedEventKind::Error(e) => self.handle_disconnect(Disconnect::Error(e)),
            FeedEventKind::ConnectFailed(e) => {
                self.handle_disconnect(Disconnect::ConnectFailed(e));
            }
        }
    }

    fn on_open(&mut self) {
        let auth = self.link.on_open(Utc::now());
        self.last_activity = Instant::now();
        info!("feed connected, authenticating");

        if let Some(feed) = &self.feed {
            feed.send(auth);
        }
        self.sync_link_metrics();
    }

    fn handle_frame(&mut self, raw: &str) {
        if self.control.shutting_down || self.control.paused {
            return;
        }

        self.metrics.frames_received.inc();
        self.link.on_message(Utc::now());
        self.last_activity = Instant::now();

        if self.memory.under_pressure() {
            self.counters.dropped_frames += 1;
            self.metrics.frames_dropped.inc();
            debug!(
                used_bytes = self.memory.used_bytes(),
                ceiling = self.memory.ceiling(),
                "memory pressure, dropping frame"
            );
            return;
        }

        let mut frame = match classify::classify(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.malformed_frames += 1;
                self.metrics.malformed_frames.inc();
                warn!(error = %e, sample = classify::sample(raw), "malformed frame");
                return;
            }
        };

        if !frame.unrecognized.is_empty() {
            let count = frame.unrecognized.len();
            self.counters.unrecognized_events += count as u64;
            self.metrics.unrecognized_events.inc_by(count as f64);
            debug!(kinds = ?frame.unrecognized, "unrecognized events");
        }

        if !frame.status.is_empty() {
            let now = Utc::now();
            for status in &frame.status {
                debug!(status = ?status.kind, message = ?status.message, "feed status");

                let subscriptions = self.link.on_status(status, now);
                if subscriptions.is_empty() {
                    continue;
                }

                info!(count = subscriptions.len(), "feed authenticated, subscribing");
                if let Some(feed) = &self.feed {
                    for message in subscriptions {
                        feed.send(message);
                    }
                }
            }
            self.sync_link_metrics();
        }

        if frame.has_data() {
            self.counters.processed_frames += 1;
        }

        for category in Category::ALL {
            let records = frame.take_events(category);
            if records.is_empty() {
                continue;
            }

            self.metrics
                .events_received
                .with_label_values(&[category.as_str()])
                .inc_by(records.len() as f64);

            if let Some(batch) = self.accumulator.append(category, records) {
                self.submit(batch);
            }
        }

        self.refresh_buffer_gauges();
    }

    fn handle_disconnect(&mut self, cause: Disconnect) {
        if let Some(feed) = self.feed.take() {
            feed.close();
        }

        let will_reconnect = self.control.can_connect();
        let detail = format!("{cause:?}");
        if !self.link.on_disconnect(cause, Utc::now(), will_reconnect) {
            return;
        }

        warn!(cause = %detail, will_reconnect, "feed disconnected");

        if will_reconnect {
            self.schedule_reconnect();
        }
        self.sync_link_metrics();
    }

    fn schedule_reconnect(&mut self) {
        match self.link.schedule_reconnect(Utc::now()) {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(attempt, delay = ?delay, "scheduling feed reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            ReconnectDecision::GiveUp => {
                error!(
                    max_attempts = self.link.policy().max_attempts,
                    "max reconnection attempts reached, giving up",
                );
                self.control.should_run = false;
                self.reconnect_at = None;
            }
        }
    }

    // --- Batching and writes ---

    fn flush_all(&mut self, trigger: FlushTrigger) {
        for batch in self.accumulator.flush_all(trigger) {
            self.submit(batch);
        }
        self.refresh_buffer_gauges();
    }

    fn submit(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let label = batch.category.as_str();
        self.metrics
            .batches_flushed
            .with_label_values(&[label, batch.trigger.as_str()])
            .inc();
        self.metrics
            .batch_size
            .with_label_values(&[label])
            .observe(batch.len() as f64);

        debug!(
            category = label,
            count = batch.len(),
            trigger = batch.trigger.as_str(),
            "flushing batch"
        );

        match self.dispatcher.submit(batch) {
            Admission::Start(batch) => self.start_write(batch),
            Admission::Queued => {}
            Admission::Evicted(dropped) => {
                self.count_dropped(&dropped);
                warn!(
                    category = dropped.category.as_str(),
                    count = dropped.len(),
                    queue_length = self.dispatcher.queue_len(),
                    "write queue full, dropped oldest batch",
                );
            }
            Admission::Rejected(dropped) => {
                self.count_dropped(&dropped);
                warn!(
                    category = dropped.category.as_str(),
                    count = dropped.len(),
                    "write queue has no capacity, dropped submitted batch",
                );
            }
        }

        self.refresh_write_gauges();
    }

    fn count_dropped(&self, dropped: &Batch) {
        self.metrics
            .events_dropped
            .with_label_values(&[dropped.category.as_str()])
            .inc_by(dropped.len() as f64);
    }

    fn start_write(&self, batch: Batch) {
        let store = Arc::clone(&self.store);
        let table = self.settings.tables.get(batch.category).clone();
        let tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = store
                .insert(&table, &batch.records)
                .await
                .map_err(|e| format!("{e:#}"));

            let _ = tx.send(Completion::Write {
                batch,
                elapsed: started.elapsed(),
                result,
            });
        });
    }

    fn forward(&self, batch: Batch) {
        if !self.publisher_connected {
            return;
        }
        let Some(publisher) = self.publisher.clone() else {
            return;
        };

        let category = batch.category;
        let topic = self.settings.topics.get(category).clone();
        let tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let count = batch.len();
            let result = publisher
                .send(&topic, &batch.records)
                .await
                .map_err(|e| format!("{e:#}"));

            let _ = tx.send(Completion::Publish {
                category,
                count,
                result,
            });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Write {
                batch,
                elapsed,
                result,
            } => {
                let category = batch.category;
                let label = category.as_str();
                self.metrics
                    .insert_duration
                    .with_label_values(&[label])
                    .observe(elapsed.as_secs_f64());

                match result {
                    Ok(()) => {
                        let count = batch.len();
                        self.history.record(Instant::now(), category, count);
                        self.counters.inserted[category.index()] += count as u64;
                        self.metrics
                            .rows_inserted
                            .with_label_values(&[label])
                            .inc_by(count as f64);
                        debug!(category = label, count, elapsed = ?elapsed, "inserted batch");

                        self.forward(batch);
                    }
                    Err(e) => {
                        self.counters.insert_failures += 1;
                        self.metrics.insert_errors.with_label_values(&[label]).inc();
                        error!(
                            category = label,
                            count = batch.len(),
                            error = %e,
                            "insert failed, batch dropped",
                        );
                    }
                }

                if let Some(next) = self.dispatcher.complete() {
                    self.start_write(next);
                }
                self.refresh_write_gauges();
            }

            Completion::Publish {
                category,
                count,
                result,
            } => match result {
                Ok(()) => {
                    self.counters.publisher_messages += count as u64;
                    self.metrics.publisher_messages.inc_by(count as f64);
                }
                Err(e) => {
                    self.counters.publisher_errors += 1;
                    self.metrics.publisher_errors.inc();
                    warn!(category = category.as_str(), count, error = %e, "publisher send failed");
                }
            },

            Completion::PublisherConnect { result, reply } => {
                self.publisher_connecting = false;

                let response = match result {
                    Ok(()) => {
                        self.publisher_connected = true;
                        info!("publisher connected");
                        CommandResponse::ok("Publisher reconnected successfully").with_connected(true)
                    }
                    Err(e) => {
                        self.publisher_connected = false;
                        self.counters.publisher_errors += 1;
                        self.metrics.publisher_errors.inc();
                        warn!(error = %e, "publisher connect failed");
                        CommandResponse::failed(format!("Publisher reconnection failed: {e}"))
                            .with_connected(false)
                    }
                };

                self.metrics
                    .publisher_connected
                    .set(f64::from(u8::from(self.publisher_connected)));

                if let Some(reply) = reply {
                    let _ = reply.send(response);
                }
            }

            Completion::PublisherTest { result, reply } => {
                let response = match result {
                    Ok(()) => {
                        self.counters.publisher_messages += 1;
                        self.metrics.publisher_messages.inc();
                        CommandResponse::ok("Test message sent successfully")
                    }
                    Err(e) => {
                        self.counters.publisher_errors += 1;
                        self.metrics.publisher_errors.inc();
                        warn!(error = %e, "publisher test message failed");
                        CommandResponse::failed(format!("Failed to send test message: {e}"))
                    }
                };
                let _ = reply.send(response);
            }
        }
    }

    // --- Publisher ---

    fn reconnect_publisher(&mut self, reply: Option<oneshot::Sender<CommandResponse>>) {
        let respond = |reply: Option<oneshot::Sender<CommandResponse>>, response| {
            if let Some(reply) = reply {
                let _ = reply.send(response);
            }
        };

        let Some(publisher) = self.publisher.clone() else {
            respond(reply, CommandResponse::unavailable("Publisher is not enabled"));
            return;
        };

        if self.publisher_connected {
            respond(
                reply,
                CommandResponse::ok("Publisher already connected").with_connected(true),
            );
            return;
        }

        if self.publisher_connecting {
            respond(
                reply,
                CommandResponse::unavailable("Publisher connection already in progress")
                    .with_connected(false),
            );
            return;
        }

        self.publisher_connecting = true;
        let tx = self.completion_tx.clone();
        info!(publisher = publisher.name(), "connecting publisher");

        tokio::spawn(async move {
            if let Err(e) = publisher.disconnect().await {
                debug!(error = %e, "publisher disconnect before connect failed");
            }
            let result = publisher.connect().await.map_err(|e| format!("{e:#}"));
            let _ = tx.send(Completion::PublisherConnect { result, reply });
        });
    }

    fn test_publisher(&mut self, reply: oneshot::Sender<CommandResponse>) {
        let publisher = match &self.publisher {
            Some(publisher) if self.publisher_connected => Arc::clone(publisher),
            _ => {
                let _ = reply.send(CommandResponse::unavailable(
                    "Publisher not enabled or not connected",
                ));
                return;
            }
        };

        let mut payload = Payload::new();
        payload.insert("timestamp".to_string(), json!(Utc::now().timestamp_millis()));
        payload.insert("test".to_string(), json!(true));
        payload.insert(
            "message".to_string(),
            json!("Test message from tickflow ingester"),
        );
        let record = EventRecord::new(Category::Trades, payload);

        let topic = self.settings.topics.get(Category::Trades).clone();
        let tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let result = publisher
                .send(&topic, std::slice::from_ref(&record))
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = tx.send(Completion::PublisherTest { result, reply });
        });
    }

    // --- Control ---

    fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControlRequest::Command { command, reply } => {
                if self.control.shutting_down {
                    let _ = reply.send(CommandResponse::unavailable("Shutting down"));
                    return;
                }

                info!(command = command.as_str(), "control command");

                let response = match command {
                    Command::Start => {
                        self.start();
                        CommandResponse::ok("Ingestion started")
                    }
                    Command::Stop => {
                        self.stop();
                        CommandResponse::ok("Ingestion stopped")
                    }
                    Command::Pause => {
                        self.control.paused = true;
                        self.link.set_status_message("Ingestion paused");
                        CommandResponse::ok("Ingestion paused")
                    }
                    Command::Restart => {
                        self.stop();
                        self.link.set_status_message("Restarting ingestion...");
                        self.restart_at = Some(Instant::now() + self.settings.restart_delay);
                        CommandResponse::ok("Ingestion restarting")
                    }
                    Command::PublisherReconnect => {
                        self.reconnect_publisher(Some(reply));
                        return;
                    }
                    Command::PublisherTest => {
                        self.test_publisher(reply);
                        return;
                    }
                };

                let _ = reply.send(response);
            }
        }
    }

    fn start(&mut self) {
        self.control.should_run = true;
        self.control.paused = false;
        self.restart_at = None;
        self.link.set_status_message("Starting ingestion...");
        self.connect();
    }

    fn stop(&mut self) {
        self.control.should_run = false;
        self.control.paused = false;
        self.reconnect_at = None;
        self.restart_at = None;
        self.handle_disconnect(Disconnect::Requested);
        self.link.set_status_message("Ingestion stopped");
    }

    // --- Health and status ---

    fn sample_memory(&mut self) {
        let was_over = self.memory.under_pressure();
        let used = self.memory.sample();
        self.metrics.memory_used_bytes.set(used as f64);

        match (was_over, self.memory.under_pressure()) {
            (false, true) => warn!(
                used_bytes = used,
                ceiling = self.memory.ceiling(),
                "memory above ceiling, shedding frames",
            ),
            (true, false) => info!(used_bytes = used, "memory back under ceiling"),
            _ => {}
        }
    }

    fn health_check(&mut self) {
        self.sample_memory();
        let used = self.memory.used_bytes();
        let memory_pressure = self.memory.under_pressure();
        let since_last_message = self.last_activity.elapsed();

        let throughput = self.history.throughput(Instant::now());
        for (category, value) in [
            (Category::Trades, throughput.trades_per_second),
            (Category::Quotes, throughput.quotes_per_second),
        ] {
            self.metrics
                .throughput
                .with_label_values(&[category.as_str()])
                .set(value);
        }

        info!(
            processed = self.counters.processed_frames,
            dropped_frames = self.counters.dropped_frames,
            dropped_events = self.dispatcher.dropped_events(),
            dropped_batches = self.dispatcher.dropped_batches(),
            trades_inserted = self.counters.inserted(Category::Trades),
            quotes_inserted = self.counters.inserted(Category::Quotes),
            insert_failures = self.counters.insert_failures,
            running_inserts = self.dispatcher.running(),
            queue_length = self.dispatcher.queue_len(),
            memory_mb = used / BYTES_PER_MB,
            records_per_second = throughput.total_per_second,
            "health check",
        );

        let actions = health::evaluate(
            &HealthInputs {
                since_last_message,
                connected: self.link.state().connected,
                paused: self.control.paused,
                memory_pressure,
                publisher_enabled: self.publisher.is_some(),
                publisher_connected: self.publisher_connected,
                shutting_down: self.control.shutting_down,
            },
            self.settings.stale_after,
        );

        if actions.force_reconnect {
            warn!(
                silent_for = ?since_last_message,
                "no feed messages within stale threshold, forcing reconnect",
            );
            self.handle_disconnect(Disconnect::Stale);
        }

        if actions.force_flush {
            warn!(
                used_bytes = used,
                ceiling = self.memory.ceiling(),
                "memory pressure, flushing all buffers",
            );
            self.flush_all(FlushTrigger::Pressure);
        }

        if actions.reconnect_publisher {
            self.reconnect_publisher(None);
        }
    }

    fn snapshot(&mut self) -> StatusSnapshot {
        let now = Utc::now();
        let state = self.link.state().clone();
        let used = self.memory.used_bytes();
        let dropped_events = self.dispatcher.dropped_events();

        StatusSnapshot {
            status: self.control.run_status(state.connected),
            link_state: self.link.link_state(),
            connected: state.connected,
            authenticated: state.authenticated,
            paused: self.control.paused,
            should_run: self.control.should_run,
            shutting_down: self.control.shutting_down,
            uptime: self.link.uptime(now).as_secs_f64(),
            total_uptime: self.link.total_uptime(now).as_secs_f64(),
            time_since_last_disconnect: self
                .link
                .time_since_last_disconnect(now)
                .map(|d| d.as_secs_f64()),
            running_inserts: self.dispatcher.running(),
            max_concurrent_inserts: self.dispatcher.max_concurrent(),
            queue_length: self.dispatcher.queue_len(),
            memory_usage: used,
            memory_usage_mb: used / BYTES_PER_MB,
            memory_pressure: self.memory.under_pressure(),
            processed_messages: self.counters.processed_frames,
            dropped_messages: self.counters.dropped_frames + dropped_events,
            dropped_frames: self.counters.dropped_frames,
            dropped_events,
            dropped_batches: self.dispatcher.dropped_batches(),
            malformed_frames: self.counters.malformed_frames,
            unrecognized_events: self.counters.unrecognized_events,
            trades_inserted: self.counters.inserted(Category::Trades),
            quotes_inserted: self.counters.inserted(Category::Quotes),
            total_records_inserted: self.counters.total_inserted(),
            insert_failures: self.counters.insert_failures,
            batch_sizes: BatchSizes {
                trades: self.accumulator.len(Category::Trades),
                quotes: self.accumulator.len(Category::Quotes),
            },
            throughput: self.history.throughput(Instant::now()),
            reconnect_attempts: state.reconnect_attempts,
            max_reconnect_attempts: self.link.policy().max_attempts,
            status_message: self.link.status_message().to_string(),
            connection_history: self.link.recent_history(SNAPSHOT_HISTORY_LEN),
            connection_started_at: state.connection_started_at,
            last_disconnected_at: state.last_disconnected_at,
            last_message_time: state.last_message_at,
            time_since_last_message: self.last_activity.elapsed().as_secs_f64(),
            publisher: PublisherStatus {
                enabled: self.publisher.is_some(),
                connected: self.publisher_connected,
                messages_produced: self.counters.publisher_messages,
                errors: self.counters.publisher_errors,
            },
        }
    }

    fn sync_link_metrics(&mut self) {
        let recorded = self.link.recorded_events();
        let fresh = usize::try_from(recorded.saturating_sub(self.link_events_seen))
            .unwrap_or(usize::MAX);
        for entry in self.link.recent_history(fresh) {
            self.metrics
                .connection_events
                .with_label_values(&[entry.event.as_str()])
                .inc();
        }
        self.link_events_seen = recorded;

        let state = self.link.state();
        self.metrics
            .feed_connected
            .set(f64::from(u8::from(state.connected)));
        self.metrics
            .feed_reconnect_attempts
            .set(f64::from(state.reconnect_attempts));
    }

    fn refresh_buffer_gauges(&self) {
        for category in Category::ALL {
            self.metrics
                .buffered_events
                .with_label_values(&[category.as_str()])
                .set(self.accumulator.len(category) as f64);
        }
    }

    fn refresh_write_gauges(&self) {
        self.metrics
            .running_inserts
            .set(self.dispatcher.running() as f64);
        self.metrics
            .insert_queue_length
            .set(self.dispatcher.queue_len() as f64);
    }

    // --- Shutdown ---

    async fn shutdown(
        &mut self,
        completion_rx: &mut mpsc::UnboundedReceiver<Completion>,
        control_rx: &mut mpsc::Receiver<ControlRequest>,
    ) {
        info!("shutting down ingester");

        self.control.shutting_down = true;
        self.reconnect_at = None;
        self.restart_at = None;
        self.flush_all(FlushTrigger::Shutdown);

        let deadline = Instant::now() + self.settings.drain_timeout;
        let mut progress =
            tokio::time::interval_at(Instant::now() + DRAIN_LOG_INTERVAL, DRAIN_LOG_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.dispatcher.running() > 0 {
            tokio::select! {
                biased;

                Some(completion) = completion_rx.recv() => self.handle_completion(completion),

                Some(request) = control_rx.recv() => self.handle_control(request),

                _ = progress.tick() => {
                    info!(
                        running_inserts = self.dispatcher.running(),
                        queue_length = self.dispatcher.queue_len(),
                        "waiting for in-flight writes",
                    );
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        running_inserts = self.dispatcher.running(),
                        queue_length = self.dispatcher.queue_len(),
                        "drain timeout reached, abandoning in-flight writes",
                    );
                    break;
                }
            }
        }

        if let Some(feed) = self.feed.take() {
            feed.close();
        }
        self.link
            .on_disconnect(Disconnect::Requested, Utc::now(), false);
        self.sync_link_metrics();

        if let Some(publisher) = &self.publisher {
            if self.publisher_connected {
                if let Err(e) = publisher.disconnect().await {
                    warn!(error = %e, "disconnecting publisher");
                }
            }
        }
        self.publisher_connected = false;
        self.metrics.publisher_connected.set(0.0);

        info!(
            processed = self.counters.processed_frames,
            dropped_frames = self.counters.dropped_frames,
            dropped_events = self.dispatcher.dropped_events(),
            total_inserted = self.counters.total_inserted(),
            insert_failures = self.counters.insert_failures,
            publisher_messages = self.counters.publisher_messages,
            publisher_errors = self.counters.publisher_errors,
            "ingester shutdown complete",
        );
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
