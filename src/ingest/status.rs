//! Status snapshot and the rolling insert history behind throughput.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::feed::connection::{ConnectionEvent, LinkState};
use crate::feed::event::{Category, CATEGORY_COUNT};

/// Number of connection history entries included in a snapshot.
pub const SNAPSHOT_HISTORY_LEN: usize = 10;

/// One successful write, kept only to derive throughput.
#[derive(Debug, Clone, Copy)]
pub struct InsertHistoryEntry {
    pub at: Instant,
    pub category: Category,
    pub count: usize,
}

/// Successful writes within a rolling time window.
#[derive(Debug)]
pub struct InsertHistory {
    window: Duration,
    entries: VecDeque<InsertHistoryEntry>,
}

impl InsertHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant, category: Category, count: usize) {
        self.entries.push_back(InsertHistoryEntry {
            at,
            category,
            count,
        });
        self.prune(at);
    }

    /// Drops entries that are at least one window old.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) < self.window {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records per second per category over the window.
    pub fn throughput(&mut self, now: Instant) -> Throughput {
        self.prune(now);

        let mut sums = [0usize; CATEGORY_COUNT];
        for entry in &self.entries {
            sums[entry.category.index()] += entry.count;
        }

        let secs = self.window.as_secs_f64();
        let trades = sums[Category::Trades.index()] as f64 / secs;
        let quotes = sums[Category::Quotes.index()] as f64 / secs;

        Throughput {
            trades_per_second: round_tenth(trades),
            quotes_per_second: round_tenth(quotes),
            total_per_second: round_tenth(trades + quotes),
        }
    }
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    pub trades_per_second: f64,
    pub quotes_per_second: f64,
    pub total_per_second: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSizes {
    pub trades: usize,
    pub quotes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStatus {
    pub enabled: bool,
    pub connected: bool,
    pub messages_produced: u64,
    pub errors: u64,
}

/// Cumulative counters owned by the dispatch loop.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub malformed_frames: u64,
    pub unrecognized_events: u64,
    pub inserted: [u64; CATEGORY_COUNT],
    pub insert_failures: u64,
    pub publisher_messages: u64,
    pub publisher_errors: u64,
}

impl Counters {
    pub fn inserted(&self, category: Category) -> u64 {
        self.inserted[category.index()]
    }

    pub fn total_inserted(&self) -> u64 {
        self.inserted.iter().sum()
    }
}

/// Coarse run status shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Paused,
    Connected,
    Disconnected,
    Stopped,
}

/// Point-in-time read-only projection of the ingester state.
///
/// Durations are reported in seconds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: RunStatus,
    pub link_state: LinkState,
    pub connected: bool,
    pub authenticated: bool,
    pub paused: bool,
    pub should_run: bool,
    pub shutting_down: bool,
    pub uptime: f64,
    pub total_uptime: f64,
    pub time_since_last_disconnect: Option<f64>,
    pub running_inserts: usize,
    pub max_concurrent_inserts: usize,
    pub queue_length: usize,
    pub memory_usage: u64,
    #[serde(rename = "memoryUsageMB")]
    pub memory_usage_mb: u64,
    pub memory_pressure: bool,
    pub processed_messages: u64,
    pub dropped_messages: u64,
    pub dropped_frames: u64,
    pub dropped_events: u64,
    pub dropped_batches: u64,
    pub malformed_frames: u64,
    pub unrecognized_events: u64,
    pub trades_inserted: u64,
    pub quotes_inserted: u64,
    pub total_records_inserted: u64,
    pub insert_failures: u64,
    pub batch_sizes: BatchSizes,
    pub throughput: Throughput,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub status_message: String,
    pub connection_history: Vec<ConnectionEvent>,
    pub connection_started_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_message_time: DateTime<Utc>,
    pub time_since_last_message: f64,
    pub publisher: PublisherStatus,
}
