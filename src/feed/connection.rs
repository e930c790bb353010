//! Connection Manager state machine.
//!
//! Owns [`ConnectionState`], the handshake progression and the reconnect
//! bookkeeping. It performs no I/O: callers feed it transport events and it
//! returns the outbound messages to send or the reconnect decision to act
//! on. Every transition is recorded in a bounded history for diagnostics.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use super::backoff::ReconnectPolicy;
use super::event::{StatusKind, StatusRecord};

/// Maximum number of connection events retained.
pub const HISTORY_CAPACITY: usize = 50;

/// Handshake progression of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Subscribing,
    Active,
    GivenUp,
}

impl LinkState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::GivenUp => "given_up",
        }
    }
}

/// Connection facts exposed through the status snapshot.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connected: bool,
    pub authenticated: bool,
    pub reconnect_attempts: u32,
    pub connection_started_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_message_at: DateTime<Utc>,
}

/// Kind of a connection history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
    Disconnected,
    Error,
    ConnectionFailed,
    Stale,
    Stopped,
    ReconnectScheduled,
    GaveUp,
}

impl ConnectionEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Subscribed => "subscribed",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::ConnectionFailed => "connection_failed",
            Self::Stale => "stale",
            Self::Stopped => "stopped",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::GaveUp => "gave_up",
        }
    }
}

/// One diagnostic connection history entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub event: ConnectionEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub reconnect_attempts: u32,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The upstream or transport closed the socket.
    Closed { code: Option<u16>, reason: String },
    /// A transport error ended the session.
    Error(String),
    /// The connection could not be established.
    ConnectFailed(String),
    /// The liveness watchdog force-closed a silent connection.
    Stale,
    /// A stop or restart command closed the connection.
    Requested,
}

impl Disconnect {
    fn event_kind(&self) -> ConnectionEventKind {
        match self {
            Self::Closed { .. } => ConnectionEventKind::Disconnected,
            Self::Error(_) => ConnectionEventKind::Error,
            Self::ConnectFailed(_) => ConnectionEventKind::ConnectionFailed,
            Self::Stale => ConnectionEventKind::Stale,
            Self::Requested => ConnectionEventKind::Stopped,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Closed { code, reason } => Some(match code {
                Some(code) if reason.is_empty() => format!("code {code}"),
                Some(code) => format!("code {code}: {reason}"),
                None => reason.clone(),
            }),
            Self::Error(msg) | Self::ConnectFailed(msg) => Some(msg.clone()),
            Self::Stale => Some("no messages within stale threshold".to_string()),
            Self::Requested => None,
        }
    }
}

/// Outcome of [`ConnectionManager::schedule_reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Connect again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is exhausted.
    GiveUp,
}

/// Upstream connection state machine.
#[derive(Debug)]
pub struct ConnectionManager {
    policy: ReconnectPolicy,
    api_key: String,
    subscriptions: Vec<String>,
    link: LinkState,
    state: ConnectionState,
    accumulated_uptime: Duration,
    history: VecDeque<ConnectionEvent>,
    status_message: String,
    session: u64,
    recorded: u64,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// `subscriptions` are the per-category patterns sent after a successful
    /// authentication, in order.
    pub fn new(
        policy: ReconnectPolicy,
        api_key: String,
        subscriptions: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            policy,
            api_key,
            subscriptions,
            link: LinkState::Disconnected,
            state: ConnectionState {
                connected: false,
                authenticated: false,
                reconnect_attempts: 0,
                connection_started_at: None,
                last_disconnected_at: None,
                last_message_at: now,
            },
            accumulated_uptime: Duration::ZERO,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            status_message: "Initializing...".to_string(),
            session: 0,
            recorded: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
    }

    /// Full retained history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ConnectionEvent> {
        self.history.iter()
    }

    /// The most recent `n` history entries, oldest first.
    pub fn recent_history(&self, n: usize) -> Vec<ConnectionEvent> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Total history entries ever recorded, including evicted ones.
    pub fn recorded_events(&self) -> u64 {
        self.recorded
    }

    /// Starts a connection attempt and returns its session id.
    pub fn begin_connect(&mut self, now: DateTime<Utc>) -> u64 {
        self.session += 1;
        self.link = LinkState::Connecting;
        self.status_message = format!(
            "Connecting... (attempt {})",
            self.state.reconnect_attempts + 1
        );
        self.record(ConnectionEventKind::Connecting, None, now);
        self.session
    }

    /// Handles the transport opening; returns the authentication message.
    pub fn on_open(&mut self, now: DateTime<Utc>) -> String {
        self.state.connected = true;
        self.state.authenticated = false;
        self.state.reconnect_attempts = 0;
        self.state.connection_started_at = Some(now);
        self.state.last_message_at = now;
        self.link = LinkState::AwaitingAuth;
        self.status_message = "Connected - Authenticating...".to_string();
        self.record(ConnectionEventKind::Connected, None, now);

        json!({"action": "auth", "params": self.api_key}).to_string()
    }

    /// Records inbound traffic for the liveness watchdog.
    pub fn on_message(&mut self, now: DateTime<Utc>) {
        self.state.last_message_at = now;
    }

    /// Applies a status record; returns subscription messages to send.
    pub fn on_status(&mut self, status: &StatusRecord, now: DateTime<Utc>) -> Vec<String> {
        match &status.kind {
            StatusKind::Connected => {
                self.status_message = "Connection initialized".to_string();
                Vec::new()
            }
            StatusKind::AuthSuccess => {
                if self.link != LinkState::AwaitingAuth {
                    return Vec::new();
                }

                self.state.authenticated = true;
                self.link = LinkState::Subscribing;
                self.record(ConnectionEventKind::Authenticated, None, now);

                let messages = self
                    .subscriptions
                    .iter()
                    .map(|pattern| json!({"action": "subscribe", "params": pattern}).to_string())
                    .collect();

                self.link = LinkState::Active;
                self.status_message = "Active - Receiving data".to_string();
                self.record(
                    ConnectionEventKind::Subscribed,
                    Some(self.subscriptions.join(",")),
                    now,
                );

                messages
            }
            StatusKind::Other(other) => {
                self.status_message = match &status.message {
                    Some(message) => format!("Status: {other} ({message})"),
                    None => format!("Status: {other}"),
                };
                Vec::new()
            }
        }
    }

    /// Handles the end of a connection.
    ///
    /// Returns false when there was no connection to end (already
    /// disconnected or given up), in which case nothing changes.
    pub fn on_disconnect(
        &mut self,
        cause: Disconnect,
        now: DateTime<Utc>,
        will_reconnect: bool,
    ) -> bool {
        if matches!(self.link, LinkState::Disconnected | LinkState::GivenUp) {
            return false;
        }

        if let Some(started) = self.state.connection_started_at.take() {
            self.accumulated_uptime += elapsed(started, now);
        }

        self.state.connected = false;
        self.state.authenticated = false;
        self.state.last_disconnected_at = Some(now);
        self.link = LinkState::Disconnected;
        self.status_message = if will_reconnect {
            "Disconnected - Will reconnect...".to_string()
        } else {
            "Disconnected".to_string()
        };
        self.record(cause.event_kind(), cause.detail(), now);

        true
    }

    /// Decides whether and when to reconnect after a disconnect.
    pub fn schedule_reconnect(&mut self, now: DateTime<Utc>) -> ReconnectDecision {
        if self.policy.exhausted(self.state.reconnect_attempts) {
            self.link = LinkState::GivenUp;
            self.status_message = "Max reconnection attempts reached".to_string();
            self.record(ConnectionEventKind::GaveUp, None, now);
            return ReconnectDecision::GiveUp;
        }

        self.state.reconnect_attempts += 1;
        let attempt = self.state.reconnect_attempts;
        let delay = self.policy.delay_for_attempt(attempt);

        self.status_message = format!("Reconnecting in {}s...", delay.as_secs());
        self.record(
            ConnectionEventKind::ReconnectScheduled,
            Some(format!("attempt {attempt} in {}ms", delay.as_millis())),
            now,
        );

        ReconnectDecision::Retry { attempt, delay }
    }

    /// Time connected in the current session.
    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        self.state
            .connection_started_at
            .map_or(Duration::ZERO, |started| elapsed(started, now))
    }

    /// Cumulative connected time across all sessions.
    pub fn total_uptime(&self, now: DateTime<Utc>) -> Duration {
        self.accumulated_uptime + self.uptime(now)
    }

    pub fn time_since_last_disconnect(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.state
            .last_disconnected_at
            .map(|at| elapsed(at, now))
    }

    fn record(&mut self, event: ConnectionEventKind, detail: Option<String>, now: DateTime<Utc>) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.recorded += 1;
        self.history.push_back(ConnectionEvent {
            timestamp: now,
            event,
            detail,
            reconnect_attempts: self.state.reconnect_attempts,
        });
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}
