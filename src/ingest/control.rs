//! Lifecycle control: run state, commands and the request channel used by
//! the HTTP surface to talk to the dispatch loop.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::status::{PublisherStatus, RunStatus, StatusSnapshot};

/// Gate for the connection and the flush timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    /// Connect and reconnect when the link drops.
    pub should_run: bool,
    /// Ignore inbound frames and skip timer flushes.
    pub paused: bool,
    /// Graceful shutdown is in progress.
    pub shutting_down: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            should_run: true,
            paused: false,
            shutting_down: false,
        }
    }
}

impl ControlState {
    pub fn can_connect(&self) -> bool {
        self.should_run && !self.shutting_down
    }

    pub fn run_status(&self, connected: bool) -> RunStatus {
        if self.paused {
            RunStatus::Paused
        } else if connected {
            RunStatus::Connected
        } else if !self.should_run {
            RunStatus::Stopped
        } else {
            RunStatus::Disconnected
        }
    }
}

/// Lifecycle and publisher commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Pause,
    Restart,
    PublisherReconnect,
    PublisherTest,
}

impl Command {
    /// Resolves a `/control/{action}` path segment.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "pause" => Some(Self::Pause),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }

    /// Resolves a `/control/publisher/{action}` path segment.
    pub fn from_publisher_action(action: &str) -> Option<Self> {
        match action {
            "reconnect" => Some(Self::PublisherReconnect),
            "test" => Some(Self::PublisherTest),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Restart => "restart",
            Self::PublisherReconnect => "publisher_reconnect",
            Self::PublisherTest => "publisher_test",
        }
    }
}

/// How a command response maps onto a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// The command could not run in the current state.
    Unavailable,
    /// The command ran and failed.
    Failed,
}

/// Reply to a control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip)]
    pub outcome: Outcome,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            connected: None,
            outcome: Outcome::Ok,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            connected: None,
            outcome: Outcome::Unavailable,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            connected: None,
            outcome: Outcome::Failed,
        }
    }

    pub fn with_connected(mut self, connected: bool) -> Self {
        self.connected = Some(connected);
        self
    }
}

/// Request delivered to the dispatch loop.
#[derive(Debug)]
pub enum ControlRequest {
    Command {
        command: Command,
        reply: oneshot::Sender<CommandResponse>,
    },
    Snapshot {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("ingester is not running")]
    Closed,
}

/// Cloneable client side of the control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<ControlRequest>) -> Self {
        Self { tx }
    }

    /// Sends a command and waits for the dispatch loop's reply.
    pub async fn send(&self, command: Command) -> Result<CommandResponse, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest::Command { command, reply })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    /// Fetches a fresh status snapshot.
    pub async fn snapshot(&self) -> Result<StatusSnapshot, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest::Snapshot { reply })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    /// Fetches the publisher section of a status snapshot.
    pub async fn publisher_status(&self) -> Result<PublisherStatus, ControlError> {
        Ok(self.snapshot().await?.publisher)
    }
}
