pub mod backoff;
pub mod classify;
pub mod connection;
pub mod event;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Upper bound on waiting for a client-initiated close frame to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level event tagged with the session that produced it.
#[derive(Debug)]
pub struct FeedEvent {
    pub session: u64,
    pub kind: FeedEventKind,
}

#[derive(Debug)]
pub enum FeedEventKind {
    /// The socket is open; the handshake can start.
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The socket closed.
    Closed { code: Option<u16>, reason: String },
    /// A transport error ended the session.
    Error(String),
    /// The socket could not be opened.
    ConnectFailed(String),
}

/// Command sent to a live session.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Handle to one upstream session.
///
/// Dropping the handle without [`FeedLink::close`] leaves the session task
/// running until the socket ends on its own.
#[derive(Debug)]
pub struct FeedLink {
    session: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Option<JoinHandle<()>>,
}

impl FeedLink {
    /// Wraps a session backed by a spawned transport task.
    pub fn spawned(
        session: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            session,
            outbound,
            task: Some(task),
        }
    }

    /// Wraps a session whose transport lives elsewhere.
    pub fn detached(session: u64, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            session,
            outbound,
            task: None,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Queues a text message; returns false if the session already ended.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Asks the session to close gracefully and detaches from it.
    pub fn close(self) {
        if self.outbound.send(Outbound::Close).is_err() {
            if let Some(task) = self.task {
                task.abort();
            }
        }
    }
}

/// Opens upstream sessions.
///
/// Implementations push every [`FeedEvent`] for the session into `events`
/// and must emit exactly one terminal event (`Closed`, `Error` or
/// `ConnectFailed`) unless the session is closed by the caller.
pub trait FeedConnector: Send + 'static {
    fn open(&self, session: u64, events: mpsc::UnboundedSender<FeedEvent>) -> FeedLink;
}

/// WebSocket connector for the upstream market-data feed.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FeedConnector for WsConnector {
    fn open(&self, session: u64, events: mpsc::UnboundedSender<FeedEvent>) -> FeedLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            self.url.clone(),
            session,
            events,
            outbound_rx,
        ));

        FeedLink::spawned(session, outbound_tx, task)
    }
}

async fn run_session(
    url: String,
    session: u64,
    events: mpsc::UnboundedSender<FeedEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let emit = |kind: FeedEventKind| {
        let _ = events.send(FeedEvent { session, kind });
    };

    tracing::debug!(session, url = %url, "opening feed connection");

    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            emit(FeedEventKind::ConnectFailed(e.to_string()));
            return;
        }
    };

    emit(FeedEventKind::Opened);

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        emit(FeedEventKind::Error(format!("sending message: {e}")));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
                    tracing::debug!(session, "feed connection closed by client");
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => emit(FeedEventKind::Frame(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => emit(FeedEventKind::Frame(text)),
                    Err(e) => tracing::debug!(session, error = %e, "ignoring non-UTF-8 binary frame"),
                },
                // tungstenite queues the pong itself and flushes it on the next read.
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    emit(FeedEventKind::Closed { code, reason });
                    return;
                }
                Some(Err(e)) => {
                    emit(FeedEventKind::Error(e.to_string()));
                    return;
                }
                None => {
                    emit(FeedEventKind::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                    return;
                }
            },
        }
    }
}
