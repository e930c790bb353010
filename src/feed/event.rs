use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Field carrying the event-type discriminator on every upstream record.
pub const DISCRIMINATOR_FIELD: &str = "ev";

/// Discriminator of control/status records.
pub const STATUS_DISCRIMINATOR: &str = "status";

/// Category identifies one of the tracked market-data event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Trade executions (`ev == "T"`).
    Trades,
    /// Quote updates (`ev == "Q"`).
    Quotes,
}

/// Number of categories, used for fixed-size per-category arrays.
pub const CATEGORY_COUNT: usize = 2;

impl Category {
    /// All categories in flush order.
    pub const ALL: [Category; CATEGORY_COUNT] = [Category::Trades, Category::Quotes];

    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Quotes => "quotes",
        }
    }

    /// Returns the upstream discriminator value for this category.
    pub const fn discriminator(self) -> &'static str {
        match self {
            Self::Trades => "T",
            Self::Quotes => "Q",
        }
    }

    /// Resolves an upstream discriminator to a category.
    pub fn from_discriminator(ev: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.discriminator() == ev)
    }

    /// Dense index for per-category arrays.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schemaless record payload: field name to JSON value.
pub type Payload = Map<String, Value>;

/// A classified inbound event.
///
/// The discriminator field has already been stripped from the payload, so
/// serializing a record yields exactly the row that gets stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    category: Category,
    payload: Payload,
}

impl EventRecord {
    pub fn new(category: Category, payload: Payload) -> Self {
        Self { category, payload }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.payload.serialize(serializer)
    }
}

/// Sub-status carried by a status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKind {
    /// The upstream accepted the socket and awaits authentication.
    Connected,
    /// Authentication succeeded; subscriptions may be sent.
    AuthSuccess,
    /// Any other status (e.g. `auth_failed`, `success`).
    Other(String),
}

impl StatusKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "connected" => Self::Connected,
            "auth_success" => Self::AuthSuccess,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A control/status record routed to the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub kind: StatusKind,
    pub message: Option<String>,
}

impl StatusRecord {
    /// Builds a status record from a raw upstream object.
    pub fn from_payload(payload: &Payload) -> Self {
        let kind = payload
            .get("status")
            .and_then(Value::as_str)
            .map(StatusKind::parse)
            .unwrap_or_else(|| StatusKind::Other(String::new()));
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self { kind, message }
    }
}
