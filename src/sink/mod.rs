pub mod accumulator;
pub mod clickhouse;
pub mod dispatch;
pub mod http;

use anyhow::Result;

use crate::feed::event::{Category, EventRecord};

/// What caused a buffer to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached the batch size threshold.
    Size,
    /// The periodic flush timer fired.
    Timer,
    /// The health monitor detected memory pressure.
    Pressure,
    /// Final flush during graceful shutdown.
    Shutdown,
}

impl FlushTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timer => "timer",
            Self::Pressure => "pressure",
            Self::Shutdown => "shutdown",
        }
    }
}

/// An ordered group of same-category records handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub category: Category,
    pub trigger: FlushTrigger,
    pub records: Vec<EventRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Columnar store accepting row batches.
pub trait RowStore: Send + Sync + 'static {
    /// Returns the store name for logging.
    fn name(&self) -> &str;

    /// Inserts `rows` into `table` as one batch.
    fn insert(
        &self,
        table: &str,
        rows: &[EventRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Best-effort secondary event-log publisher.
pub trait Publisher: Send + Sync + 'static {
    /// Returns the publisher name for logging.
    fn name(&self) -> &str;

    /// Establishes (or re-establishes) the publisher connection.
    fn connect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Releases the publisher connection.
    fn disconnect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Publishes `rows` to `topic`.
    fn send(
        &self,
        topic: &str,
        rows: &[EventRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
