//! Real-time market-data ingester: a streaming feed batched into ClickHouse
//! under bounded memory and bounded write concurrency.

pub mod agent;
pub mod config;
pub mod export;
pub mod feed;
pub mod ingest;
pub mod migrate;
pub mod sink;
