pub mod health;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Owns the ClickHouse native TCP connection pool.
///
/// The pool is LZ4-compressed and sized min=2, max=5 through the DSN.
pub struct ClickHouseWriter {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
}

impl ClickHouseWriter {
    /// Creates a new writer with the given configuration.
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    ///
    /// The pool is kept even when the ping fails, so callers may treat an
    /// unreachable server at startup as non-fatal.
    pub async fn start(&mut self) -> Result<()> {
        let pool = Pool::new(self.cfg.dsn());
        self.pool = Some(pool.clone());

        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("opening ClickHouse connection to {}", self.cfg.endpoint))?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse writer connected",
        );

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Returns the writer configuration.
    pub fn config(&self) -> &ClickHouseConfig {
        &self.cfg
    }

    /// Releases the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        if self.pool.take().is_some() {
            tracing::info!("ClickHouse writer stopped");
        }
        Ok(())
    }
}
