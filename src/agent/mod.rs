use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseWriter;
use crate::feed::WsConnector;
use crate::ingest::Ingester;
use crate::migrate::{ClickHouseMigrator, Migrator, SchemaNames};
use crate::sink::clickhouse::ClickHouseStore;
use crate::sink::http::HttpPublisher;

/// Agent wires every component together: store, publisher, feed, ingester
/// and the HTTP surface.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ch_writer: Option<ClickHouseWriter>,
    ingester: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            ch_writer: None,
            ingester: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin ingesting.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Open the ClickHouse pool. An unreachable server is not fatal:
        //    each write fails and is counted until it comes back.
        let mut writer = ClickHouseWriter::new(self.cfg.clickhouse.clone());
        if let Err(e) = writer.start().await {
            warn!(error = %format!("{e:#}"), "ClickHouse not reachable at startup");
        }

        let pool = writer
            .pool()
            .context("ClickHouse pool not initialized")?
            .clone();
        self.ch_writer = Some(writer);

        // 2. Run migrations if enabled.
        if self.cfg.clickhouse.migrations.enabled {
            self.run_migrations(pool.clone()).await?;
        }

        let store = Arc::new(ClickHouseStore::new(
            pool,
            self.cfg.clickhouse.database.clone(),
            self.cfg.clickhouse.async_insert,
        ));

        // 3. Build the optional publisher.
        let publisher = if self.cfg.publisher.enabled {
            let publisher =
                HttpPublisher::new(self.cfg.publisher.clone()).context("creating publisher")?;
            info!(
                address = %self.cfg.publisher.address,
                compression = %self.cfg.publisher.compression,
                "publisher configured",
            );
            Some(Arc::new(publisher))
        } else {
            None
        };

        // 4. Build the ingester.
        let connector = WsConnector::new(self.cfg.feed.url.clone());
        let ingester = Ingester::new(
            &self.cfg,
            store,
            publisher,
            connector,
            Arc::clone(&self.health),
        );
        let control = ingester.handle();

        // 5. Start the HTTP surface before connecting so probes respond.
        self.health
            .start(control)
            .await
            .context("starting health server")?;

        // 6. Run the dispatch loop.
        let cancel = self.cancel.child_token();
        self.ingester = Some(tokio::spawn(ingester.run(cancel)));

        info!(
            feed = %self.cfg.feed.url,
            endpoint = %self.cfg.clickhouse.endpoint,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal the dispatch loop to drain.
        self.cancel.cancel();

        if let Some(task) = self.ingester.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "ingester stopped with error"),
                Err(e) => error!(error = %e, "ingester task failed"),
            }
        }

        // Stop ClickHouse writer.
        if let Some(writer) = &mut self.ch_writer {
            if let Err(e) = writer.stop().await {
                error!(error = %e, "error stopping ClickHouse writer");
            }
        }

        // Stop health server.
        self.health.stop().await?;

        Ok(())
    }

    /// Run ClickHouse migrations.
    async fn run_migrations(&self, pool: clickhouse_rs::Pool) -> Result<()> {
        info!("running ClickHouse migrations...");

        let migrator =
            ClickHouseMigrator::new(pool, SchemaNames::from_config(&self.cfg.clickhouse));
        migrator.up().await.context("running migrations")?;

        info!("ClickHouse migrations complete");

        Ok(())
    }
}
