//! Embedded ClickHouse schema for the `trades` and `quotes` tables.
//!
//! Every statement is idempotent (`IF NOT EXISTS` / `IF EXISTS`), so a run
//! that fails halfway is simply repeated. Applied versions are appended to
//! `{database}.schema_migrations`; the current version is the highest one.

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::feed::event::Category;

/// Embedded migration. `{database}`, `{trades_table}` and `{quotes_table}`
/// are replaced with the configured names before execution.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_create_trades.up.sql"),
        down_sql: include_str!("sql/001_create_trades.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_create_quotes.up.sql"),
        down_sql: include_str!("sql/002_create_quotes.down.sql"),
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS {database}.schema_migrations (
    version UInt32,
    applied_at DateTime DEFAULT now()
) ENGINE = TinyLog";

/// Applies and rolls back the embedded schema.
pub trait Migrator: Send {
    /// Applies every migration newer than the current version.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the newest applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current schema version; 0 when nothing is applied.
    fn status(&self) -> impl std::future::Future<Output = Result<u32>> + Send;
}

/// Names substituted into the migration templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNames {
    pub database: String,
    pub trades_table: String,
    pub quotes_table: String,
}

impl SchemaNames {
    pub fn from_config(cfg: &ClickHouseConfig) -> Self {
        Self {
            database: cfg.database.clone(),
            trades_table: cfg.tables.get(Category::Trades).clone(),
            quotes_table: cfg.tables.get(Category::Quotes).clone(),
        }
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{database}", &self.database)
            .replace("{trades_table}", &self.trades_table)
            .replace("{quotes_table}", &self.quotes_table)
    }
}

/// Migrations still to apply on top of `current`, oldest first.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// Versions that remain applied after rolling back `current`.
fn remaining_after_rollback(current: u32) -> Vec<u32> {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current)
        .collect()
}

/// Migration runner over the ingest connection pool.
pub struct ClickHouseMigrator {
    pool: Pool,
    names: SchemaNames,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, names: SchemaNames) -> Self {
        Self { pool, names }
    }

    fn versions_table(&self) -> String {
        format!("{}.schema_migrations", self.names.database)
    }

    /// Runs each `;`-separated statement of a rendered template.
    async fn execute(&self, template: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migration")?;

        let sql = self.names.render(template);
        for statement in split_statements(&sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing {preview}...")
            })?;
        }

        Ok(())
    }

    async fn current_version(&self) -> Result<u32> {
        self.execute(VERSION_TABLE).await?;

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query(format!(
                "SELECT toUInt32(max(version)) AS version FROM {}",
                self.versions_table()
            ))
            .fetch_all()
            .await
            .context("querying schema version")?;

        match block.rows().next() {
            Some(row) => row.get::<u32, _>("version").context("reading schema version"),
            None => Ok(0),
        }
    }

    async fn record_versions(&self, versions: &[u32]) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        handle
            .execute(format!("TRUNCATE TABLE {}", self.versions_table()))
            .await
            .context("truncating schema_migrations")?;

        if versions.is_empty() {
            return Ok(());
        }

        let values: Vec<String> = versions.iter().map(|v| format!("({v})")).collect();
        handle
            .execute(format!(
                "INSERT INTO {} (version) VALUES {}",
                self.versions_table(),
                values.join(", ")
            ))
            .await
            .context("recording schema versions")?;

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        let current = self.current_version().await?;
        let mut applied = Vec::new();

        for migration in pending(current) {
            tracing::info!(version = migration.version, "applying migration");
            self.execute(migration.up_sql)
                .await
                .with_context(|| format!("applying migration {}", migration.version))?;
            applied.push(migration.version);
        }

        let Some(&latest) = applied.last() else {
            tracing::info!(version = current, "schema up to date");
            return Ok(());
        };

        let versions: Vec<u32> = MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| *v <= latest)
            .collect();
        self.record_versions(&versions).await?;

        tracing::info!(version = latest, applied = applied.len(), "migrations applied");
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let current = self.current_version().await?;
        if current == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("schema version {current} is unknown to this build"))?;

        tracing::info!(version = current, "rolling back migration");
        self.execute(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration {current}"))?;

        let remaining = remaining_after_rollback(current);
        self.record_versions(&remaining).await?;

        tracing::info!(
            version = remaining.last().copied().unwrap_or(0),
            "rollback completed"
        );
        Ok(())
    }

    async fn status(&self) -> Result<u32> {
        self.current_version().await
    }
}

fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
