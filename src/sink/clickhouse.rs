use std::fmt::Write;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

use crate::feed::event::EventRecord;

use super::RowStore;

/// Settings appended to inserts when async inserts are enabled.
const ASYNC_INSERT_SETTINGS: &str = "SETTINGS async_insert=1, wait_for_async_insert=0";

/// Row store writing JSONEachRow batches over the native protocol.
///
/// Rows are forwarded as received: the store does not know the table
/// schema and relies on ClickHouse to map JSON fields onto columns.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
    async_insert: bool,
}

impl ClickHouseStore {
    pub fn new(pool: Pool, database: String, async_insert: bool) -> Self {
        Self {
            pool,
            database,
            async_insert,
        }
    }
}

impl RowStore for ClickHouseStore {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn insert(&self, table: &str, rows: &[EventRecord]) -> Result<()> {
        let Some(sql) = build_insert_sql(&self.database, table, rows, self.async_insert)? else {
            return Ok(());
        };

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {table} insert"))?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("inserting {} rows into {table}", rows.len()))?;

        Ok(())
    }
}

/// Builds an `INSERT ... FORMAT JSONEachRow` statement with inline rows.
///
/// Returns `None` when no row survives validation.
pub fn build_insert_sql(
    database: &str,
    table: &str,
    rows: &[EventRecord],
    async_insert: bool,
) -> Result<Option<String>> {
    validate_identifier(database).context("invalid database name")?;
    validate_identifier(table).context("invalid table name")?;

    let mut sql = String::with_capacity(96 + rows.len() * 160);
    let _ = write!(sql, "INSERT INTO {database}.{table} ");
    if async_insert {
        sql.push_str(ASYNC_INSERT_SETTINGS);
        sql.push(' ');
    }
    sql.push_str("FORMAT JSONEachRow\n");

    let mut written = 0usize;
    for row in rows {
        if row.payload().is_empty() {
            tracing::warn!(table, "skipping empty row");
            continue;
        }

        let line = serde_json::to_string(row).context("serializing row to JSON")?;
        sql.push_str(&line);
        sql.push('\n');
        written += 1;
    }

    if written == 0 {
        return Ok(None);
    }

    Ok(Some(sql))
}

/// Accepts plain ClickHouse identifiers only (ASCII alphanumerics and `_`).
fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("identifier is empty");
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        bail!("identifier {name:?} contains invalid character {c:?}");
    }
    Ok(())
}
