use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::feed::backoff::ReconnectPolicy;
use crate::feed::event::Category;
use crate::sink::http::Compression;

/// Top-level configuration for the tickflow ingester.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream market-data feed configuration.
    #[serde(default)]
    pub feed: FeedConfig,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Batch accumulation and flush timing.
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Write concurrency and overflow queue bounds.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Memory-pressure shedding configuration.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Health monitor and HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Optional secondary event-log publisher.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Graceful shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// A value per tracked category.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PerCategory<T> {
    pub trades: T,
    pub quotes: T,
}

impl<T> PerCategory<T> {
    pub fn get(&self, category: Category) -> &T {
        match category {
            Category::Trades => &self.trades,
            Category::Quotes => &self.quotes,
        }
    }
}

/// Upstream market-data feed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// WebSocket URL. Default: "wss://socket.polygon.io/stocks".
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// API key sent in the authentication message.
    #[serde(default)]
    pub api_key: String,

    /// Subscription pattern per category. Default: "T.*" / "Q.*".
    #[serde(default = "default_subscriptions")]
    pub subscriptions: PerCategory<String>,

    /// Reconnect backoff policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Silence after which a connection is considered stale. Default: 60s.
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    /// Delay between stop and start on restart. Default: 1s.
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect. Default: 5s.
    #[serde(default = "default_reconnect_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Ceiling for any single reconnect delay. Default: 60s.
    #[serde(default = "default_reconnect_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Consecutive attempts before giving up. Default: 10.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default = "default_clickhouse_endpoint")]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Table per category. Default: "trades" / "quotes".
    #[serde(default = "default_tables")]
    pub tables: PerCategory<String>,

    /// Use server-side async inserts. Default: true.
    #[serde(default = "default_true")]
    pub async_insert: bool,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Batch accumulation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Records per category that trigger an immediate flush. Default: 1000.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Period of the flush timer. Default: 2s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Write dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Maximum concurrent store writes. Default: 50.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum queued batches waiting for a write slot. Default: 100.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

/// Memory-pressure configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Resident memory ceiling in bytes. Default: 2GiB.
    #[serde(default = "default_memory_max_bytes")]
    pub max_bytes: u64,

    /// Period of the resident-memory sample. Default: 1s.
    #[serde(default = "default_memory_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
}

/// Health monitor and HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":34567".
    #[serde(default = "default_health_addr")]
    pub addr: String,

    /// Period of the health check. Default: 30s.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Rolling window for throughput. Default: 60s.
    #[serde(default = "default_throughput_window", with = "humantime_serde")]
    pub throughput_window: Duration,
}

/// Secondary event-log publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Enable the publisher. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Base HTTP address; batches go to `{address}/{topic}`.
    #[serde(default)]
    pub address: String,

    /// Topic per category. Default: "stocks-trades" / "stocks-quotes".
    #[serde(default = "default_topics")]
    pub topics: PerCategory<String>,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_publisher_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Maximum wait for in-flight writes. Default: 30s.
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_feed_url() -> String {
    "wss://socket.polygon.io/stocks".to_string()
}

fn default_subscriptions() -> PerCategory<String> {
    PerCategory {
        trades: "T.*".to_string(),
        quotes: "Q.*".to_string(),
    }
}

fn default_stale_after() -> Duration {
    Duration::from_secs(60)
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_base_delay() -> Duration {
    crate::feed::backoff::DEFAULT_BASE_DELAY
}

fn default_reconnect_max_delay() -> Duration {
    crate::feed::backoff::DEFAULT_MAX_DELAY
}

fn default_reconnect_max_attempts() -> u32 {
    crate::feed::backoff::DEFAULT_MAX_ATTEMPTS
}

fn default_clickhouse_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_tables() -> PerCategory<String> {
    PerCategory {
        trades: "trades".to_string(),
        quotes: "quotes".to_string(),
    }
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_max_concurrent() -> usize {
    50
}

fn default_max_queue() -> usize {
    100
}

fn default_memory_max_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_memory_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    ":34567".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_throughput_window() -> Duration {
    Duration::from_secs(60)
}

fn default_topics() -> PerCategory<String> {
    PerCategory {
        trades: "stocks-trades".to_string(),
        quotes: "stocks-quotes".to_string(),
    }
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_publisher_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            feed: FeedConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            batching: BatchingConfig::default(),
            dispatch: DispatchConfig::default(),
            memory: MemoryConfig::default(),
            health: HealthConfig::default(),
            publisher: PublisherConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            api_key: String::new(),
            subscriptions: default_subscriptions(),
            reconnect: ReconnectConfig::default(),
            stale_after: default_stale_after(),
            restart_delay: default_restart_delay(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: default_reconnect_base_delay(),
            max_delay: default_reconnect_max_delay(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_clickhouse_endpoint(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            tables: default_tables(),
            async_insert: true,
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue: default_max_queue(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_memory_max_bytes(),
            sample_interval: default_memory_sample_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
            check_interval: default_check_interval(),
            throughput_window: default_throughput_window(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            topics: default_topics(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_publisher_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            max_attempts: self.max_attempts,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file, apply environment overrides
    /// and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Build configuration from defaults and the environment only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Apply environment-style overrides using `lookup` to resolve keys.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("POLYGON_API_KEY") {
            self.feed.api_key = v;
        }
        if let Some(v) = get("TICKFLOW_FEED_URL") {
            self.feed.url = v;
        }
        if let Some(v) = get("CLICKHOUSE_HOST") {
            self.clickhouse.endpoint = v;
        }
        if let Some(v) = get("CLICKHOUSE_DATABASE") {
            self.clickhouse.database = v;
        }
        if let Some(v) = get("CLICKHOUSE_USERNAME") {
            self.clickhouse.username = v;
        }
        if let Some(v) = get("CLICKHOUSE_PASSWORD") {
            self.clickhouse.password = v;
        }
        if let Some(v) = get("PUBLISHER_ENABLED") {
            self.publisher.enabled = parse_bool(&v)
                .with_context(|| format!("PUBLISHER_ENABLED has invalid value {v:?}"))?;
        }
        if let Some(v) = get("PUBLISHER_ADDRESS") {
            self.publisher.address = v;
        }
        if let Some(v) = get("PORT") {
            let port: u16 = v
                .parse()
                .with_context(|| format!("PORT has invalid value {v:?}"))?;
            self.health.addr = format!(":{port}");
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.feed.url.is_empty() {
            bail!("feed.url is required");
        }

        if self.feed.api_key.is_empty() {
            bail!("feed.api_key is required (or set POLYGON_API_KEY)");
        }

        for category in Category::ALL {
            if self.feed.subscriptions.get(category).is_empty() {
                bail!("feed.subscriptions.{category} must not be empty");
            }
        }

        let reconnect = &self.feed.reconnect;
        if reconnect.base_delay.is_zero() {
            bail!("feed.reconnect.base_delay must be positive");
        }
        if reconnect.max_delay < reconnect.base_delay {
            bail!("feed.reconnect.max_delay must be >= feed.reconnect.base_delay");
        }

        if self.feed.stale_after.is_zero() {
            bail!("feed.stale_after must be positive");
        }

        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if !is_identifier(&self.clickhouse.database) {
            bail!(
                "clickhouse.database must contain only ASCII letters, digits and '_': {:?}",
                self.clickhouse.database
            );
        }

        for category in Category::ALL {
            let table = self.clickhouse.tables.get(category);
            if !is_identifier(table) {
                bail!(
                    "clickhouse.tables.{category} must contain only ASCII letters, digits and '_': {table:?}"
                );
            }
        }

        if self.batching.max_batch_size == 0 {
            bail!("batching.max_batch_size must be positive");
        }

        if self.batching.flush_interval.is_zero() {
            bail!("batching.flush_interval must be positive");
        }

        if self.dispatch.max_concurrent == 0 {
            bail!("dispatch.max_concurrent must be positive");
        }

        if self.dispatch.max_queue == 0 {
            bail!("dispatch.max_queue must be positive");
        }

        if self.memory.max_bytes == 0 {
            bail!("memory.max_bytes must be positive");
        }

        if self.memory.sample_interval.is_zero() {
            bail!("memory.sample_interval must be positive");
        }

        if self.health.check_interval.is_zero() {
            bail!("health.check_interval must be positive");
        }

        if self.health.throughput_window.is_zero() {
            bail!("health.throughput_window must be positive");
        }

        if self.publisher.enabled {
            if self.publisher.address.is_empty() {
                bail!("publisher.address is required when enabled");
            }

            for category in Category::ALL {
                if self.publisher.topics.get(category).is_empty() {
                    bail!("publisher.topics.{category} must not be empty when enabled");
                }
            }
        }

        self.publisher.compression.parse::<Compression>()?;

        Ok(())
    }
}

impl ClickHouseConfig {
    /// Builds a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
