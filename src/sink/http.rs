use std::io::Write;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::config::PublisherConfig;
use crate::feed::event::EventRecord;

use super::Publisher;

/// Body compression for published batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "zlib" => Ok(Self::Zlib),
            "snappy" => Ok(Self::Snappy),
            other => bail!("invalid compression type: {other}"),
        }
    }
}

impl Compression {
    /// Returns the Content-Encoding header value, if any.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    pub fn encode(self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data),
            Self::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&data).context("gzip write")?;
                encoder.finish().context("gzip finish")
            }
            Self::Zstd => zstd::encode_all(data.as_slice(), 0).context("zstd encode"),
            Self::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&data).context("zlib write")?;
                encoder.finish().context("zlib finish")
            }
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(&data)
                .context("snappy encode"),
        }
    }
}

/// Event-log publisher posting NDJSON batches to `{address}/{topic}`.
///
/// The client is created on [`Publisher::connect`] and dropped on
/// [`Publisher::disconnect`]; sends while disconnected fail.
pub struct HttpPublisher {
    cfg: PublisherConfig,
    compression: Compression,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpPublisher {
    pub fn new(cfg: PublisherConfig) -> Result<Self> {
        let compression = cfg.compression.parse()?;
        Ok(Self {
            cfg,
            compression,
            client: Mutex::new(None),
        })
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/{}", self.cfg.address.trim_end_matches('/'), topic)
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.cfg.timeout);
        if !self.cfg.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        builder.build().context("building HTTP client")
    }
}

impl Publisher for HttpPublisher {
    fn name(&self) -> &str {
        "http"
    }

    async fn connect(&self) -> Result<()> {
        let client = self.build_client()?;

        // Any HTTP response proves reachability; only transport errors fail.
        let resp = client
            .head(&self.cfg.address)
            .send()
            .await
            .with_context(|| format!("probing publisher at {}", self.cfg.address))?;

        tracing::info!(
            address = %self.cfg.address,
            status = %resp.status(),
            "event-log publisher connected",
        );

        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.lock().take();
        Ok(())
    }

    async fn send(&self, topic: &str, rows: &[EventRecord]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let client = self.client.lock().clone();
        let Some(client) = client else {
            bail!("publisher is not connected");
        };

        let body = encode_ndjson(rows)?;
        let raw_len = body.len();
        let body = self
            .compression
            .encode(body)
            .context("compressing NDJSON data")?;

        let mut request = client
            .post(self.topic_url(topic))
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = self.compression.content_encoding() {
            request = request.header("Content-Encoding", encoding);
        }
        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("publishing to topic {topic}"))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("publisher returned unexpected status {status} for topic {topic}");
        }

        tracing::debug!(topic, rows = rows.len(), bytes = raw_len, "published batch");

        Ok(())
    }
}

/// Serializes rows as newline-delimited JSON.
fn encode_ndjson(rows: &[EventRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(rows.len() * 160);
    for row in rows {
        serde_json::to_writer(&mut buf, row).context("serializing row to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}
