//! Configuration parsing for the ingestion pipeline.
//!
//! Producer and consumer processes read their settings from a single JSON
//! file. Every field is optional; the `effective_*` accessors apply the
//! defaults so callers never branch on `None` themselves. CLI flags override
//! individual values after loading (see `tf-runner`).
//!
//! # Example config
//!
//! ```json
//! {
//!   "broker": { "kind": "kafka", "brokers": "kafka-1:9092,kafka-2:9092", "topic": "ticker" },
//!   "producer": { "source": "binance", "source_id": "binance", "chunk_size": 20 },
//!   "consumer": { "chunk_size": 50, "extra_recoverable_codes": ["53300"] },
//!   "store": { "url": "postgres://tickerflow@db:5432/tickerflow", "max_connections": 8 },
//!   "monitor": { "producer_url": "http://monitor:8080/producer" },
//!   "log": { "level": "info", "dir": "/var/log/tickerflow" }
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::TfError;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Which message-bus backend to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; producer and consumer must share the process.
    #[default]
    Memory,
    /// Kafka cluster (requires the `kafka` cargo feature).
    Kafka,
}

impl std::str::FromStr for BrokerKind {
    type Err = TfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "kafka" => Ok(Self::Kafka),
            other => Err(TfError::Config(format!("unknown broker kind: {other}"))),
        }
    }
}

/// Message-bus connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    pub kind: Option<BrokerKind>,
    /// Comma-separated bootstrap servers (default: `localhost:9092`).
    pub brokers: Option<String>,
    /// Primary ticker topic (default: `ticker`).
    pub topic: Option<String>,
    /// Dead-letter topic (default: `ticker.dlq`).
    pub dlq_topic: Option<String>,
    /// Consumer group id (default: `tickerflow-consumer-group`).
    pub group_id: Option<String>,
    /// Client id reported to the broker.
    pub client_id: Option<String>,
    /// Partition count for the in-memory broker (default: 4).
    pub partitions: Option<u32>,
    /// Unconsumed-message cap above which the in-memory broker signals
    /// backpressure (default: unbounded).
    pub max_pending: Option<usize>,
    /// Per-publish delivery timeout in milliseconds (default: 5000).
    pub publish_timeout_ms: Option<u64>,
    /// How long startup waits for the cluster to answer, in milliseconds
    /// (default: 10000).
    pub connect_timeout_ms: Option<u64>,
}

impl BrokerConfig {
    pub fn effective_kind(&self) -> BrokerKind {
        self.kind.unwrap_or_default()
    }

    pub fn effective_brokers(&self) -> String {
        self.brokers.clone().unwrap_or_else(|| "localhost:9092".into())
    }

    pub fn effective_topic(&self) -> String {
        self.topic.clone().unwrap_or_else(|| "ticker".into())
    }

    pub fn effective_dlq_topic(&self) -> String {
        self.dlq_topic.clone().unwrap_or_else(|| "ticker.dlq".into())
    }

    pub fn effective_group_id(&self) -> String {
        self.group_id.clone().unwrap_or_else(|| "tickerflow-consumer-group".into())
    }

    /// Client id, falling back to `tickerflow-<role>`.
    pub fn effective_client_id(&self, role: &str) -> String {
        self.client_id.clone().unwrap_or_else(|| format!("tickerflow-{role}"))
    }

    pub fn effective_partitions(&self) -> u32 {
        self.partitions.unwrap_or(4).max(1)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms.unwrap_or(5000))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(10_000))
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Upstream source variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Live Binance spot market.
    #[default]
    Binance,
    /// Synthetic ticker generator for local runs.
    Mock,
}

impl std::str::FromStr for SourceKind {
    type Err = TfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binance" | "live" => Ok(Self::Binance),
            "mock" => Ok(Self::Mock),
            other => Err(TfError::Config(format!("unknown source: {other}"))),
        }
    }
}

/// What happens when a shard's retry queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming item.
    RejectNew,
}

/// Producer-side settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProducerConfig {
    /// Reported producer id (default: process id).
    pub producer_id: Option<String>,
    pub source: Option<SourceKind>,
    /// Source id used in routing keys (default: `binance` / `mock`).
    pub source_id: Option<String>,
    /// Symbols per shard (default: 10).
    pub chunk_size: Option<usize>,
    /// Synthetic ticks per second per shard (default: 100).
    pub tps: Option<u32>,
    /// Number of synthetic symbols (default: 100).
    pub symbol_count: Option<usize>,
    /// Quote assets kept by live symbol discovery (default: KRW, USDT).
    pub quote_assets: Option<Vec<String>>,
    /// Live source REST base URL (default: `https://api.binance.com`).
    pub rest_url: Option<String>,
    /// Live source WebSocket URL (default: `wss://stream.binance.com:9443/stream`).
    pub ws_url: Option<String>,
    /// Retry buffer flush period in milliseconds (default: 3000).
    pub retry_flush_interval_ms: Option<u64>,
    /// Retry buffer capacity per shard (default: 10_000).
    pub retry_capacity: Option<usize>,
    pub retry_overflow: Option<OverflowPolicy>,
    /// Backoff between failed fetches.
    pub fetch_backoff: Option<BackoffPolicy>,
}

impl ProducerConfig {
    pub fn effective_producer_id(&self) -> String {
        self.producer_id.clone().unwrap_or_else(|| std::process::id().to_string())
    }

    pub fn effective_source(&self) -> SourceKind {
        self.source.unwrap_or_default()
    }

    pub fn effective_source_id(&self) -> String {
        self.source_id.clone().unwrap_or_else(|| match self.effective_source() {
            SourceKind::Binance => "binance".into(),
            SourceKind::Mock => "mock".into(),
        })
    }

    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(10).max(1)
    }

    pub fn effective_tps(&self) -> u32 {
        self.tps.unwrap_or(100).max(1)
    }

    pub fn effective_symbol_count(&self) -> usize {
        self.symbol_count.unwrap_or(100)
    }

    pub fn effective_quote_assets(&self) -> Vec<String> {
        self.quote_assets.clone().unwrap_or_else(|| vec!["KRW".into(), "USDT".into()])
    }

    pub fn effective_rest_url(&self) -> String {
        self.rest_url.clone().unwrap_or_else(|| "https://api.binance.com".into())
    }

    pub fn effective_ws_url(&self) -> String {
        self.ws_url.clone().unwrap_or_else(|| "wss://stream.binance.com:9443/stream".into())
    }

    pub fn retry_flush_interval(&self) -> Duration {
        Duration::from_millis(self.retry_flush_interval_ms.unwrap_or(3000))
    }

    pub fn effective_retry_capacity(&self) -> usize {
        self.retry_capacity.unwrap_or(10_000).max(1)
    }

    pub fn effective_retry_overflow(&self) -> OverflowPolicy {
        self.retry_overflow.unwrap_or_default()
    }

    pub fn effective_fetch_backoff(&self) -> BackoffPolicy {
        self.fetch_backoff.clone().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Consumer-side settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerConfig {
    /// Reported consumer id (default: process id).
    pub consumer_id: Option<String>,
    /// Only persist messages keyed `ticker.<source_filter>.*`.
    pub source_filter: Option<String>,
    /// Messages per persistence chunk (default: 50).
    pub chunk_size: Option<usize>,
    /// How long one poll waits for messages, in milliseconds (default: 500).
    pub poll_timeout_ms: Option<u64>,
    /// Upper bound on messages per delivered batch (default: 500).
    pub max_batch: Option<usize>,
    /// Delay between a forced redelivery and the next poll.
    pub redelivery_backoff: Option<BackoffPolicy>,
    /// Storage error codes treated as recoverable in addition to the
    /// built-in network codes.
    #[serde(default)]
    pub extra_recoverable_codes: Vec<String>,
}

impl ConsumerConfig {
    pub fn effective_consumer_id(&self) -> String {
        self.consumer_id.clone().unwrap_or_else(|| std::process::id().to_string())
    }

    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(50).max(1)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.unwrap_or(500))
    }

    pub fn effective_max_batch(&self) -> usize {
        self.max_batch.unwrap_or(500).max(1)
    }

    pub fn effective_redelivery_backoff(&self) -> BackoffPolicy {
        self.redelivery_backoff.clone().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where the consumer persists tickers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// PostgreSQL `tickers` table.
    #[default]
    Postgres,
    /// In-process map; only accepted in local mode.
    Memory,
}

/// Ticker storage settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub kind: Option<StoreKind>,
    /// Connection URL. Falls back to `DATABASE_URL`, then to
    /// `postgres://postgres@localhost:5432/tickerflow`.
    pub url: Option<String>,
    /// Pool size (default: 10).
    pub max_connections: Option<u32>,
    /// Connection acquire timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn effective_kind(&self) -> StoreKind {
        self.kind.unwrap_or_default()
    }

    pub fn effective_url(&self) -> String {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_else(|| "postgres://postgres@localhost:5432/tickerflow".into())
    }

    pub fn effective_max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(10).max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(5000))
    }
}

// ---------------------------------------------------------------------------
// Monitor / logging
// ---------------------------------------------------------------------------

/// External monitoring endpoint settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    /// Producer report endpoint. `None` logs reports instead.
    pub producer_url: Option<String>,
    /// Consumer report endpoint. `None` logs reports instead.
    pub consumer_url: Option<String>,
    /// Report period in milliseconds (default: 1000).
    pub report_interval_ms: Option<u64>,
    /// HTTP timeout in milliseconds (default: 2000).
    pub timeout_ms: Option<u64>,
}

impl MonitorConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.unwrap_or(1000).max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(2000))
    }
}

/// Logging settings; CLI flags take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    pub level: Option<String>,
    pub dir: Option<String>,
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}
