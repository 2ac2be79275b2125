//! Binance live ticker source.
//!
//! - `targets` loads `/api/v3/exchangeInfo` over REST and keeps trading
//!   markets quoted in the configured assets.
//! - Each shard handle opens one combined WebSocket stream for its symbols'
//!   `@ticker` channels on the first `watch`, then returns one parsed
//!   `24hrTicker` event per call.

pub mod config;
pub mod json_parser;

use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use tf_core::TickerSnapshot;
use tf_core::error::TfError;
use tf_core::ws::{WsConnConfig, WsConnection};
use tokio::sync::mpsc;
use tracing::{debug, info};

use self::config::BinanceConfig;
use crate::source::{SourceConnector, SourceHandle};

const REST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BinanceSource {
    config: BinanceConfig,
    client: reqwest::Client,
}

impl BinanceSource {
    pub fn new(config: BinanceConfig) -> Result<Self, TfError> {
        let client = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(|e| TfError::Source(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SourceConnector for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    async fn targets(&self, source_id: &str) -> Result<Vec<String>, TfError> {
        let url = self.config.exchange_info_url();
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TfError::Source(format!("{url}: {e}")))?
            .json()
            .await
            .map_err(|e| TfError::Source(format!("{url}: {e}")))?;

        let markets = json_parser::parse_exchange_info(&body, &self.config.quote_assets);
        info!("[{source_id}] {} markets quoted in {:?}", markets.len(), self.config.quote_assets);
        Ok(markets.into_iter().map(|m| m.symbol).collect())
    }

    async fn create_handle(&self, source_id: &str) -> Result<Box<dyn SourceHandle>, TfError> {
        Ok(Box::new(BinanceHandle::new(source_id, self.config.clone())))
    }
}

/// One combined ticker stream, opened lazily.
pub struct BinanceHandle {
    source_id: String,
    config: BinanceConfig,
    conn: Option<WsConnection>,
    frames: Option<mpsc::Receiver<String>>,
    index: AHashMap<String, String>,
}

impl BinanceHandle {
    pub fn new(source_id: &str, config: BinanceConfig) -> Self {
        Self {
            source_id: source_id.to_string(),
            config,
            conn: None,
            frames: None,
            index: AHashMap::new(),
        }
    }

    fn connect(&mut self, symbols: &[String]) {
        let (tx, rx) = mpsc::channel(self.config.frame_buffer);
        let mut conn = WsConnection::new(WsConnConfig {
            url: self.config.ws_url.clone(),
            subscribe_msg: Some(json_parser::build_ticker_subscribe(symbols)),
            ping_interval: None,
            reconnect: self.config.reconnect.clone(),
            label: format!("{}-ws", self.source_id),
        });
        conn.start(tx);
        self.index = json_parser::symbol_index(symbols);
        self.conn = Some(conn);
        self.frames = Some(rx);
        debug!("[{}] streaming {} symbols", self.source_id, symbols.len());
    }
}

#[async_trait]
impl SourceHandle for BinanceHandle {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn watch(&mut self, symbols: &[String]) -> Result<TickerSnapshot, TfError> {
        if symbols.is_empty() {
            return Err(TfError::Source("watch called without symbols".into()));
        }
        if self.frames.is_none() {
            self.connect(symbols);
        }
        let Some(frames) = self.frames.as_mut() else {
            return Err(TfError::Source("stream not connected".into()));
        };
        loop {
            let Some(text) = frames.recv().await else {
                self.frames = None;
                self.conn = None;
                return Err(TfError::Source("ticker stream closed".into()));
            };
            if let Some(ticker) = json_parser::parse_message(&text, &self.index) {
                return Ok(ticker);
            }
        }
    }

    async fn close(&mut self) {
        self.frames = None;
        if let Some(mut conn) = self.conn.take() {
            conn.stop().await;
        }
    }
}
