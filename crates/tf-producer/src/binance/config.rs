//! Binance-specific configuration extraction.

use tf_core::backoff::BackoffPolicy;
use tf_core::config::ProducerConfig;

/// Parsed Binance configuration.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// REST base URL used for symbol discovery.
    pub rest_url: String,
    /// Combined-stream WebSocket endpoint.
    pub ws_url: String,
    /// Quote assets whose markets are published.
    pub quote_assets: Vec<String>,
    /// Reconnect policy for each shard's stream.
    pub reconnect: BackoffPolicy,
    /// Capacity of the frame channel between the socket task and `watch`.
    pub frame_buffer: usize,
}

impl BinanceConfig {
    pub fn from_producer(conn: &ProducerConfig) -> Self {
        Self {
            rest_url: conn.effective_rest_url().trim_end_matches('/').to_string(),
            ws_url: conn.effective_ws_url(),
            quote_assets: conn.effective_quote_assets(),
            reconnect: conn.effective_fetch_backoff(),
            frame_buffer: 1024,
        }
    }

    pub fn exchange_info_url(&self) -> String {
        format!("{}/api/v3/exchangeInfo", self.rest_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_producer_config() {
        let cfg = BinanceConfig::from_producer(&ProducerConfig::default());
        assert_eq!(cfg.exchange_info_url(), "https://api.binance.com/api/v3/exchangeInfo");
        assert_eq!(cfg.quote_assets, vec!["KRW", "USDT"]);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let conn = ProducerConfig {
            rest_url: Some("http://127.0.0.1:8080/".into()),
            ..Default::default()
        };
        let cfg = BinanceConfig::from_producer(&conn);
        assert_eq!(cfg.exchange_info_url(), "http://127.0.0.1:8080/api/v3/exchangeInfo");
    }
}
