//! Binance JSON parsing.
//!
//! Covers the REST `exchangeInfo` document (symbol discovery) and the
//! `24hrTicker` events of the combined WebSocket stream. Numeric fields
//! arrive as strings and are converted with `fast-float2`.

use ahash::AHashMap;
use tf_core::types::{TickerSnapshot, join_pair};
use tf_core::time_util;

use crate::json_util::{parse_f64_field, parse_str_u64};

/// A tradable market from `exchangeInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    /// Exchange-native symbol, e.g. `BTCUSDT`.
    pub id: String,
    /// Unified symbol, e.g. `BTC/USDT`.
    pub symbol: String,
}

/// Markets in `TRADING` status whose quote asset is in `quote_assets`.
pub fn parse_exchange_info(v: &serde_json::Value, quote_assets: &[String]) -> Vec<Market> {
    let Some(symbols) = v.get("symbols").and_then(|s| s.as_array()) else {
        return Vec::new();
    };
    symbols
        .iter()
        .filter_map(|s| {
            let status = s.get("status")?.as_str()?;
            let base = s.get("baseAsset")?.as_str()?;
            let quote = s.get("quoteAsset")?.as_str()?;
            if status != "TRADING" || !quote_assets.iter().any(|q| q == quote) {
                return None;
            }
            Some(Market {
                id: s.get("symbol")?.as_str()?.to_string(),
                symbol: join_pair(base, quote),
            })
        })
        .collect()
}

/// Exchange-native id for a unified symbol: `BTC/USDT` -> `BTCUSDT`.
#[inline]
pub fn market_id(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// Index from exchange-native id to unified symbol for the given symbols.
pub fn symbol_index(symbols: &[String]) -> AHashMap<String, String> {
    symbols.iter().map(|s| (market_id(s), s.clone())).collect()
}

/// Build the subscription message for the ticker channels of `symbols`.
pub fn build_ticker_subscribe(symbols: &[String]) -> String {
    let params: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@ticker", market_id(s).to_lowercase()))
        .collect();
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": 1
    })
    .to_string()
}

/// Parse one combined-stream frame into a ticker.
///
/// Returns `None` for frames that are not ticker events (subscription acks,
/// other channels) and for symbols not present in `index`.
pub fn parse_message(text: &str, index: &AHashMap<String, String>) -> Option<TickerSnapshot> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    // Combined streams wrap the event as {"stream": ..., "data": {...}}.
    let event = v.get("data").unwrap_or(&v);
    if event.get("e")?.as_str()? != "24hrTicker" {
        return None;
    }
    let symbol = index.get(event.get("s")?.as_str()?)?;
    parse_ticker_event(event, symbol)
}

fn parse_ticker_event(v: &serde_json::Value, symbol: &str) -> Option<TickerSnapshot> {
    let timestamp = parse_str_u64(v.get("E")).unwrap_or_else(time_util::now_ms);
    let close = parse_f64_field(v, "c")?;

    let mut t = TickerSnapshot::new(symbol, timestamp);
    t.close = Some(close);
    t.last = Some(close);
    t.open = parse_f64_field(v, "o");
    t.high = parse_f64_field(v, "h");
    t.low = parse_f64_field(v, "l");
    t.previous_close = parse_f64_field(v, "x");
    t.change = parse_f64_field(v, "p");
    t.percentage = parse_f64_field(v, "P");
    t.base_volume = parse_f64_field(v, "v");
    t.quote_volume = parse_f64_field(v, "q");
    Some(t)
}
