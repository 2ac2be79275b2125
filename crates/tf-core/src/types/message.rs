//! Bus message and routing-key helpers.
//!
//! Ticker messages are keyed `ticker.<source>.<symbol>` so consumers can
//! filter by source without decoding the payload.

/// Prefix shared by every ticker routing key.
pub const TICKER_KEY_PREFIX: &str = "ticker";

/// A message as delivered by the broker: routing key, raw payload, and the
/// broker-assigned position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

impl BusMessage {
    /// Source id encoded in this message's routing key, if well-formed.
    pub fn source(&self) -> Option<&str> {
        source_of_key(&self.key)
    }
}

/// Build the routing key for a ticker: `ticker.<source>.<symbol>`.
#[inline]
pub fn routing_key(source_id: &str, symbol: &str) -> String {
    format!("{TICKER_KEY_PREFIX}.{source_id}.{symbol}")
}

/// Key prefix that every message from `source_id` starts with.
#[inline]
pub fn source_prefix(source_id: &str) -> String {
    format!("{TICKER_KEY_PREFIX}.{source_id}.")
}

/// Extract the `<source>` segment from a ticker routing key.
///
/// The symbol segment may itself contain dots, so only the first two
/// separators are significant.
pub fn source_of_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(TICKER_KEY_PREFIX)?.strip_prefix('.')?;
    let (source, symbol) = rest.split_once('.')?;
    if source.is_empty() || symbol.is_empty() {
        return None;
    }
    Some(source)
}
