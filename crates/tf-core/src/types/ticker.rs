//! Ticker snapshot: the record fetched from a source and persisted by the
//! consumer.
//!
//! # Wire format
//!
//! Snapshots travel on the bus as JSON objects with camelCase field names:
//!
//! ```json
//! {"symbol":"BTC/USDT","timestamp":1700000000000,"open":1.0,"high":1.0,
//!  "low":1.0,"close":1.0,"last":1.0,"previousClose":1.0,"change":0.0,
//!  "percentage":0.0,"baseVolume":10.0,"quoteVolume":10.0}
//! ```
//!
//! `timestamp` is milliseconds since Unix epoch. Price and volume fields may be
//! `null` (or absent) when the source does not provide them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::symbol::{SymbolPair, split_pair};

/// One ticker observation for a symbol at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerSnapshot {
    pub symbol: String,
    pub timestamp: u64,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub last: Option<f64>,
    #[serde(default)]
    pub previous_close: Option<f64>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub base_volume: Option<f64>,
    #[serde(default)]
    pub quote_volume: Option<f64>,
}

/// Why a bus payload could not be turned into a [`TickerSnapshot`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid ticker json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid ticker symbol: {0}")]
    Symbol(String),
}

impl TickerSnapshot {
    /// Create a snapshot with every price/volume field unset.
    pub fn new(symbol: impl Into<String>, timestamp: u64) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open: None,
            high: None,
            low: None,
            close: None,
            last: None,
            previous_close: None,
            change: None,
            percentage: None,
            base_volume: None,
            quote_volume: None,
        }
    }

    /// Base / quote split of this snapshot's symbol.
    pub fn pair(&self) -> Option<SymbolPair<'_>> {
        split_pair(&self.symbol).ok()
    }

    /// Serialize to the bus payload format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a bus payload.
    ///
    /// The symbol must be a `BASE/QUOTE` pair; anything else is rejected
    /// here rather than at storage time.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let snapshot: Self = serde_json::from_slice(payload)?;
        if let Err(e) = split_pair(&snapshot.symbol) {
            return Err(DecodeError::Symbol(e.to_string()));
        }
        Ok(snapshot)
    }
}

impl std::fmt::Display for TickerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ticker({} last={:?} pct={:?} ts={})",
            self.symbol, self.last, self.percentage, self.timestamp
        )
    }
}
