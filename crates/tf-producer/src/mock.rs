//! Synthetic ticker source.
//!
//! Offers `MOCK/MOCK-<i>` symbols and emits one ticker per tick at `tps`
//! ticks per second, cycling through the watched symbols in order.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tf_core::TickerSnapshot;
use tf_core::error::TfError;
use tf_core::time_util;
use tokio::time::{Interval, MissedTickBehavior};

use crate::source::{SourceConnector, SourceHandle};

const PRICE_MIN: f64 = 120_000_000.0;
const PRICE_MAX: f64 = 130_000_000.0;
const VOLUME_MIN: f64 = 500.0;
const VOLUME_MAX: f64 = 3_000.0;

pub struct MockSource {
    tps: u32,
    symbol_count: usize,
}

impl MockSource {
    pub fn new(tps: u32, symbol_count: usize) -> Self {
        Self {
            tps: tps.max(1),
            symbol_count,
        }
    }
}

#[async_trait]
impl SourceConnector for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn targets(&self, _source_id: &str) -> Result<Vec<String>, TfError> {
        Ok((0..self.symbol_count).map(|i| format!("MOCK/MOCK-{i}")).collect())
    }

    async fn create_handle(&self, source_id: &str) -> Result<Box<dyn SourceHandle>, TfError> {
        Ok(Box::new(MockHandle::new(source_id, self.tps)))
    }
}

pub struct MockHandle {
    source_id: String,
    ticker: Interval,
    cursor: usize,
}

impl MockHandle {
    pub fn new(source_id: &str, tps: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(tps.max(1)));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            source_id: source_id.to_string(),
            ticker,
            cursor: 0,
        }
    }
}

#[async_trait]
impl SourceHandle for MockHandle {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn watch(&mut self, symbols: &[String]) -> Result<TickerSnapshot, TfError> {
        if symbols.is_empty() {
            return Err(TfError::Source("mock watch called without symbols".into()));
        }
        self.ticker.tick().await;
        let symbol = &symbols[self.cursor % symbols.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Ok(generate(symbol))
    }
}

/// One random ticker for `symbol` stamped with the current time.
pub fn generate(symbol: &str) -> TickerSnapshot {
    let mut rng = rand::rng();
    let price = rng.random_range(PRICE_MIN..PRICE_MAX);
    let percentage = (rng.random::<f64>() - 0.5) * 0.02;
    let volume = rng.random_range(VOLUME_MIN..VOLUME_MAX);

    let mut t = TickerSnapshot::new(symbol, time_util::now_ms());
    t.open = Some(price);
    t.high = Some(price);
    t.low = Some(price);
    t.close = Some(price);
    t.last = Some(price);
    t.previous_close = Some(price);
    t.change = Some(price * percentage);
    t.percentage = Some(percentage);
    t.base_volume = Some(volume);
    t.quote_volume = Some(volume);
    t
}
