//! Source registry: factory for creating source connectors from config.

use std::sync::Arc;

use anyhow::Result;
use tf_core::config::{ProducerConfig, SourceKind};

use crate::binance::{BinanceSource, config::BinanceConfig};
use crate::mock::MockSource;
use crate::source::SourceConnector;

/// Create a [`SourceConnector`] based on the `source` field in the config.
pub fn create_source(config: &ProducerConfig) -> Result<Arc<dyn SourceConnector>> {
    let source: Arc<dyn SourceConnector> = match config.effective_source() {
        SourceKind::Binance => {
            Arc::new(BinanceSource::new(BinanceConfig::from_producer(config))?)
        }
        SourceKind::Mock => Arc::new(MockSource::new(
            config.effective_tps(),
            config.effective_symbol_count(),
        )),
    };
    Ok(source)
}
