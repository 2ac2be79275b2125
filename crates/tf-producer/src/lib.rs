//! # tf-producer
//!
//! Ticker producer: fetches ticker updates from a source and publishes them
//! to the message bus without ever blocking on a slow or failing broker.
//!
//! ## Architecture
//!
//! The symbol list from a [`source::SourceConnector`] is split into chunks;
//! each chunk is owned by one [`shard::ShardWorker`] running its own
//! watch → publish loop. Failed or throttled publishes go to the
//! [`retry_buffer::RetryBuffer`], which a timer flushes independently.
//! [`producer::TickerProducer`] wires it all together.
//!
//! ## Sources
//!
//! - [`binance`]: REST symbol discovery + combined WebSocket ticker stream
//! - [`mock`]: synthetic tickers at a configured rate
//! - [`registry`]: picks one from config

pub mod binance;
pub mod json_util;
pub mod metrics;
pub mod mock;
pub mod producer;
pub mod registry;
pub mod retry_buffer;
pub mod shard;
pub mod source;

pub use metrics::{ProducerCounters, ProducerReport};
pub use producer::{ProducerSettings, TickerProducer};
pub use registry::create_source;
pub use source::{SourceConnector, SourceHandle};
