//! # tf-consumer
//!
//! Ticker consumer: reads ticker batches from the message bus and persists
//! them with at-least-once semantics.
//!
//! - [`processor`] decides per chunk between commit, redelivery and the DLQ
//! - [`policy`] classifies storage errors as recoverable or permanent
//! - [`store`] is the storage seam plus an idempotent in-memory store
//! - [`postgres`] is the production store
//! - [`consumer`] runs the poll loop and the metrics reporter

pub mod consumer;
pub mod metrics;
pub mod policy;
pub mod postgres;
pub mod processor;
pub mod store;

pub use consumer::{ConsumerSettings, TickerConsumer};
pub use metrics::{ConsumerCounters, ConsumerReport};
pub use policy::RecoveryPolicy;
pub use postgres::PgStore;
pub use processor::{BatchProcessor, BatchSummary, ProcessError};
pub use store::{MemoryStore, Store, TickerRow, UpsertSummary};
