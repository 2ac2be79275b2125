//! Source connector seam.
//!
//! A [`SourceConnector`] knows how to list the symbols an upstream offers
//! and how to open a per-shard [`SourceHandle`]. The handle is owned by one
//! shard worker and is polled with `watch` for the next ticker update.

use async_trait::async_trait;
use tf_core::TickerSnapshot;
use tf_core::error::TfError;

/// Factory for the per-shard handles of one upstream.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Human-readable connector name.
    fn name(&self) -> &str;

    /// Every symbol (`BASE/QUOTE`) the upstream publishes for `source_id`.
    async fn targets(&self, source_id: &str) -> Result<Vec<String>, TfError>;

    /// Open a fresh handle for one shard.
    async fn create_handle(&self, source_id: &str) -> Result<Box<dyn SourceHandle>, TfError>;
}

/// A live subscription owned by exactly one shard.
#[async_trait]
pub trait SourceHandle: Send {
    /// Source id placed in routing keys (`ticker.<source_id>.<symbol>`).
    fn source_id(&self) -> &str;

    /// Suspend until the next update for any of `symbols` is available.
    async fn watch(&mut self, symbols: &[String]) -> Result<TickerSnapshot, TfError>;

    /// Release the upstream connection.
    async fn close(&mut self) {}
}
