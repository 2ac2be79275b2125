//! # tf-bus
//!
//! Message-bus seams shared by the producer and the consumer.
//!
//! - [`Broker`] publishes keyed payloads to a named target (topic) and
//!   reports an outcome instead of failing hard, so callers can treat a
//!   refused publish as backpressure.
//! - [`ConsumerSession`] delivers batches for one partition at a time and
//!   tracks resolved offsets, commits, heartbeats and rewinds.
//! - [`DeadLetterSink`] takes messages that must leave the main flow.
//!
//! Implementations: [`memory`] (in-process, used for local runs and tests)
//! and `kafka` (behind the `kafka` cargo feature).

pub mod dlq;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use tf_core::BusMessage;
use tf_core::error::TfError;

pub use dlq::{DeadLetterSink, DlqRouter};
pub use memory::{MemoryBroker, MemorySession};

/// Result of a single publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message.
    Delivered,
    /// The broker is temporarily unable to take more work.
    Backpressure,
    /// The attempt failed; the reason is kept for logging.
    Failed(String),
}

impl PublishOutcome {
    #[inline]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Publishing half of the bus.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` under `key` to `target`.
    async fn publish(&self, target: &str, key: &str, payload: &[u8]) -> PublishOutcome;

    /// Flush in-flight messages and release the client.
    async fn close(&self) -> Result<(), TfError>;
}

/// A run of consecutive messages from one partition.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub partition: i32,
    pub messages: Vec<BusMessage>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }
}

/// Consuming half of the bus, bound to one consumer group.
///
/// Offsets follow the usual broker convention: `resolve_offset` marks a
/// message as done, and `commit` persists "next offset to read" for every
/// partition whose resolved offset advanced.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Wait up to the session's poll timeout for the next batch.
    /// `Ok(None)` means nothing arrived in time.
    async fn next_batch(&mut self) -> Result<Option<Batch>, TfError>;

    /// Mark `offset` (and everything before it) in `partition` as processed.
    fn resolve_offset(&mut self, partition: i32, offset: i64);

    /// Persist resolved offsets.
    async fn commit(&mut self) -> Result<(), TfError>;

    /// Keep the group membership alive during long batches.
    async fn heartbeat(&mut self) -> Result<(), TfError>;

    /// Move the read position of `partition` back to its first unresolved
    /// offset so the remainder of the last batch is delivered again.
    async fn rewind(&mut self, partition: i32) -> Result<(), TfError>;

    /// Leave the group.
    async fn close(&mut self) -> Result<(), TfError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(offset: i64) -> BusMessage {
        BusMessage {
            key: "ticker.mock.MOCK/MOCK-0".into(),
            payload: Vec::new(),
            partition: 2,
            offset,
        }
    }

    #[test]
    fn batch_offsets() {
        let batch = Batch {
            partition: 2,
            messages: vec![msg(10), msg(11), msg(12)],
        };
        assert_eq!(batch.first_offset(), Some(10));
        assert_eq!(batch.last_offset(), Some(12));
        assert_eq!(batch.len(), 3);
        assert!(Batch::default().last_offset().is_none());
    }

    #[test]
    fn outcome_delivered() {
        assert!(PublishOutcome::Delivered.is_delivered());
        assert!(!PublishOutcome::Backpressure.is_delivered());
        assert!(!PublishOutcome::Failed("x".into()).is_delivered());
    }
}
