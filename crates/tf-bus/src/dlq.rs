//! Dead-letter routing.
//!
//! Messages that cannot be processed are republished verbatim (key and raw
//! payload) to a dedicated topic. Both the producer (unencodable snapshots,
//! evicted retry items) and the consumer (malformed or permanently failing
//! chunks) go through the same [`DlqRouter`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tf_core::BusMessage;
use tf_core::error::TfError;
use tracing::{debug, error};

use crate::{Broker, PublishOutcome};

/// Destination for messages leaving the main flow.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Divert one message. An error means the message was not accepted.
    async fn send(&self, key: &str, payload: &[u8]) -> Result<(), TfError>;

    /// Divert a whole chunk, stopping at the first refusal.
    async fn send_all(&self, messages: &[BusMessage]) -> Result<(), TfError> {
        for m in messages {
            self.send(&m.key, &m.payload).await?;
        }
        Ok(())
    }
}

/// Publishes dead letters to the DLQ topic of a [`Broker`].
pub struct DlqRouter {
    broker: Arc<dyn Broker>,
    topic: String,
    routed: AtomicU64,
    failed: AtomicU64,
}

impl DlqRouter {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            routed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Messages accepted by the DLQ topic since start.
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Messages the DLQ topic refused since start.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeadLetterSink for DlqRouter {
    async fn send(&self, key: &str, payload: &[u8]) -> Result<(), TfError> {
        match self.broker.publish(&self.topic, key, payload).await {
            PublishOutcome::Delivered => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                debug!("[dlq] routed {key}");
                Ok(())
            }
            PublishOutcome::Backpressure => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("[dlq] {key} refused: backpressure");
                Err(TfError::Publish(format!("dlq backpressure for {key}")))
            }
            PublishOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("[dlq] {key} failed: {reason}");
                Err(TfError::Publish(format!("dlq publish failed for {key}: {reason}")))
            }
        }
    }
}
