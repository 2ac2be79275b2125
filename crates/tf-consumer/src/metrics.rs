//! Consumer counters and the monitor report built from them.

use serde::Serialize;
use tf_core::metrics::{Counters, MetricsSnapshot, OpStats, ShardId};

/// Aggregator slot for a bus partition.
pub fn partition_slot(partition: i32) -> ShardId {
    usize::try_from(partition).unwrap_or_default()
}

/// Per-partition consumer counters for one reporting interval.
#[derive(Debug, Clone, Default)]
pub struct ConsumerCounters {
    /// Messages in chunks that were persisted.
    pub consumed: u64,
    pub sent_to_dlq: u64,
    /// Messages in chunks handed back for redelivery.
    pub recoverable_retry: u64,
    /// Upsert latency of persisted chunks.
    pub batch: OpStats,
}

impl Counters for ConsumerCounters {
    fn merge(&mut self, other: &Self) {
        self.consumed += other.consumed;
        self.sent_to_dlq += other.sent_to_dlq;
        self.recoverable_retry += other.recoverable_retry;
        self.batch.merge(&other.batch);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerReport {
    pub consumer_id: String,
    pub total_consumed: u64,
    #[serde(rename = "sendToDLQTotal")]
    pub send_to_dlq_total: u64,
    pub recoverable_retry_total: u64,
    pub avg_batch_latency: f64,
}

impl ConsumerReport {
    pub fn build(consumer_id: &str, snapshot: &MetricsSnapshot<ConsumerCounters>) -> Self {
        let total = snapshot.totals();
        Self {
            consumer_id: consumer_id.to_string(),
            total_consumed: total.consumed,
            send_to_dlq_total: total.sent_to_dlq,
            recoverable_retry_total: total.recoverable_retry,
            avg_batch_latency: total.batch.avg_latency_ms(),
        }
    }
}
