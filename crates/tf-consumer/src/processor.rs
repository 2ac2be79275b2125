//! Consumer batch processor.
//!
//! A delivered [`Batch`] is filtered by source, cut into fixed-size chunks
//! and handled strictly in order:
//!
//! ```text
//! chunk ──decode──fail──────────────────────► DLQ ──► resolve + commit
//!          │
//!          └──ok──► upsert ──ok───────────────────► resolve + commit
//!                     ├──recoverable err──► Err(Redeliver), nothing resolved
//!                     └──other err────────► DLQ ──► resolve + commit
//! ```
//!
//! The session is heartbeated after every chunk whatever the outcome. A
//! recoverable failure stops the batch: the chunk and everything after it
//! stay unresolved so the caller can rewind the partition and poll them
//! again.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tf_bus::{Batch, ConsumerSession, DeadLetterSink};
use tf_core::BusMessage;
use tf_core::error::{StorageError, TfError};
use tf_core::metrics::{MetricsAggregator, ShardId};
use tf_core::time_util;
use tf_core::types::{TickerSnapshot, source_of_key, source_prefix};
use tracing::{debug, error, warn};

use crate::metrics::{ConsumerCounters, partition_slot};
use crate::policy::RecoveryPolicy;
use crate::store::{Store, TickerRow, UpsertSummary};

/// Why a batch stopped before its end. Either way the partition must be
/// rewound to its first unresolved offset.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("partition {partition} offset {offset}: recoverable storage failure: {source}")]
    Redeliver {
        partition: i32,
        offset: i64,
        #[source]
        source: StorageError,
    },

    #[error("partition {partition} offset {offset}: dead-letter send failed: {source}")]
    DeadLetter {
        partition: i32,
        offset: i64,
        #[source]
        source: TfError,
    },
}

impl ProcessError {
    pub fn partition(&self) -> i32 {
        match self {
            Self::Redeliver { partition, .. } | Self::DeadLetter { partition, .. } => *partition,
        }
    }

    /// First offset left unresolved.
    pub fn offset(&self) -> i64 {
        match self {
            Self::Redeliver { offset, .. } | Self::DeadLetter { offset, .. } => *offset,
        }
    }
}

/// How one chunk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored(UpsertSummary),
    DeadLettered,
}

/// What [`BatchProcessor::process`] did with a batch it finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub chunks: usize,
    /// Messages dropped by the source filter.
    pub filtered: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
}

pub struct BatchProcessor {
    chunk_size: usize,
    prefix: Option<String>,
    store: Arc<dyn Store>,
    dlq: Arc<dyn DeadLetterSink>,
    policy: RecoveryPolicy,
    metrics: Arc<MetricsAggregator<ConsumerCounters>>,
}

impl BatchProcessor {
    pub fn new(
        chunk_size: usize,
        source_filter: Option<&str>,
        store: Arc<dyn Store>,
        dlq: Arc<dyn DeadLetterSink>,
        policy: RecoveryPolicy,
        metrics: Arc<MetricsAggregator<ConsumerCounters>>,
    ) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            prefix: source_filter.map(source_prefix),
            store,
            dlq,
            policy,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator<ConsumerCounters>> {
        &self.metrics
    }

    fn accepts(&self, msg: &BusMessage) -> bool {
        self.prefix.as_deref().is_none_or(|p| msg.key.starts_with(p))
    }

    /// Process one batch, resolving and committing offsets as chunks finish.
    pub async fn process(
        &self,
        batch: &Batch,
        session: &mut dyn ConsumerSession,
    ) -> Result<BatchSummary, ProcessError> {
        let partition = batch.partition;
        let slot = partition_slot(partition);
        let selected: Cow<'_, [BusMessage]> = match &self.prefix {
            None => Cow::Borrowed(&batch.messages),
            Some(_) => Cow::Owned(batch.messages.iter().filter(|m| self.accepts(m)).cloned().collect()),
        };
        let mut summary = BatchSummary {
            filtered: batch.len() - selected.len(),
            ..Default::default()
        };
        let mut resolved_to: Option<i64> = None;

        for chunk in selected.chunks(self.chunk_size) {
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            summary.chunks += 1;
            let outcome = self.handle_chunk(slot, partition, first.offset, chunk).await;
            if let Err(e) = session.heartbeat().await {
                warn!("[consumer] heartbeat failed: {e}");
            }

            match outcome? {
                ChunkOutcome::Stored(s) => {
                    summary.inserted += s.inserted;
                    summary.duplicates += s.skipped;
                }
                ChunkOutcome::DeadLettered => summary.dead_lettered += chunk.len(),
            }
            session.resolve_offset(partition, last.offset);
            resolved_to = Some(last.offset);
            commit(session).await;
        }

        // Filtered-out messages after the last chunk still count as handled.
        if let Some(last) = batch.last_offset() {
            if resolved_to.is_none_or(|r| r < last) {
                session.resolve_offset(partition, last);
                commit(session).await;
            }
        }
        Ok(summary)
    }

    async fn handle_chunk(
        &self,
        slot: ShardId,
        partition: i32,
        first_offset: i64,
        chunk: &[BusMessage],
    ) -> Result<ChunkOutcome, ProcessError> {
        let rows = match decode_chunk(chunk) {
            Ok(rows) => rows,
            Err(reason) => {
                warn!("[consumer] partition {partition} offset {first_offset}: {reason}, dead-lettering {} messages", chunk.len());
                return self.dead_letter(slot, partition, first_offset, chunk).await;
            }
        };

        let start = Instant::now();
        match self.store.batch_upsert(&rows).await {
            Ok(summary) => {
                let latency = time_util::elapsed_ms(start);
                self.metrics.update(slot, |c| {
                    c.consumed += chunk.len() as u64;
                    c.batch.record_ok(latency);
                });
                if summary.skipped > 0 {
                    debug!("[consumer] partition {partition}: {} duplicate rows skipped", summary.skipped);
                }
                Ok(ChunkOutcome::Stored(summary))
            }
            Err(e) if self.policy.is_recoverable(&e) => {
                warn!("[consumer] partition {partition} offset {first_offset}: {e}, requesting redelivery");
                self.metrics.update(slot, |c| {
                    c.recoverable_retry += chunk.len() as u64;
                    c.batch.record_error();
                });
                Err(ProcessError::Redeliver {
                    partition,
                    offset: first_offset,
                    source: e,
                })
            }
            Err(e) => {
                error!("[consumer] partition {partition} offset {first_offset}: {e}, dead-lettering {} messages", chunk.len());
                self.metrics.update(slot, |c| c.batch.record_error());
                self.dead_letter(slot, partition, first_offset, chunk).await
            }
        }
    }

    async fn dead_letter(
        &self,
        slot: ShardId,
        partition: i32,
        first_offset: i64,
        chunk: &[BusMessage],
    ) -> Result<ChunkOutcome, ProcessError> {
        match self.dlq.send_all(chunk).await {
            Ok(()) => {
                self.metrics.update(slot, |c| c.sent_to_dlq += chunk.len() as u64);
                Ok(ChunkOutcome::DeadLettered)
            }
            Err(e) => Err(ProcessError::DeadLetter {
                partition,
                offset: first_offset,
                source: e,
            }),
        }
    }
}

async fn commit(session: &mut dyn ConsumerSession) {
    // Resolved offsets stay resolved; the next successful commit carries them.
    if let Err(e) = session.commit().await {
        warn!("[consumer] commit failed: {e}");
    }
}

/// Decode every message of a chunk, failing on the first bad one.
fn decode_chunk(chunk: &[BusMessage]) -> Result<Vec<TickerRow>, String> {
    chunk
        .iter()
        .map(|m| {
            let source =
                source_of_key(&m.key).ok_or_else(|| format!("malformed routing key '{}'", m.key))?;
            let snapshot = TickerSnapshot::decode(&m.payload)
                .map_err(|e| format!("offset {}: {e}", m.offset))?;
            TickerRow::from_snapshot(source, &snapshot)
                .ok_or_else(|| format!("offset {}: unsplittable symbol {}", m.offset, snapshot.symbol))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tf_bus::{Broker, DlqRouter, MemoryBroker};
    use tf_core::types::routing_key;

    use super::*;
    use crate::store::MemoryStore;

    fn message(offset: i64, source: &str, symbol: &str) -> BusMessage {
        BusMessage {
            key: routing_key(source, symbol),
            payload: TickerSnapshot::new(symbol, offset as u64 + 1).encode().unwrap(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn decode_rejects_bad_keys_and_payloads() {
        assert!(decode_chunk(&[message(0, "binance", "BTC/USDT")]).is_ok());

        let mut bad_key = message(1, "binance", "BTC/USDT");
        bad_key.key = "BTC/USDT".into();
        assert!(decode_chunk(&[bad_key]).unwrap_err().contains("routing key"));

        let mut bad_payload = message(2, "binance", "BTC/USDT");
        bad_payload.payload = b"{".to_vec();
        assert!(decode_chunk(&[message(0, "binance", "ETH/USDT"), bad_payload]).is_err());
    }

    #[test]
    fn source_comes_from_key() {
        let rows = decode_chunk(&[message(0, "upbit", "BTC/KRW")]).unwrap();
        assert_eq!(rows[0].source, "upbit");
        assert_eq!(rows[0].quote_symbol, "KRW");
    }

    #[tokio::test]
    async fn filter_drops_other_sources_but_commits_past_them() {
        let broker = MemoryBroker::new(1, None);
        for (i, source) in ["binance", "upbit", "binance", "upbit"].iter().enumerate() {
            let m = message(i as i64, source, "BTC/USDT");
            broker.publish("ticker", &m.key, &m.payload).await;
        }
        let mut session = broker.subscribe("g", "ticker", 10, std::time::Duration::from_millis(10));
        let batch = session.next_batch().await.unwrap().unwrap();

        let store = Arc::new(MemoryStore::new());
        let processor = BatchProcessor::new(
            50,
            Some("binance"),
            store.clone(),
            Arc::new(DlqRouter::new(Arc::new(broker.clone()), "ticker.dlq")),
            RecoveryPolicy::default(),
            Arc::new(MetricsAggregator::new()),
        );
        let summary = processor.process(&batch, &mut session).await.unwrap();

        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(broker.committed("g", "ticker", 0), Some(4));
    }
}
