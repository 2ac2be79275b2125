//! Batch classification and offset discipline against scripted stores and
//! sessions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tf_bus::{Batch, Broker, ConsumerSession, DlqRouter, MemoryBroker};
use tf_core::backoff::BackoffPolicy;
use tf_core::error::{ErrorCode, StorageError, TfError};
use tf_core::metrics::MetricsAggregator;
use tf_core::monitor::LogMonitor;
use tf_core::types::{BusMessage, TickerSnapshot, routing_key};
use tf_core::worker::Worker;
use tf_consumer::{
    BatchProcessor, ConsumerCounters, ConsumerSettings, MemoryStore, ProcessError, RecoveryPolicy,
    Store, TickerConsumer, TickerRow, UpsertSummary,
};

/// Fails upserts according to a script, then delegates to a memory store.
#[derive(Default)]
struct ScriptedStore {
    inner: MemoryStore,
    script: Mutex<VecDeque<Option<StorageError>>>,
    calls: AtomicUsize,
}

impl ScriptedStore {
    fn failing_with(codes: &[Option<&str>]) -> Self {
        let script = codes
            .iter()
            .map(|c| c.map(|c| StorageError::new(ErrorCode::from_code(c), "scripted")))
            .collect();
        Self {
            script: Mutex::new(script),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn batch_upsert(&self, rows: &[TickerRow]) -> Result<UpsertSummary, StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Some(e)) => Err(e),
            _ => self.inner.batch_upsert(rows).await,
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

/// Records every offset call; never delivers anything itself.
#[derive(Default)]
struct Recorder {
    resolved: Vec<(i32, i64)>,
    commits: usize,
    heartbeats: usize,
}

impl Recorder {
    fn highest_resolved(&self) -> Option<i64> {
        self.resolved.iter().map(|&(_, o)| o).max()
    }
}

#[async_trait]
impl ConsumerSession for Recorder {
    async fn next_batch(&mut self) -> Result<Option<Batch>, TfError> {
        Ok(None)
    }

    fn resolve_offset(&mut self, partition: i32, offset: i64) {
        self.resolved.push((partition, offset));
    }

    async fn commit(&mut self) -> Result<(), TfError> {
        self.commits += 1;
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), TfError> {
        self.heartbeats += 1;
        Ok(())
    }

    async fn rewind(&mut self, _partition: i32) -> Result<(), TfError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TfError> {
        Ok(())
    }
}

fn message(offset: i64, symbol: &str) -> BusMessage {
    let ticker = TickerSnapshot {
        last: Some(100.0 + offset as f64),
        ..TickerSnapshot::new(symbol, 1_700_000_000_000 + offset as u64)
    };
    BusMessage {
        key: routing_key("binance", symbol),
        payload: ticker.encode().unwrap(),
        partition: 0,
        offset,
    }
}

fn batch(n: i64) -> Batch {
    Batch {
        partition: 0,
        messages: (0..n).map(|o| message(o, "BTC/USDT")).collect(),
    }
}

struct Harness {
    store: Arc<ScriptedStore>,
    dlq_broker: MemoryBroker,
    metrics: Arc<MetricsAggregator<ConsumerCounters>>,
    processor: BatchProcessor,
}

fn harness(store: ScriptedStore, chunk_size: usize) -> Harness {
    let store = Arc::new(store);
    let dlq_broker = MemoryBroker::new(1, None);
    let metrics = Arc::new(MetricsAggregator::new());
    let processor = BatchProcessor::new(
        chunk_size,
        None,
        store.clone(),
        Arc::new(DlqRouter::new(Arc::new(dlq_broker.clone()), "ticker.dlq")),
        RecoveryPolicy::default(),
        Arc::clone(&metrics),
    );
    Harness {
        store,
        dlq_broker,
        metrics,
        processor,
    }
}

#[tokio::test]
async fn one_bad_payload_sends_whole_chunk_to_dlq() {
    let h = harness(ScriptedStore::default(), 50);
    let mut b = batch(3);
    b.messages[1].payload = b"{\"symbol\":".to_vec();
    let mut session = Recorder::default();

    let summary = h.processor.process(&b, &mut session).await.unwrap();

    assert_eq!(summary.dead_lettered, 3);
    let totals = h.metrics.drain().totals();
    assert_eq!(totals.sent_to_dlq, 3);
    assert_eq!(totals.consumed, 0);
    assert_eq!(h.store.calls.load(Ordering::Relaxed), 0);

    let dead = h.dlq_broker.messages("ticker.dlq");
    assert_eq!(dead.len(), 3);
    assert_eq!(dead[1].payload, b"{\"symbol\":".to_vec());
    assert_eq!(session.highest_resolved(), Some(2));
    assert!(session.commits >= 1);
}

#[tokio::test]
async fn timeout_forces_redelivery_without_commit() {
    let h = harness(ScriptedStore::failing_with(&[Some("ETIMEDOUT")]), 50);
    let mut session = Recorder::default();

    let err = h.processor.process(&batch(3), &mut session).await.unwrap_err();

    assert!(matches!(err, ProcessError::Redeliver { partition: 0, offset: 0, .. }));
    let totals = h.metrics.drain().totals();
    assert_eq!(totals.recoverable_retry, 3);
    assert_eq!(totals.consumed, 0);
    assert_eq!(totals.sent_to_dlq, 0);
    assert!(session.resolved.is_empty());
    assert_eq!(session.commits, 0);
    assert_eq!(session.heartbeats, 1);
    assert!(h.dlq_broker.messages("ticker.dlq").is_empty());
}

#[tokio::test]
async fn unlisted_storage_error_is_dead_lettered_and_committed() {
    let h = harness(ScriptedStore::failing_with(&[Some("42P01")]), 50);
    let mut session = Recorder::default();

    h.processor.process(&batch(3), &mut session).await.unwrap();

    let totals = h.metrics.drain().totals();
    assert_eq!(totals.sent_to_dlq, 3);
    assert_eq!(totals.recoverable_retry, 0);
    assert_eq!(h.dlq_broker.messages("ticker.dlq").len(), 3);
    assert_eq!(session.highest_resolved(), Some(2));
    assert!(session.commits >= 1);
}

#[tokio::test]
async fn later_chunks_stay_unresolved_after_recoverable_failure() {
    let h = harness(ScriptedStore::failing_with(&[None, Some("ECONNRESET")]), 2);
    let mut session = Recorder::default();

    let err = h.processor.process(&batch(5), &mut session).await.unwrap_err();

    assert_eq!(err.offset(), 2);
    assert_eq!(session.resolved, vec![(0, 1)]);
    assert_eq!(session.commits, 1);
    assert_eq!(session.heartbeats, 2);
    // the third chunk is never attempted
    assert_eq!(h.store.calls.load(Ordering::Relaxed), 2);

    let totals = h.metrics.drain().totals();
    assert_eq!(totals.consumed, 2);
    assert_eq!(totals.recoverable_retry, 2);
}

#[tokio::test]
async fn every_chunk_of_a_good_batch_is_committed() {
    let h = harness(ScriptedStore::default(), 2);
    let mut session = Recorder::default();

    let summary = h.processor.process(&batch(5), &mut session).await.unwrap();

    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.inserted, 5);
    assert_eq!(session.resolved, vec![(0, 1), (0, 3), (0, 4)]);
    assert_eq!(session.commits, 3);
    assert_eq!(session.heartbeats, 3);
    assert_eq!(h.metrics.drain().totals().consumed, 5);
}

#[tokio::test]
async fn replayed_batch_stores_each_row_once() {
    let h = harness(ScriptedStore::default(), 50);
    let mut session = Recorder::default();

    h.processor.process(&batch(4), &mut session).await.unwrap();
    let replay = h.processor.process(&batch(4), &mut session).await.unwrap();

    assert_eq!(replay.inserted, 0);
    assert_eq!(replay.duplicates, 4);
    assert_eq!(h.store.inner.len(), 4);
}

#[tokio::test]
async fn unavailable_dlq_leaves_chunk_unresolved() {
    let h = harness(ScriptedStore::default(), 50);
    h.dlq_broker.close().await.unwrap();
    let mut b = batch(2);
    b.messages[0].payload = b"not json".to_vec();
    let mut session = Recorder::default();

    let err = h.processor.process(&b, &mut session).await.unwrap_err();

    assert!(matches!(err, ProcessError::DeadLetter { offset: 0, .. }));
    assert!(session.resolved.is_empty());
    assert_eq!(session.commits, 0);
    assert_eq!(h.metrics.drain().totals().sent_to_dlq, 0);
}

#[tokio::test]
async fn consumer_redelivers_until_stored() {
    let broker = MemoryBroker::new(2, None);
    for offset in 0..3 {
        let m = message(offset, "ETH/USDT");
        assert!(broker.publish("ticker", &m.key, &m.payload).await.is_delivered());
    }
    let partition = broker.partition_for(&routing_key("binance", "ETH/USDT"));

    let store = Arc::new(ScriptedStore::failing_with(&[Some("ETIMEDOUT")]));
    let settings = ConsumerSettings {
        consumer_id: "c-test".into(),
        source_filter: Some("binance".into()),
        chunk_size: 50,
        report_interval: Duration::from_secs(3600),
        redelivery_backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 2.0, 0.0),
        extra_recoverable_codes: Vec::new(),
    };
    let mut consumer = TickerConsumer::new(
        settings,
        Box::new(broker.subscribe("g", "ticker", 100, Duration::from_millis(20))),
        store.clone(),
        Arc::new(DlqRouter::new(Arc::new(broker.clone()), "ticker.dlq")),
        Arc::new(LogMonitor::new("test")),
    );
    consumer.start().await.unwrap();

    for _ in 0..200 {
        if store.inner.len() == 3 && broker.committed("g", "ticker", partition) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    consumer.stop().await.unwrap();

    assert_eq!(store.inner.len(), 3);
    assert_eq!(broker.committed("g", "ticker", partition), Some(3));
    assert_eq!(store.calls.load(Ordering::Relaxed), 2);
    let totals = consumer.metrics().peek().totals();
    assert_eq!(totals.recoverable_retry, 3);
    assert_eq!(totals.consumed, 3);
    assert!(broker.messages("ticker.dlq").is_empty());
}
