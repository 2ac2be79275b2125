//! Per-shard retry buffer for publishes that failed or hit backpressure.
//!
//! Shard workers append at the tail with [`RetryBuffer::push`] and never
//! wait on the broker. A separate timer calls [`RetryBuffer::flush`], which
//! drains every shard queue, re-publishes each item, and puts the failures
//! back at the head in their original order, ahead of anything appended
//! while the flush was running. Items taken out by a running flush still
//! count in [`RetryBuffer::len`] until they are delivered or re-queued.
//!
//! Each queue is bounded. When it is full the configured
//! [`OverflowPolicy`] picks the displaced item (the oldest, or the incoming
//! one); that item is handed back to the caller for dead-lettering.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tf_bus::{Broker, PublishOutcome};
use tf_core::config::OverflowPolicy;
use tf_core::metrics::{MetricsAggregator, ShardId};
use tf_core::time_util;
use tracing::{debug, warn};

use crate::metrics::ProducerCounters;

/// An undelivered publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryItem {
    pub target: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// Publish attempts made so far, including the original one.
    pub attempts: u32,
}

impl RetryItem {
    pub fn new(target: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            target: target.into(),
            key: key.into(),
            payload,
            attempts: 1,
        }
    }
}

/// Result of [`RetryBuffer::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, but the oldest item was pushed out to make room.
    Evicted(RetryItem),
    /// Not queued; the buffer is full and refuses new items.
    Rejected(RetryItem),
}

/// What one flush pass did.
#[derive(Debug, Default)]
pub struct FlushStats {
    /// `false` when another flush was already running and this call did nothing.
    pub ran: bool,
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    /// Items displaced by overflow during re-insertion.
    pub evicted: Vec<(ShardId, RetryItem)>,
}

pub struct RetryBuffer {
    queues: Vec<Mutex<VecDeque<RetryItem>>>,
    /// Items a running flush has taken out of each queue.
    in_flight: Vec<AtomicUsize>,
    capacity: usize,
    policy: OverflowPolicy,
    flushing: tokio::sync::Mutex<()>,
    enqueued: AtomicU64,
}

impl RetryBuffer {
    pub fn new(shards: usize, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queues: (0..shards).map(|_| Mutex::new(VecDeque::new())).collect(),
            in_flight: (0..shards).map(|_| AtomicUsize::new(0)).collect(),
            capacity: capacity.max(1),
            policy,
            flushing: tokio::sync::Mutex::new(()),
            enqueued: AtomicU64::new(0),
        }
    }

    fn queue(&self, shard: ShardId) -> Option<std::sync::MutexGuard<'_, VecDeque<RetryItem>>> {
        self.queues
            .get(shard)
            .map(|q| q.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Append `item` to the tail of `shard`'s queue.
    pub fn push(&self, shard: ShardId, item: RetryItem) -> PushOutcome {
        let Some(mut queue) = self.queue(shard) else {
            return PushOutcome::Rejected(item);
        };
        if queue.len() < self.capacity {
            queue.push_back(item);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Queued;
        }
        match self.policy {
            OverflowPolicy::RejectNew => PushOutcome::Rejected(item),
            OverflowPolicy::DropOldest => {
                let oldest = queue.pop_front();
                queue.push_back(item);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                match oldest {
                    Some(oldest) => PushOutcome::Evicted(oldest),
                    None => PushOutcome::Queued,
                }
            }
        }
    }

    /// Undelivered items for one shard, queued or in a running flush.
    pub fn len(&self, shard: ShardId) -> usize {
        // Read under the queue lock: a flush moves items between the two
        // counts while holding it.
        self.queue(shard).map_or(0, |q| q.len() + self.in_flight[shard].load(Ordering::Acquire))
    }

    /// Queued items across every shard.
    pub fn total_len(&self) -> usize {
        (0..self.queues.len()).map(|s| self.len(s)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn shards(&self) -> usize {
        self.queues.len()
    }

    /// Items ever placed in the buffer, re-insertions after a failed flush
    /// attempt included.
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Re-publish every queued item once.
    ///
    /// Successful re-publishes are recorded as publishes of the owning shard.
    /// A call made while another flush is in progress returns immediately
    /// with `ran == false`.
    pub async fn flush(
        &self,
        broker: &dyn Broker,
        metrics: &MetricsAggregator<ProducerCounters>,
    ) -> FlushStats {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("[retry] flush already in progress");
            return FlushStats::default();
        };
        let mut stats = FlushStats {
            ran: true,
            ..Default::default()
        };

        for shard in 0..self.queues.len() {
            let pending: Vec<RetryItem> = match self.queue(shard) {
                Some(mut q) if !q.is_empty() => {
                    self.in_flight[shard].store(q.len(), Ordering::Release);
                    q.drain(..).collect()
                }
                _ => continue,
            };

            let mut failed = Vec::new();
            for mut item in pending {
                stats.attempted += 1;
                item.attempts = item.attempts.saturating_add(1);
                let start = Instant::now();
                match broker.publish(&item.target, &item.key, &item.payload).await {
                    PublishOutcome::Delivered => {
                        let latency = time_util::elapsed_ms(start);
                        metrics.update(shard, |c| c.publish.record_ok(latency));
                        self.in_flight[shard].fetch_sub(1, Ordering::AcqRel);
                        stats.delivered += 1;
                    }
                    PublishOutcome::Backpressure => failed.push(item),
                    PublishOutcome::Failed(reason) => {
                        debug!("[retry] shard {shard} {} still failing: {reason}", item.key);
                        failed.push(item);
                    }
                }
            }

            if failed.is_empty() {
                continue;
            }
            stats.requeued += failed.len();
            self.requeue_front(shard, failed, &mut stats);
        }

        if stats.attempted > 0 {
            debug!(
                "[retry] flushed {} items: {} delivered, {} requeued",
                stats.attempted, stats.delivered, stats.requeued
            );
        }
        stats
    }

    /// Put `failed` back at the head of `shard`'s queue, keeping its order.
    fn requeue_front(&self, shard: ShardId, failed: Vec<RetryItem>, stats: &mut FlushStats) {
        let Some(mut queue) = self.queue(shard) else {
            return;
        };
        self.enqueued.fetch_add(failed.len() as u64, Ordering::Relaxed);
        self.in_flight[shard].fetch_sub(failed.len(), Ordering::AcqRel);
        for item in failed.into_iter().rev() {
            queue.push_front(item);
        }
        while queue.len() > self.capacity {
            let displaced = match self.policy {
                OverflowPolicy::DropOldest => queue.pop_front(),
                OverflowPolicy::RejectNew => queue.pop_back(),
            };
            match displaced {
                Some(item) => {
                    warn!("[retry] shard {shard} over capacity, evicting {}", item.key);
                    stats.evicted.push((shard, item));
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tf_bus::MemoryBroker;
    use tf_core::error::TfError;

    use super::*;

    fn item(n: usize) -> RetryItem {
        RetryItem::new("ticker", format!("ticker.mock.MOCK/MOCK-{n}"), n.to_string().into_bytes())
    }

    fn keys(buf: &RetryBuffer, shard: ShardId) -> Vec<String> {
        buf.queue(shard).unwrap().iter().map(|i| i.key.clone()).collect()
    }

    /// Refuses every key listed in `refuse`; delivers the rest.
    struct Selective {
        refuse: Vec<String>,
        delivered: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Broker for Selective {
        async fn publish(&self, _target: &str, key: &str, _payload: &[u8]) -> PublishOutcome {
            if self.refuse.iter().any(|k| k == key) {
                PublishOutcome::Failed("down".into())
            } else {
                self.delivered.lock().unwrap().push(key.to_string());
                PublishOutcome::Delivered
            }
        }

        async fn close(&self) -> Result<(), TfError> {
            Ok(())
        }
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let buf = RetryBuffer::new(1, 2, OverflowPolicy::DropOldest);
        assert_eq!(buf.push(0, item(0)), PushOutcome::Queued);
        assert_eq!(buf.push(0, item(1)), PushOutcome::Queued);
        assert_eq!(buf.push(0, item(2)), PushOutcome::Evicted(item(0)));
        assert_eq!(buf.len(0), 2);
        assert_eq!(keys(&buf, 0), vec![item(1).key, item(2).key]);
    }

    #[test]
    fn reject_new_keeps_queue() {
        let buf = RetryBuffer::new(1, 1, OverflowPolicy::RejectNew);
        assert_eq!(buf.push(0, item(0)), PushOutcome::Queued);
        assert_eq!(buf.push(0, item(1)), PushOutcome::Rejected(item(1)));
        assert_eq!(keys(&buf, 0), vec![item(0).key]);
    }

    #[test]
    fn unknown_shard_is_rejected() {
        let buf = RetryBuffer::new(1, 4, OverflowPolicy::DropOldest);
        assert!(matches!(buf.push(7, item(0)), PushOutcome::Rejected(_)));
        assert_eq!(buf.len(7), 0);
    }

    #[tokio::test]
    async fn flush_delivers_and_records_publishes() {
        let broker = MemoryBroker::new(1, None);
        let metrics = MetricsAggregator::<ProducerCounters>::new();
        let buf = RetryBuffer::new(2, 8, OverflowPolicy::DropOldest);
        buf.push(0, item(0));
        buf.push(1, item(1));
        buf.push(1, item(2));

        let stats = buf.flush(&broker, &metrics).await;
        assert!(stats.ran);
        assert_eq!(stats.delivered, 3);
        assert!(buf.is_empty());
        assert_eq!(broker.messages("ticker").len(), 3);

        let snap = metrics.drain();
        assert_eq!(snap.shard(0).unwrap().publish.count, 1);
        assert_eq!(snap.shard(1).unwrap().publish.count, 2);
    }

    #[tokio::test]
    async fn failures_return_to_head_in_order() {
        let broker = Selective {
            refuse: vec![item(0).key, item(2).key],
            delivered: StdMutex::new(Vec::new()),
        };
        let metrics = MetricsAggregator::<ProducerCounters>::new();
        let buf = RetryBuffer::new(1, 8, OverflowPolicy::DropOldest);
        for n in 0..4 {
            buf.push(0, item(n));
        }

        let stats = buf.flush(&broker, &metrics).await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.requeued, 2);
        assert_eq!(keys(&buf, 0), vec![item(0).key, item(2).key]);
        assert_eq!(buf.queue(0).unwrap()[0].attempts, 2);
        assert_eq!(*broker.delivered.lock().unwrap(), vec![item(1).key, item(3).key]);
        assert_eq!(buf.enqueued_total(), 6);
    }

    /// Fails every publish, each one held until the test releases it.
    struct Gated {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Broker for Gated {
        async fn publish(&self, _target: &str, _key: &str, _payload: &[u8]) -> PublishOutcome {
            self.entered.notify_one();
            self.release.notified().await;
            PublishOutcome::Backpressure
        }

        async fn close(&self) -> Result<(), TfError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn length_counts_items_taken_by_a_running_flush() {
        let buf = Arc::new(RetryBuffer::new(2, 8, OverflowPolicy::DropOldest));
        for n in 0..3 {
            buf.push(0, item(n));
        }
        buf.push(1, item(3));
        let broker = Arc::new(Gated {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let metrics = Arc::new(MetricsAggregator::<ProducerCounters>::new());

        let flush = tokio::spawn({
            let (buf, broker, metrics) = (Arc::clone(&buf), Arc::clone(&broker), Arc::clone(&metrics));
            async move { buf.flush(broker.as_ref(), &metrics).await }
        });

        for _ in 0..4 {
            broker.entered.notified().await;
            assert_eq!(buf.total_len(), 4);
            broker.release.notify_one();
        }
        let stats = flush.await.unwrap();

        assert_eq!(stats.requeued, 4);
        assert_eq!(buf.len(0), 3);
        assert_eq!(buf.len(1), 1);
        assert_eq!(keys(&buf, 0), vec![item(0).key, item(1).key, item(2).key]);
    }

    #[tokio::test]
    async fn delivered_items_leave_the_count() {
        let broker = Selective {
            refuse: vec![item(1).key],
            delivered: StdMutex::new(Vec::new()),
        };
        let metrics = MetricsAggregator::<ProducerCounters>::new();
        let buf = RetryBuffer::new(1, 8, OverflowPolicy::DropOldest);
        for n in 0..3 {
            buf.push(0, item(n));
        }
        buf.flush(&broker, &metrics).await;
        assert_eq!(buf.len(0), 1);
        assert_eq!(buf.in_flight[0].load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn concurrent_flush_is_a_no_op() {
        let broker = MemoryBroker::new(1, None);
        let metrics = MetricsAggregator::<ProducerCounters>::new();
        let buf = RetryBuffer::new(1, 8, OverflowPolicy::DropOldest);
        buf.push(0, item(0));

        let _held = buf.flushing.try_lock().unwrap();
        let stats = buf.flush(&broker, &metrics).await;
        assert!(!stats.ran);
        assert_eq!(buf.len(0), 1);
    }
}
