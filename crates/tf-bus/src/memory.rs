//! In-process broker.
//!
//! Topics are split into a fixed number of partitions; a message lands in
//! the partition chosen by hashing its key, so every key keeps its order.
//! Each partition is a log indexed by offset. Once every group on a topic has
//! committed past a message it is dropped from the log; a topic nobody
//! subscribes to (the DLQ in local runs) keeps everything it receives.
//!
//! Consumer groups keep one committed offset per partition (the next offset
//! to read). A [`MemorySession`] additionally tracks its own read position
//! and highest resolved offset, which is what `rewind` and `commit` work
//! from.
//!
//! `max_pending` caps, per partition, how many messages may sit beyond the
//! furthest committed offset of any group. Publishing past the cap reports
//! [`PublishOutcome::Backpressure`].

use std::collections::VecDeque;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use tf_core::BusMessage;
use tf_core::error::TfError;
use tokio::sync::Notify;
use tracing::debug;

use crate::{Batch, Broker, ConsumerSession, PublishOutcome};

/// Retained messages of one partition, starting at offset `base`.
#[derive(Clone, Default)]
struct PartitionLog {
    base: i64,
    messages: VecDeque<BusMessage>,
}

impl PartitionLog {
    fn next_offset(&self) -> i64 {
        self.base + self.messages.len() as i64
    }

    /// Up to `max` messages starting at `from` (or the oldest retained one).
    fn read(&self, from: i64, max: usize) -> Vec<BusMessage> {
        let skip = (from.max(self.base) - self.base) as usize;
        self.messages.iter().skip(skip).take(max).cloned().collect()
    }

    /// Drop every message below `offset`.
    fn compact(&mut self, offset: i64) {
        while self.base < offset && self.messages.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Default)]
struct State {
    /// topic -> partition logs
    topics: AHashMap<String, Vec<PartitionLog>>,
    /// (group, topic) -> committed offset per partition
    committed: AHashMap<(String, String), Vec<i64>>,
}

impl State {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<PartitionLog> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![PartitionLog::default(); partitions])
    }

    fn committed_mut(&mut self, group: &str, topic: &str, partitions: usize) -> &mut Vec<i64> {
        self.committed
            .entry((group.to_string(), topic.to_string()))
            .or_insert_with(|| vec![0; partitions])
    }

    /// Highest committed offset of `partition` across every group on `topic`.
    fn furthest_commit(&self, topic: &str, partition: usize) -> i64 {
        self.committed
            .iter()
            .filter(|((_, t), _)| t == topic)
            .filter_map(|(_, offsets)| offsets.get(partition).copied())
            .max()
            .unwrap_or(0)
    }

    /// Drop messages every group on `topic` has committed past.
    fn compact(&mut self, topic: &str) {
        let Some(logs) = self.topics.get_mut(topic) else {
            return;
        };
        for (p, log) in logs.iter_mut().enumerate() {
            let slowest = self
                .committed
                .iter()
                .filter(|((_, t), _)| t == topic)
                .filter_map(|(_, offsets)| offsets.get(p).copied())
                .min();
            if let Some(offset) = slowest {
                log.compact(offset);
            }
        }
    }
}

struct Inner {
    partitions: usize,
    max_pending: Option<usize>,
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
    commits: AtomicU64,
    heartbeats: AtomicU64,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new(partitions: u32, max_pending: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1) as usize,
                max_pending,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                commits: AtomicU64::new(0),
                heartbeats: AtomicU64::new(0),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    /// Open a session for `group` on `topic`, resuming from the group's
    /// committed offsets.
    pub fn subscribe(
        &self,
        group: &str,
        topic: &str,
        max_batch: usize,
        poll_timeout: Duration,
    ) -> MemorySession {
        let partitions = self.inner.partitions;
        let position = {
            let mut state = self.inner.lock();
            state.topic_mut(topic, partitions);
            state.committed_mut(group, topic, partitions).clone()
        };
        MemorySession {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            topic: topic.to_string(),
            position,
            resolved: vec![None; partitions],
            next_partition: 0,
            max_batch: max_batch.max(1),
            poll_timeout,
        }
    }

    /// Every message currently retained by `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        let state = self.inner.lock();
        state
            .topics
            .get(topic)
            .map(|parts| parts.iter().flat_map(|log| log.messages.iter().cloned()).collect())
            .unwrap_or_default()
    }

    /// Committed offset (next offset to read) of `group` for one partition.
    pub fn committed(&self, group: &str, topic: &str, partition: usize) -> Option<i64> {
        let state = self.inner.lock();
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|offsets| offsets.get(partition).copied())
    }

    /// Number of commit calls made by all sessions.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Number of heartbeat calls made by all sessions.
    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeats.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, target: &str, key: &str, payload: &[u8]) -> PublishOutcome {
        if self.is_closed() {
            return PublishOutcome::Failed("broker closed".into());
        }
        let partition = self.partition_for(key);
        {
            let mut state = self.inner.lock();
            let furthest = state.furthest_commit(target, partition);
            let log = &mut state.topic_mut(target, self.inner.partitions)[partition];
            let offset = log.next_offset();
            if let Some(cap) = self.inner.max_pending {
                if (offset - furthest).max(0) as usize >= cap {
                    return PublishOutcome::Backpressure;
                }
            }
            log.messages.push_back(BusMessage {
                key: key.to_string(),
                payload: payload.to_vec(),
                partition: partition as i32,
                offset,
            });
        }
        self.inner.notify.notify_waiters();
        PublishOutcome::Delivered
    }

    async fn close(&self) -> Result<(), TfError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        debug!("[memory-broker] closed");
        Ok(())
    }
}

/// Consumer-group session on a [`MemoryBroker`] topic.
pub struct MemorySession {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    /// Next offset to hand out, per partition.
    position: Vec<i64>,
    /// Highest resolved offset, per partition.
    resolved: Vec<Option<i64>>,
    next_partition: usize,
    max_batch: usize,
    poll_timeout: Duration,
}

impl MemorySession {
    /// Take the next batch if any partition has unread messages.
    fn take_ready(&mut self) -> Option<Batch> {
        let state = self.inner.lock();
        let parts = state.topics.get(&self.topic)?;
        let n = self.position.len();
        for i in 0..n {
            let p = (self.next_partition + i) % n;
            let messages = parts[p].read(self.position[p], self.max_batch);
            if let Some(last) = messages.last() {
                self.position[p] = last.offset + 1;
                self.next_partition = (p + 1) % n;
                return Some(Batch {
                    partition: p as i32,
                    messages,
                });
            }
        }
        None
    }

    fn index(&self, partition: i32) -> Result<usize, TfError> {
        usize::try_from(partition)
            .ok()
            .filter(|&p| p < self.position.len())
            .ok_or_else(|| TfError::Broker(format!("unknown partition {partition}")))
    }
}

#[async_trait]
impl ConsumerSession for MemorySession {
    async fn next_batch(&mut self) -> Result<Option<Batch>, TfError> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(TfError::Broker("broker closed".into()));
            }
            // Register interest before checking so a publish in between is not missed.
            let inner = Arc::clone(&self.inner);
            let notified = inner.notify.notified();
            if let Some(batch) = self.take_ready() {
                return Ok(Some(batch));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn resolve_offset(&mut self, partition: i32, offset: i64) {
        let Ok(p) = self.index(partition) else {
            return;
        };
        let slot = &mut self.resolved[p];
        if slot.is_none_or(|current| offset > current) {
            *slot = Some(offset);
        }
    }

    async fn commit(&mut self) -> Result<(), TfError> {
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        let partitions = self.inner.partitions;
        let mut state = self.inner.lock();
        let committed = state.committed_mut(&self.group, &self.topic, partitions);
        for (p, resolved) in self.resolved.iter().enumerate() {
            if let Some(offset) = resolved {
                committed[p] = committed[p].max(offset + 1);
            }
        }
        state.compact(&self.topic);
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), TfError> {
        self.inner.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rewind(&mut self, partition: i32) -> Result<(), TfError> {
        let p = self.index(partition)?;
        let first_unresolved = match self.resolved[p] {
            Some(offset) => offset + 1,
            None => {
                let state = self.inner.lock();
                state
                    .committed
                    .get(&(self.group.clone(), self.topic.clone()))
                    .and_then(|offsets| offsets.get(p).copied())
                    .unwrap_or(0)
            }
        };
        debug!(
            "[memory-session] rewind {}/{partition} from {} to {first_unresolved}",
            self.topic, self.position[p]
        );
        self.position[p] = first_unresolved;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TfError> {
        debug!("[memory-session] {} left {}", self.group, self.topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(20);

    async fn publish_n(broker: &MemoryBroker, key: &str, n: usize) {
        for i in 0..n {
            let outcome = broker.publish("ticker", key, format!("{i}").as_bytes()).await;
            assert_eq!(outcome, PublishOutcome::Delivered);
        }
    }

    #[tokio::test]
    async fn same_key_same_partition_in_order() {
        let broker = MemoryBroker::new(4, None);
        publish_n(&broker, "ticker.mock.A/B", 5).await;

        let msgs = broker.messages("ticker");
        assert_eq!(msgs.len(), 5);
        let p = broker.partition_for("ticker.mock.A/B") as i32;
        assert!(msgs.iter().all(|m| m.partition == p));
        let offsets: Vec<i64> = msgs.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let broker = MemoryBroker::new(2, None);
        let mut session = broker.subscribe("g", "ticker", 10, POLL);
        assert!(session.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let broker = MemoryBroker::new(1, None);
        let mut session = broker.subscribe("g", "ticker", 10, Duration::from_secs(5));

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("ticker", "k", b"v").await;
        });

        let batch = session.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn batches_respect_max_batch() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 7).await;
        let mut session = broker.subscribe("g", "ticker", 3, POLL);

        let sizes: Vec<usize> = [
            session.next_batch().await.unwrap().unwrap().len(),
            session.next_batch().await.unwrap().unwrap().len(),
            session.next_batch().await.unwrap().unwrap().len(),
        ]
        .into();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(session.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_persists_next_offset() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 4).await;
        let mut session = broker.subscribe("g", "ticker", 10, POLL);
        session.next_batch().await.unwrap();

        session.resolve_offset(0, 1);
        session.resolve_offset(0, 0); // lower offsets never move it back
        session.commit().await.unwrap();

        assert_eq!(broker.committed("g", "ticker", 0), Some(2));
        assert_eq!(broker.commit_count(), 1);
    }

    #[tokio::test]
    async fn rewind_redelivers_from_first_unresolved() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 5).await;
        let mut session = broker.subscribe("g", "ticker", 10, POLL);

        let first = session.next_batch().await.unwrap().unwrap();
        assert_eq!(first.len(), 5);
        session.resolve_offset(0, 1);
        session.rewind(0).await.unwrap();

        let again = session.next_batch().await.unwrap().unwrap();
        assert_eq!(again.first_offset(), Some(2));
        assert_eq!(again.len(), 3);
    }

    #[tokio::test]
    async fn rewind_without_resolution_uses_committed() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 3).await;
        let mut session = broker.subscribe("g", "ticker", 10, POLL);
        session.next_batch().await.unwrap();
        session.rewind(0).await.unwrap();
        assert_eq!(session.next_batch().await.unwrap().unwrap().first_offset(), Some(0));
    }

    #[tokio::test]
    async fn new_session_resumes_from_commit() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 3).await;
        {
            let mut session = broker.subscribe("g", "ticker", 10, POLL);
            session.next_batch().await.unwrap();
            session.resolve_offset(0, 1);
            session.commit().await.unwrap();
        }
        let mut session = broker.subscribe("g", "ticker", 10, POLL);
        let batch = session.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.first_offset(), Some(2));
    }

    #[tokio::test]
    async fn pending_cap_signals_backpressure() {
        let broker = MemoryBroker::new(1, Some(2));
        publish_n(&broker, "k", 2).await;
        assert_eq!(
            broker.publish("ticker", "k", b"x").await,
            PublishOutcome::Backpressure
        );

        let mut session = broker.subscribe("g", "ticker", 10, POLL);
        session.next_batch().await.unwrap();
        session.resolve_offset(0, 1);
        session.commit().await.unwrap();
        assert_eq!(broker.publish("ticker", "k", b"x").await, PublishOutcome::Delivered);
    }

    #[tokio::test]
    async fn logs_are_trimmed_behind_the_slowest_group() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 5).await;
        let mut fast = broker.subscribe("fast", "ticker", 10, POLL);
        let mut slow = broker.subscribe("slow", "ticker", 10, POLL);

        fast.next_batch().await.unwrap();
        fast.resolve_offset(0, 3);
        fast.commit().await.unwrap();
        assert_eq!(broker.messages("ticker").len(), 5);

        slow.next_batch().await.unwrap();
        slow.resolve_offset(0, 1);
        slow.commit().await.unwrap();
        let offsets: Vec<i64> = broker.messages("ticker").iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);

        // offsets keep counting after the trim
        assert_eq!(broker.publish("ticker", "k", b"5").await, PublishOutcome::Delivered);
        slow.rewind(0).await.unwrap();
        let batch = slow.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.first_offset(), Some(2));
        assert_eq!(batch.last_offset(), Some(5));
    }

    #[tokio::test]
    async fn late_group_starts_at_oldest_retained() {
        let broker = MemoryBroker::new(1, None);
        publish_n(&broker, "k", 4).await;
        let mut early = broker.subscribe("early", "ticker", 10, POLL);
        early.next_batch().await.unwrap();
        early.resolve_offset(0, 2);
        early.commit().await.unwrap();

        let mut late = broker.subscribe("late", "ticker", 10, POLL);
        let batch = late.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.first_offset(), Some(3));
    }

    #[tokio::test]
    async fn closed_broker_refuses_publish_and_poll() {
        let broker = MemoryBroker::new(1, None);
        let mut session = broker.subscribe("g", "ticker", 10, POLL);
        broker.close().await.unwrap();

        assert!(matches!(
            broker.publish("ticker", "k", b"v").await,
            PublishOutcome::Failed(_)
        ));
        assert!(session.next_batch().await.is_err());
    }
}
