//! Kafka adapter over `rdkafka`.
//!
//! Publishing goes through a `FutureProducer`; a full local queue is reported
//! as [`PublishOutcome::Backpressure`]. Consumption uses a `StreamConsumer`
//! with auto-commit disabled: offsets are committed only for what the
//! processor resolved, and a rewind seeks the partition back to its first
//! unresolved offset.
//!
//! Client creation in librdkafka is lazy, so both constructors fetch cluster
//! metadata once and fail when no broker answers within the connect timeout.

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tf_core::BusMessage;
use tf_core::error::TfError;
use tracing::{debug, info, warn};

use crate::{Batch, Broker, ConsumerSession, PublishOutcome};

/// How long to keep collecting after the first message of a poll.
const LINGER: Duration = Duration::from_millis(5);

fn broker_err(e: KafkaError) -> TfError {
    TfError::Broker(e.to_string())
}

fn to_bus_message(m: &impl Message) -> BusMessage {
    BusMessage {
        key: m
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default(),
        payload: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        partition: m.partition(),
        offset: m.offset(),
    }
}

pub struct KafkaBroker {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaBroker {
    pub fn new(
        brokers: &str,
        client_id: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, TfError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(broker_err)?;
        let metadata = producer
            .client()
            .fetch_metadata(None, connect_timeout)
            .map_err(|e| TfError::Broker(format!("cannot reach {brokers}: {e}")))?;
        debug!("[kafka] {} brokers visible", metadata.brokers().len());
        info!("[kafka] producer {client_id} -> {brokers}");
        Ok(Self { producer, timeout })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, target: &str, key: &str, payload: &[u8]) -> PublishOutcome {
        let record = FutureRecord::to(target).key(key).payload(payload);
        match self.producer.send(record, self.timeout).await {
            Ok(_) => PublishOutcome::Delivered,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                PublishOutcome::Backpressure
            }
            Err((e, _)) => PublishOutcome::Failed(e.to_string()),
        }
    }

    async fn close(&self) -> Result<(), TfError> {
        self.producer.flush(self.timeout).map_err(broker_err)
    }
}

pub struct KafkaSession {
    consumer: StreamConsumer,
    topic: String,
    max_batch: usize,
    poll_timeout: Duration,
    /// Messages received but not yet handed out, per partition.
    stash: AHashMap<i32, VecDeque<BusMessage>>,
    /// First offset not yet resolved, per partition.
    rewind_to: AHashMap<i32, i64>,
    resolved: AHashMap<i32, i64>,
    committed: AHashMap<i32, i64>,
}

impl KafkaSession {
    pub fn new(
        brokers: &str,
        group_id: &str,
        client_id: &str,
        topic: &str,
        max_batch: usize,
        poll_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, TfError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("client.id", client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(broker_err)?;
        consumer
            .fetch_metadata(Some(topic), connect_timeout)
            .map_err(|e| TfError::Broker(format!("cannot reach {brokers}: {e}")))?;
        consumer.subscribe(&[topic]).map_err(broker_err)?;
        info!("[kafka] consumer {client_id} joined {group_id} on {topic}");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            max_batch: max_batch.max(1),
            poll_timeout,
            stash: AHashMap::new(),
            rewind_to: AHashMap::new(),
            resolved: AHashMap::new(),
            committed: AHashMap::new(),
        })
    }

    fn push_stash(&mut self, msg: BusMessage) {
        self.rewind_to.entry(msg.partition).or_insert(msg.offset);
        self.stash.entry(msg.partition).or_default().push_back(msg);
    }

    fn take_stashed(&mut self) -> Option<Batch> {
        let partition = self
            .stash
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(p, _)| *p)
            .min()?;
        let queue = self.stash.get_mut(&partition)?;
        let n = queue.len().min(self.max_batch);
        let messages: Vec<BusMessage> = queue.drain(..n).collect();
        Some(Batch { partition, messages })
    }

    fn stashed_len(&self) -> usize {
        self.stash.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl ConsumerSession for KafkaSession {
    async fn next_batch(&mut self) -> Result<Option<Batch>, TfError> {
        if let Some(batch) = self.take_stashed() {
            return Ok(Some(batch));
        }

        let first = match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(result) => result.map_err(broker_err)?.detach(),
        };
        let mut received = vec![first];
        while received.len() < self.max_batch {
            match tokio::time::timeout(LINGER, self.consumer.recv()).await {
                Ok(Ok(m)) => received.push(m.detach()),
                Ok(Err(e)) => {
                    warn!("[kafka] recv error while batching: {e}");
                    break;
                }
                Err(_) => break,
            }
        }
        for m in &received {
            self.push_stash(to_bus_message(m));
        }
        debug!("[kafka] polled {} messages", self.stashed_len());
        Ok(self.take_stashed())
    }

    fn resolve_offset(&mut self, partition: i32, offset: i64) {
        let slot = self.resolved.entry(partition).or_insert(offset);
        if offset > *slot {
            *slot = offset;
        }
        self.rewind_to.insert(partition, *slot + 1);
    }

    async fn commit(&mut self) -> Result<(), TfError> {
        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in &self.resolved {
            if self.committed.get(&partition).is_some_and(|&c| c > offset) {
                continue;
            }
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
                .map_err(broker_err)?;
        }
        if tpl.count() == 0 {
            return Ok(());
        }
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(broker_err)?;
        for (&partition, &offset) in &self.resolved {
            self.committed.insert(partition, offset + 1);
        }
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), TfError> {
        // librdkafka heartbeats from its own background thread.
        Ok(())
    }

    async fn rewind(&mut self, partition: i32) -> Result<(), TfError> {
        self.stash.remove(&partition);
        let Some(&offset) = self.rewind_to.get(&partition) else {
            return Ok(());
        };
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(offset), self.poll_timeout)
            .map_err(broker_err)?;
        debug!("[kafka] rewound {}/{partition} to {offset}", self.topic);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TfError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNREACHABLE: &str = "127.0.0.1:1";

    #[test]
    fn producer_fails_without_a_reachable_broker() {
        let result = KafkaBroker::new(
            UNREACHABLE,
            "tf-test",
            Duration::from_secs(1),
            Duration::from_millis(500),
        );
        assert!(matches!(result, Err(TfError::Broker(_))));
    }

    #[test]
    fn session_fails_without_a_reachable_broker() {
        let result = KafkaSession::new(
            UNREACHABLE,
            "tf-test-group",
            "tf-test",
            "ticker",
            10,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        assert!(matches!(result, Err(TfError::Broker(_))));
    }
}
