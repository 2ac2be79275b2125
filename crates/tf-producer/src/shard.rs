//! Producer shard worker.
//!
//! One worker owns a disjoint chunk of symbols and a [`SourceHandle`]. It
//! loops fetch → publish until shutdown:
//!
//! ```text
//! watch ──ok──► encode ──► publish ──Delivered────► count
//!   │              │           ├──Backpressure──► retry buffer
//!   │              │           └──Failed────────► retry buffer
//!   │              └──invalid──► DLQ
//!   └──err──► count, sleep(backoff)
//! ```
//!
//! The worker never waits on the retry buffer or the DLQ beyond a single
//! push or send.

use std::sync::Arc;
use std::time::Instant;

use tf_bus::{Broker, DeadLetterSink, PublishOutcome};
use tf_core::backoff::{Backoff, BackoffPolicy};
use tf_core::metrics::{MetricsAggregator, ShardId};
use tf_core::types::{TickerSnapshot, routing_key};
use tf_core::time_util;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::ProducerCounters;
use crate::retry_buffer::{PushOutcome, RetryBuffer, RetryItem};
use crate::source::SourceHandle;

/// Collaborators shared by every shard of one producer.
pub struct ShardContext {
    /// Primary topic.
    pub target: String,
    pub broker: Arc<dyn Broker>,
    pub dlq: Arc<dyn DeadLetterSink>,
    pub retry: Arc<RetryBuffer>,
    pub metrics: Arc<MetricsAggregator<ProducerCounters>>,
    pub fetch_backoff: BackoffPolicy,
}

impl ShardContext {
    /// Send a message to the DLQ on behalf of `shard` and count it.
    pub async fn dead_letter(&self, shard: ShardId, key: &str, payload: &[u8]) {
        match self.dlq.send(key, payload).await {
            Ok(()) => self.metrics.update(shard, |c| c.dead_lettered += 1),
            Err(e) => error!("[shard-{shard}] dead letter for {key} lost: {e}"),
        }
    }

    /// Queue a failed publish; whatever the buffer displaces goes to the DLQ.
    pub async fn enqueue_retry(&self, shard: ShardId, item: RetryItem) {
        let displaced = match self.retry.push(shard, item) {
            PushOutcome::Queued => return,
            PushOutcome::Evicted(old) => old,
            PushOutcome::Rejected(new) => new,
        };
        warn!("[shard-{shard}] retry buffer full, diverting {}", displaced.key);
        self.metrics.update(shard, |c| c.retry_evicted += 1);
        self.dead_letter(shard, &displaced.key, &displaced.payload).await;
    }

    /// Encode and publish one ticker, diverting failures to the retry buffer
    /// and invalid snapshots to the DLQ.
    pub async fn publish_ticker(&self, id: ShardId, source_id: &str, ticker: TickerSnapshot) {
        let key = routing_key(source_id, &ticker.symbol);

        let payload = match ticker.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!("[shard-{id}] {key} not serializable: {e}");
                self.dead_letter(id, &key, ticker.to_string().as_bytes()).await;
                return;
            }
        };
        if ticker.pair().is_none() {
            warn!("[shard-{id}] {key} is not a BASE/QUOTE pair");
            self.dead_letter(id, &key, &payload).await;
            return;
        }

        let start = Instant::now();
        match self.broker.publish(&self.target, &key, &payload).await {
            PublishOutcome::Delivered => {
                let latency = time_util::elapsed_ms(start);
                self.metrics.update(id, |c| c.publish.record_ok(latency));
            }
            PublishOutcome::Backpressure => {
                debug!("[shard-{id}] backpressure on {key}, buffering");
                self.metrics.update(id, |c| c.back_pressure += 1);
                self.enqueue_retry(id, RetryItem::new(&self.target, key, payload))
                    .await;
            }
            PublishOutcome::Failed(reason) => {
                warn!("[shard-{id}] publish {key} failed: {reason}");
                self.metrics.update(id, |c| c.publish.record_error());
                self.enqueue_retry(id, RetryItem::new(&self.target, key, payload))
                    .await;
            }
        }
    }
}

/// Fetch/publish loop for one chunk of symbols.
pub struct ShardWorker {
    id: ShardId,
    source_id: String,
    handle: Box<dyn SourceHandle>,
    symbols: Vec<String>,
    ctx: Arc<ShardContext>,
    backoff: Backoff,
}

impl ShardWorker {
    pub fn new(
        id: ShardId,
        handle: Box<dyn SourceHandle>,
        symbols: Vec<String>,
        ctx: Arc<ShardContext>,
    ) -> Self {
        let backoff = Backoff::new(ctx.fetch_backoff.clone());
        Self {
            id,
            source_id: handle.source_id().to_string(),
            handle,
            symbols,
            ctx,
            backoff,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let id = self.id;
        info!("[shard-{id}] watching {} symbols via {}", self.symbols.len(), self.source_id);

        while !*shutdown.borrow() {
            let start = Instant::now();
            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                res = self.handle.watch(&self.symbols) => res,
            };

            match fetched {
                Ok(ticker) => {
                    let latency = time_util::elapsed_ms(start);
                    self.ctx.metrics.update(id, |c| c.watch.record_ok(latency));
                    self.backoff.reset();
                    self.ctx.publish_ticker(id, &self.source_id, ticker).await;
                }
                Err(e) => {
                    self.ctx.metrics.update(id, |c| c.watch.record_error());
                    let delay = self.backoff.next_delay();
                    warn!("[shard-{id}] watch failed (attempt {}): {e}, retrying in {delay:?}", self.backoff.attempt());
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.handle.close().await;
        info!("[shard-{id}] stopped");
    }
}
