//! Ticker producer engine.
//!
//! [`TickerProducer`] implements [`Worker`]:
//!
//! ```text
//! start() ──► targets(source_id) ──► chunk by chunk_size
//!         ──► per chunk: create_handle + spawn ShardWorker
//!         ──► spawn retry flush loop (every flush_interval)
//!         ──► spawn metrics reporter (every report_interval)
//! stop()  ──► signal shutdown, await every task
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tf_bus::{Broker, DeadLetterSink};
use tf_core::backoff::BackoffPolicy;
use tf_core::config::{AppConfig, OverflowPolicy};
use tf_core::metrics::MetricsAggregator;
use tf_core::monitor::{MonitorSink, spawn_reporter};
use tf_core::worker::Worker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::metrics::{ProducerCounters, ProducerReport};
use crate::retry_buffer::RetryBuffer;
use crate::shard::{ShardContext, ShardWorker};
use crate::source::SourceConnector;

/// Static producer settings resolved from config and CLI overrides.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub producer_id: String,
    pub source_id: String,
    pub topic: String,
    pub chunk_size: usize,
    pub retry_capacity: usize,
    pub retry_overflow: OverflowPolicy,
    pub flush_interval: Duration,
    pub report_interval: Duration,
    pub fetch_backoff: BackoffPolicy,
}

impl ProducerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let p = &config.producer;
        Self {
            producer_id: p.effective_producer_id(),
            source_id: p.effective_source_id(),
            topic: config.broker.effective_topic(),
            chunk_size: p.effective_chunk_size(),
            retry_capacity: p.effective_retry_capacity(),
            retry_overflow: p.effective_retry_overflow(),
            flush_interval: p.retry_flush_interval(),
            report_interval: config.monitor.report_interval(),
            fetch_backoff: p.effective_fetch_backoff(),
        }
    }
}

/// Split `targets` into consecutive chunks of at most `chunk_size` symbols.
pub fn shard_symbols(targets: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    targets.chunks(chunk_size.max(1)).map(<[String]>::to_vec).collect()
}

pub struct TickerProducer {
    name: String,
    settings: ProducerSettings,
    connector: Arc<dyn SourceConnector>,
    broker: Arc<dyn Broker>,
    dlq: Arc<dyn DeadLetterSink>,
    monitor: Arc<dyn MonitorSink>,
    metrics: Arc<MetricsAggregator<ProducerCounters>>,
    retry: Option<Arc<RetryBuffer>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TickerProducer {
    pub fn new(
        settings: ProducerSettings,
        connector: Arc<dyn SourceConnector>,
        broker: Arc<dyn Broker>,
        dlq: Arc<dyn DeadLetterSink>,
        monitor: Arc<dyn MonitorSink>,
    ) -> Self {
        Self {
            name: format!("producer-{}", settings.source_id),
            settings,
            connector,
            broker,
            dlq,
            monitor,
            metrics: Arc::new(MetricsAggregator::new()),
            retry: None,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Live counters of the current reporting interval.
    pub fn metrics(&self) -> &Arc<MetricsAggregator<ProducerCounters>> {
        &self.metrics
    }

    /// Retry buffer, available once started.
    pub fn retry_buffer(&self) -> Option<&Arc<RetryBuffer>> {
        self.retry.as_ref()
    }

    fn spawn_flush_loop(&mut self, ctx: Arc<ShardContext>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.flush_interval;
        let label = self.name.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let stats = ctx.retry.flush(ctx.broker.as_ref(), &ctx.metrics).await;
                for (shard, item) in stats.evicted {
                    ctx.metrics.update(shard, |c| c.retry_evicted += 1);
                    ctx.dead_letter(shard, &item.key, &item.payload).await;
                }
            }
            info!("[{label}] retry flush loop stopped");
        }));
    }
}

#[async_trait]
impl Worker for TickerProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let source_id = self.settings.source_id.clone();
        let targets = self
            .connector
            .targets(&source_id)
            .await
            .with_context(|| format!("loading {} targets for {source_id}", self.connector.name()))?;
        if targets.is_empty() {
            warn!("[{}] no symbols to watch", self.name);
        }

        let chunks = shard_symbols(&targets, self.settings.chunk_size);
        let retry = Arc::new(RetryBuffer::new(
            chunks.len(),
            self.settings.retry_capacity,
            self.settings.retry_overflow,
        ));
        let ctx = Arc::new(ShardContext {
            target: self.settings.topic.clone(),
            broker: Arc::clone(&self.broker),
            dlq: Arc::clone(&self.dlq),
            retry: Arc::clone(&retry),
            metrics: Arc::clone(&self.metrics),
            fetch_backoff: self.settings.fetch_backoff.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut started = 0usize;
        for (idx, symbols) in chunks.into_iter().enumerate() {
            match self.connector.create_handle(&source_id).await {
                Ok(handle) => {
                    let worker = ShardWorker::new(idx, handle, symbols, Arc::clone(&ctx));
                    self.tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
                    started += 1;
                }
                Err(e) => error!("[{}] shard {idx} handle failed: {e}", self.name),
            }
        }

        self.spawn_flush_loop(Arc::clone(&ctx), shutdown_rx.clone());

        let producer_id = self.settings.producer_id.clone();
        let gauge = Arc::clone(&retry);
        self.tasks.push(spawn_reporter(
            self.name.clone(),
            self.settings.report_interval,
            Arc::clone(&self.metrics),
            Arc::clone(&self.monitor),
            move |snapshot| ProducerReport::build(&producer_id, &snapshot, gauge.total_len()),
            shutdown_rx,
        ));

        self.retry = Some(retry);
        self.shutdown_tx = Some(shutdown_tx);
        info!(
            "[{}] started {started} shards over {} symbols (chunk size {})",
            self.name,
            targets.len(),
            self.settings.chunk_size
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("[{}] task ended abnormally: {e}", self.name);
            }
        }
        if let Some(retry) = &self.retry {
            let left = retry.total_len();
            if left > 0 {
                warn!("[{}] stopping with {left} items still in the retry buffer", self.name);
            }
        }
        info!("[{}] stopped", self.name);
        Ok(())
    }
}
