//! Ticker consumer engine.
//!
//! [`TickerConsumer`] implements [`Worker`]. One task polls the session and
//! hands each batch to the [`BatchProcessor`]. When a batch stops early the
//! partition is rewound to its first unresolved offset and polling resumes
//! after a backoff, so the failed chunk is delivered again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tf_bus::{ConsumerSession, DeadLetterSink};
use tf_core::backoff::{Backoff, BackoffPolicy};
use tf_core::config::AppConfig;
use tf_core::metrics::MetricsAggregator;
use tf_core::monitor::{MonitorSink, spawn_reporter};
use tf_core::worker::Worker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::{ConsumerCounters, ConsumerReport};
use crate::policy::RecoveryPolicy;
use crate::processor::BatchProcessor;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub consumer_id: String,
    /// Only keys `ticker.<source_filter>.*` are stored.
    pub source_filter: Option<String>,
    pub chunk_size: usize,
    pub report_interval: Duration,
    pub redelivery_backoff: BackoffPolicy,
    pub extra_recoverable_codes: Vec<String>,
}

impl ConsumerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let c = &config.consumer;
        Self {
            consumer_id: c.effective_consumer_id(),
            source_filter: c.source_filter.clone(),
            chunk_size: c.effective_chunk_size(),
            report_interval: config.monitor.report_interval(),
            redelivery_backoff: c.effective_redelivery_backoff(),
            extra_recoverable_codes: c.extra_recoverable_codes.clone(),
        }
    }
}

pub struct TickerConsumer {
    name: String,
    settings: ConsumerSettings,
    session: Option<Box<dyn ConsumerSession>>,
    store: Arc<dyn Store>,
    dlq: Arc<dyn DeadLetterSink>,
    monitor: Arc<dyn MonitorSink>,
    metrics: Arc<MetricsAggregator<ConsumerCounters>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TickerConsumer {
    pub fn new(
        settings: ConsumerSettings,
        session: Box<dyn ConsumerSession>,
        store: Arc<dyn Store>,
        dlq: Arc<dyn DeadLetterSink>,
        monitor: Arc<dyn MonitorSink>,
    ) -> Self {
        Self {
            name: format!("consumer-{}", settings.consumer_id),
            settings,
            session: Some(session),
            store,
            dlq,
            monitor,
            metrics: Arc::new(MetricsAggregator::new()),
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator<ConsumerCounters>> {
        &self.metrics
    }
}

async fn poll_loop(
    label: String,
    processor: BatchProcessor,
    mut session: Box<dyn ConsumerSession>,
    policy: BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(policy);

    while !*shutdown.borrow() {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            res = session.next_batch() => res,
        };

        let delay = match polled {
            Ok(None) => continue,
            Ok(Some(batch)) => match processor.process(&batch, session.as_mut()).await {
                Ok(summary) => {
                    debug!("[{label}] partition {}: {summary:?}", batch.partition);
                    backoff.reset();
                    continue;
                }
                Err(e) => {
                    let partition = e.partition();
                    warn!("[{label}] {e}; rewinding for redelivery");
                    if let Err(err) = session.rewind(partition).await {
                        error!("[{label}] rewind of partition {partition} failed: {err}");
                    }
                    backoff.next_delay()
                }
            },
            Err(e) => {
                error!("[{label}] poll failed: {e}");
                backoff.next_delay()
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Err(e) = session.close().await {
        warn!("[{label}] session close failed: {e}");
    }
    info!("[{label}] poll loop stopped");
}

#[async_trait]
impl Worker for TickerConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("{} already started", self.name))?;

        let processor = BatchProcessor::new(
            self.settings.chunk_size,
            self.settings.source_filter.as_deref(),
            Arc::clone(&self.store),
            Arc::clone(&self.dlq),
            RecoveryPolicy::new(&self.settings.extra_recoverable_codes),
            Arc::clone(&self.metrics),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.tasks.push(tokio::spawn(poll_loop(
            self.name.clone(),
            processor,
            session,
            self.settings.redelivery_backoff.clone(),
            shutdown_rx.clone(),
        )));

        let consumer_id = self.settings.consumer_id.clone();
        self.tasks.push(spawn_reporter(
            self.name.clone(),
            self.settings.report_interval,
            Arc::clone(&self.metrics),
            Arc::clone(&self.monitor),
            move |snapshot| ConsumerReport::build(&consumer_id, &snapshot),
            shutdown_rx,
        ));

        self.shutdown_tx = Some(shutdown_tx);
        info!(
            "[{}] started (chunk size {}, filter {})",
            self.name,
            self.settings.chunk_size,
            self.settings.source_filter.as_deref().unwrap_or("none")
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
        info!("[{}] stopped", self.name);
        Ok(())
    }
}
