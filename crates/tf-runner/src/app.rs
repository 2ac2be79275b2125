//! Wires config into running workers and tears them down in order.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tf_bus::{Broker, ConsumerSession, DeadLetterSink, DlqRouter, MemoryBroker};
use tf_consumer::{ConsumerSettings, MemoryStore, PgStore, Store, TickerConsumer};
use tf_core::config::{AppConfig, BrokerKind, StoreKind};
use tf_core::monitor::monitor_for;
use tf_core::worker::Worker;
use tf_producer::{ProducerSettings, TickerProducer, create_source};
use tracing::{error, info, warn};

use crate::Mode;

pub struct App {
    mode: Mode,
    config: AppConfig,
    broker: Option<Arc<dyn Broker>>,
    memory: Option<MemoryBroker>,
    store: Option<Arc<dyn Store>>,
    workers: Vec<Box<dyn Worker>>,
}

impl App {
    pub fn new(mode: Mode, config: AppConfig) -> Self {
        Self {
            mode,
            config,
            broker: None,
            memory: None,
            store: None,
            workers: Vec::new(),
        }
    }

    /// Open the bus and store, then start the workers for this mode. On
    /// error, whatever was opened stays recorded for [`App::shutdown`].
    pub async fn start(&mut self) -> Result<()> {
        let broker = self.open_broker()?;
        let dlq_topic = self.config.broker.effective_dlq_topic();
        let dlq: Arc<dyn DeadLetterSink> = Arc::new(DlqRouter::new(Arc::clone(&broker), dlq_topic));

        if self.mode != Mode::Consumer {
            self.start_producer(Arc::clone(&broker), Arc::clone(&dlq)).await?;
        }
        if self.mode != Mode::Producer {
            self.start_consumer(dlq).await?;
        }
        if self.mode != Mode::Local && self.memory.is_some() {
            warn!("in-memory broker outside local mode: nothing crosses the process boundary");
        }
        Ok(())
    }

    fn open_broker(&mut self) -> Result<Arc<dyn Broker>> {
        let cfg = &self.config.broker;
        let broker: Arc<dyn Broker> = match cfg.effective_kind() {
            BrokerKind::Memory => {
                let memory = MemoryBroker::new(cfg.effective_partitions(), cfg.max_pending);
                info!("[runner] in-memory broker with {} partitions", memory.partitions());
                self.memory = Some(memory.clone());
                Arc::new(memory)
            }
            BrokerKind::Kafka => kafka_broker(&self.config)?,
        };
        self.broker = Some(Arc::clone(&broker));
        Ok(broker)
    }

    fn open_session(&self) -> Result<Box<dyn ConsumerSession>> {
        let cfg = &self.config;
        match &self.memory {
            Some(memory) => Ok(Box::new(memory.subscribe(
                &cfg.broker.effective_group_id(),
                &cfg.broker.effective_topic(),
                cfg.consumer.effective_max_batch(),
                cfg.consumer.poll_timeout(),
            ))),
            None => kafka_session(cfg),
        }
    }

    /// Local mode keeps rows in memory; every other mode writes to Postgres
    /// and fails here when the database cannot be reached.
    async fn open_store(&mut self) -> Result<Arc<dyn Store>> {
        let store: Arc<dyn Store> = match (self.mode, self.config.store.effective_kind()) {
            (Mode::Local, _) => {
                info!("[runner] in-memory store");
                Arc::new(MemoryStore::new())
            }
            (_, StoreKind::Memory) => bail!("store kind 'memory' is only available in local mode"),
            (_, StoreKind::Postgres) => Arc::new(
                PgStore::connect(&self.config.store)
                    .await
                    .context("connecting to postgres")?,
            ),
        };
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn start_producer(
        &mut self,
        broker: Arc<dyn Broker>,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Result<()> {
        let connector = create_source(&self.config.producer).context("creating source connector")?;
        let monitor = monitor_for(
            self.config.monitor.producer_url.as_deref(),
            self.config.monitor.timeout(),
            "producer-monitor",
        )?;
        let mut producer = TickerProducer::new(
            ProducerSettings::from_config(&self.config),
            connector,
            broker,
            dlq,
            monitor,
        );
        producer.start().await.context("starting producer")?;
        info!("[runner] worker '{}' started", producer.name());
        self.workers.push(Box::new(producer));
        Ok(())
    }

    async fn start_consumer(&mut self, dlq: Arc<dyn DeadLetterSink>) -> Result<()> {
        let store = self.open_store().await?;
        let session = self.open_session().context("opening consumer session")?;
        let monitor = monitor_for(
            self.config.monitor.consumer_url.as_deref(),
            self.config.monitor.timeout(),
            "consumer-monitor",
        )?;
        let mut consumer = TickerConsumer::new(
            ConsumerSettings::from_config(&self.config),
            session,
            store,
            dlq,
            monitor,
        );
        consumer.start().await.context("starting consumer")?;
        info!("[runner] worker '{}' started", consumer.name());
        self.workers.push(Box::new(consumer));
        Ok(())
    }

    /// Stop every worker (producers first), then close the bus and the store.
    pub async fn shutdown(&mut self) {
        for worker in &mut self.workers {
            info!("[runner] stopping '{}'", worker.name());
            if let Err(e) = worker.stop().await {
                error!("[runner] error stopping '{}': {e:#}", worker.name());
            }
        }
        self.workers.clear();

        if let Some(broker) = self.broker.take() {
            if let Err(e) = broker.close().await {
                error!("[runner] broker close failed: {e}");
            }
        }
        if let Some(store) = self.store.take() {
            if let Err(e) = store.close().await {
                error!("[runner] store close failed: {e}");
            }
        }
        self.memory = None;
    }
}

#[cfg(feature = "kafka")]
fn kafka_broker(config: &AppConfig) -> Result<Arc<dyn Broker>> {
    let cfg = &config.broker;
    let broker = tf_bus::kafka::KafkaBroker::new(
        &cfg.effective_brokers(),
        &cfg.effective_client_id("producer"),
        cfg.publish_timeout(),
        cfg.connect_timeout(),
    )?;
    Ok(Arc::new(broker))
}

#[cfg(feature = "kafka")]
fn kafka_session(config: &AppConfig) -> Result<Box<dyn ConsumerSession>> {
    let b = &config.broker;
    let session = tf_bus::kafka::KafkaSession::new(
        &b.effective_brokers(),
        &b.effective_group_id(),
        &b.effective_client_id("consumer"),
        &b.effective_topic(),
        config.consumer.effective_max_batch(),
        config.consumer.poll_timeout(),
        b.connect_timeout(),
    )?;
    Ok(Box::new(session))
}

#[cfg(not(feature = "kafka"))]
fn kafka_broker(_config: &AppConfig) -> Result<Arc<dyn Broker>> {
    anyhow::bail!("broker kind 'kafka' requires building with --features kafka")
}

#[cfg(not(feature = "kafka"))]
fn kafka_session(_config: &AppConfig) -> Result<Box<dyn ConsumerSession>> {
    anyhow::bail!("broker kind 'kafka' requires building with --features kafka")
}
