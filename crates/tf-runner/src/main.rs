//! # tf-runner
//!
//! Entry point for the ticker pipeline.
//!
//! Loads an optional JSON configuration file, applies command-line
//! overrides, then runs the producer, the consumer, or both in one process
//! until SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! tf-runner --mode producer --source live --chunk-size 10 --broker kafka
//! tf-runner --mode consumer --source-id binance --database-url postgres://tickerflow@db/tickerflow
//! tf-runner --mode local --tps 200 --symbol-count 50
//! ```
//!
//! Exit status is 0 after a graceful shutdown and 1 when startup fails.

mod app;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tf_core::config::{AppConfig, BrokerKind, SourceKind};
use tracing::{error, info};

use crate::app::App;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Watch the source and publish tickers.
    Producer,
    /// Persist tickers from the bus.
    Consumer,
    /// Producer and consumer over the in-process broker.
    Local,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Producer => "producer",
            Mode::Consumer => "consumer",
            Mode::Local => "local",
        }
    }
}

/// Ticker ingestion pipeline runner.
#[derive(Debug, Parser)]
#[command(name = "tf-runner", about = "Ticker ingestion pipeline runner")]
struct Cli {
    /// What this process runs.
    #[arg(long, value_enum, default_value = "local")]
    mode: Mode,

    /// Source id used in routing keys (producer) or as key filter (consumer).
    #[arg(long)]
    source_id: Option<String>,

    /// Upstream source: live (Binance) or mock.
    #[arg(long)]
    source: Option<SourceKind>,

    /// Symbols per producer shard.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Tickers per second per mock shard.
    #[arg(long)]
    tps: Option<u32>,

    /// Number of mock symbols.
    #[arg(long)]
    symbol_count: Option<usize>,

    /// Configuration file path (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Message bus backend: memory or kafka.
    #[arg(long)]
    broker: Option<BrokerKind>,

    /// Postgres URL for the consumer's ticker table.
    #[arg(long)]
    database_url: Option<String>,
}

impl Cli {
    /// Load the config file (if any) and apply command-line overrides.
    fn resolve_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => tf_core::config::load_config(path)?,
            None => AppConfig::default(),
        };

        let p = &mut config.producer;
        if let Some(id) = &self.source_id {
            p.source_id = Some(id.clone());
        }
        if let Some(source) = self.source {
            p.source = Some(source);
        } else if self.mode == Mode::Local && p.source.is_none() {
            p.source = Some(SourceKind::Mock);
        }
        if let Some(n) = self.chunk_size {
            p.chunk_size = Some(n);
        }
        if let Some(tps) = self.tps {
            p.tps = Some(tps);
        }
        if let Some(n) = self.symbol_count {
            p.symbol_count = Some(n);
        }

        if self.source_id.is_some() {
            config.consumer.source_filter = self.source_id.clone();
        }
        if let Some(kind) = self.broker {
            config.broker.kind = Some(kind);
        }
        if self.mode == Mode::Local {
            config.broker.kind = Some(BrokerKind::Memory);
        }
        if let Some(url) = &self.database_url {
            config.store.url = Some(url.clone());
        }
        if let Some(level) = &self.log_level {
            config.log.level = Some(level.clone());
        }
        if let Some(dir) = &self.log_dir {
            config.log.dir = Some(dir.clone());
        }
        Ok(config)
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 1. Configuration (logging is not up yet, so failures go to stderr)
    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tf-runner: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // 2. Logging
    let process_name = format!("tickerflow-{}", cli.mode.as_str());
    tf_core::logging::init_logging(
        config.log.level.as_deref().unwrap_or("info"),
        config.log.dir.as_deref(),
        &process_name,
    );
    info!(
        "tf-runner starting: mode={}, broker={:?}, config={}",
        cli.mode.as_str(),
        config.broker.effective_kind(),
        cli.config.as_ref().map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string()),
    );

    // 3. Build and start the pipeline
    let mut app = App::new(cli.mode, config);
    if let Err(e) = app.start().await {
        error!("startup failed: {e:#}");
        app.shutdown().await;
        return ExitCode::FAILURE;
    }
    info!("{} running, press Ctrl+C to stop", process_name);

    // 4. Wait for shutdown
    if let Err(e) = shutdown_signal().await {
        error!("signal handler failed: {e}");
    }
    info!("shutdown signal received");

    // 5. Stop everything
    app.shutdown().await;
    info!("goodbye");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cli = Cli::parse_from([
            "tf-runner",
            "--mode",
            "producer",
            "--source",
            "mock",
            "--source-id",
            "upbit",
            "--chunk-size",
            "7",
            "--tps",
            "5",
            "--broker",
            "kafka",
            "--database-url",
            "postgres://u@db/t",
        ]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.producer.effective_source(), SourceKind::Mock);
        assert_eq!(config.producer.effective_source_id(), "upbit");
        assert_eq!(config.producer.effective_chunk_size(), 7);
        assert_eq!(config.producer.effective_tps(), 5);
        assert_eq!(config.consumer.source_filter.as_deref(), Some("upbit"));
        assert_eq!(config.broker.effective_kind(), BrokerKind::Kafka);
        assert_eq!(config.store.effective_url(), "postgres://u@db/t");
    }

    #[test]
    fn local_mode_forces_memory_broker_and_mock_source() {
        let cli = Cli::parse_from(["tf-runner", "--mode", "local", "--broker", "kafka"]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.broker.effective_kind(), BrokerKind::Memory);
        assert_eq!(config.producer.effective_source(), SourceKind::Mock);
    }

    #[test]
    fn live_is_an_alias_for_binance() {
        let cli = Cli::parse_from(["tf-runner", "--mode", "producer", "--source", "live"]);
        assert_eq!(cli.source, Some(SourceKind::Binance));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["tf-runner", "--config", "/nonexistent/tickerflow.json"]);
        assert!(cli.resolve_config().is_err());
    }
}
