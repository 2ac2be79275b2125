//! Logging setup on the `tracing` ecosystem.
//!
//! Human-readable console output is always installed. With a log directory
//! a second layer writes JSON lines to a daily-rotating file named after the
//! process (`tickerflow-consumer.2026-01-31`, ...). `RUST_LOG` wins over the
//! level passed in.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Later calls are ignored.
///
/// - `log_level`: filter used when `RUST_LOG` is unset (e.g. `"info"`)
/// - `log_dir`: directory for the rotating JSON log, if any
/// - `process_name`: file prefix (e.g. `"tickerflow-producer"`)
pub fn init_logging(log_level: &str, log_dir: Option<&str>, process_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let console = fmt::layer().with_target(true);
    let file = log_dir.map(|dir| {
        fmt::layer()
            .json()
            .with_writer(tracing_appender::rolling::daily(dir, process_name))
            .with_ansi(false)
            .with_thread_ids(true)
    });

    // `Option<Layer>` is itself a layer, so the file output is simply absent
    // when no directory is configured.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
}
