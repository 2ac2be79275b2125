//! Periodic reporting to an external monitor.
//!
//! A reporter task ticks at a fixed interval, drains the
//! [`MetricsAggregator`], turns the snapshot into a JSON report, and hands it
//! to a [`MonitorSink`]. Send failures are logged and swallowed: the monitor
//! being down must never stall or crash a worker.
//!
//! ```text
//! hot path ──update──► MetricsAggregator ──drain (every tick)──► build_report ──► MonitorSink
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::TfError;
use crate::metrics::{Counters, MetricsAggregator, MetricsSnapshot};

/// Destination for periodic metric reports.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn send(&self, report: &serde_json::Value) -> Result<(), TfError>;
}

/// POSTs each report as JSON to a fixed URL.
pub struct HttpMonitor {
    client: reqwest::Client,
    url: String,
}

impl HttpMonitor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TfError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TfError::Monitor(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MonitorSink for HttpMonitor {
    async fn send(&self, report: &serde_json::Value) -> Result<(), TfError> {
        self.client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TfError::Monitor(e.to_string()))?;
        Ok(())
    }
}

/// Writes reports to the log at debug level. Used when no URL is configured.
pub struct LogMonitor {
    label: String,
}

impl LogMonitor {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

#[async_trait]
impl MonitorSink for LogMonitor {
    async fn send(&self, report: &serde_json::Value) -> Result<(), TfError> {
        debug!("[{}] metrics {report}", self.label);
        Ok(())
    }
}

/// Pick the HTTP monitor when a URL is configured, else the log monitor.
pub fn monitor_for(
    url: Option<&str>,
    timeout: Duration,
    label: &str,
) -> Result<Arc<dyn MonitorSink>, TfError> {
    match url {
        Some(url) => Ok(Arc::new(HttpMonitor::new(url, timeout)?)),
        None => Ok(Arc::new(LogMonitor::new(label))),
    }
}

/// Build one report as JSON and send it, swallowing failures with a warning.
pub async fn report_once<R: Serialize>(label: &str, sink: &dyn MonitorSink, report: &R) {
    let value = match serde_json::to_value(report) {
        Ok(v) => v,
        Err(e) => {
            warn!("[{label}] metrics encode failed: {e}");
            return;
        }
    };
    if let Err(e) = sink.send(&value).await {
        warn!("[{label}] metrics send failed: {e}");
    }
}

/// Spawn the periodic reporter.
///
/// Every `interval` the aggregator is drained (reset) first and the report is
/// sent afterwards, so counters restart from zero whether or not the send
/// succeeds. The task exits when `shutdown` flips to `true`.
pub fn spawn_reporter<C, R, F>(
    label: String,
    interval: Duration,
    metrics: Arc<MetricsAggregator<C>>,
    sink: Arc<dyn MonitorSink>,
    build_report: F,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    C: Counters,
    R: Serialize + Send + Sync,
    F: Fn(MetricsSnapshot<C>) -> R + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let report = build_report(metrics.drain());
            report_once(&label, sink.as_ref(), &report).await;
        }
        debug!("[{label}] reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Default, Clone)]
    struct Hits(u64);

    impl Counters for Hits {
        fn merge(&mut self, other: &Self) {
            self.0 += other.0;
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<serde_json::Value>>);

    #[async_trait]
    impl MonitorSink for Recording {
        async fn send(&self, report: &serde_json::Value) -> Result<(), TfError> {
            self.0.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MonitorSink for Failing {
        async fn send(&self, _report: &serde_json::Value) -> Result<(), TfError> {
            Err(TfError::Monitor("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn http_monitor_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/producer"))
            .and(body_partial_json(serde_json::json!({ "producerId": "p-1" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let monitor = HttpMonitor::new(format!("{}/producer", server.uri()), Duration::from_secs(1)).unwrap();
        monitor
            .send(&serde_json::json!({ "producerId": "p-1", "watchTotal": 3 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_monitor_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let monitor = HttpMonitor::new(server.uri(), Duration::from_secs(1)).unwrap();
        let result = monitor.send(&serde_json::json!({})).await;
        assert!(matches!(result, Err(TfError::Monitor(_))));
    }

    #[tokio::test]
    async fn reporter_drains_each_tick() {
        let metrics = Arc::new(MetricsAggregator::<Hits>::new());
        let sink = Arc::new(Recording::default());
        let (tx, rx) = watch::channel(false);

        metrics.update(0, |h| h.0 += 4);
        let task = spawn_reporter(
            "test".into(),
            Duration::from_millis(20),
            Arc::clone(&metrics),
            sink.clone(),
            |snap| serde_json::json!({ "hits": snap.totals().0 }),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(90)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let reports = sink.0.lock().unwrap().clone();
        assert!(reports.len() >= 2, "expected several ticks, got {}", reports.len());
        assert_eq!(reports[0]["hits"], 4);
        assert!(reports[1..].iter().all(|r| r["hits"] == 0));
        assert_eq!(metrics.peek().totals().0, 0);
    }

    #[derive(Serialize)]
    struct HitReport {
        hits: u64,
    }

    #[tokio::test]
    async fn reporter_survives_sink_failures() {
        let metrics = Arc::new(MetricsAggregator::<Hits>::new());
        let (tx, rx) = watch::channel(false);
        metrics.update(0, |h| h.0 += 1);

        let task = spawn_reporter(
            "test".into(),
            Duration::from_millis(10),
            Arc::clone(&metrics),
            Arc::new(Failing),
            |snap| HitReport { hits: snap.totals().0 },
            rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(metrics.peek().totals().0, 0);
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
