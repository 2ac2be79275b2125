//! Producer counters and the monitor report built from them.

use serde::Serialize;
use tf_core::metrics::{Counters, MetricsSnapshot, OpStats};

/// Per-shard producer counters for one reporting interval.
#[derive(Debug, Clone, Default)]
pub struct ProducerCounters {
    pub watch: OpStats,
    pub publish: OpStats,
    pub back_pressure: u64,
    pub retry_evicted: u64,
    pub dead_lettered: u64,
}

impl Counters for ProducerCounters {
    fn merge(&mut self, other: &Self) {
        self.watch.merge(&other.watch);
        self.publish.merge(&other.publish);
        self.back_pressure += other.back_pressure;
        self.retry_evicted += other.retry_evicted;
        self.dead_lettered += other.dead_lettered;
    }
}

/// JSON body posted to the monitor every interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerReport {
    pub producer_id: String,
    pub avg_watch_latency: f64,
    pub avg_publish_latency: f64,
    pub watch_total: u64,
    pub watch_error_total: u64,
    pub publish_total: u64,
    pub publish_error_total: u64,
    pub retry_buffer_length: usize,
    pub back_pressure_count: u64,
    pub retry_evicted_total: u64,
    pub dead_letter_total: u64,
}

impl ProducerReport {
    /// Aggregate a drained snapshot. `retry_buffer_length` is a gauge read at
    /// report time rather than a counter.
    pub fn build(
        producer_id: &str,
        snapshot: &MetricsSnapshot<ProducerCounters>,
        retry_buffer_length: usize,
    ) -> Self {
        let total = snapshot.totals();
        Self {
            producer_id: producer_id.to_string(),
            avg_watch_latency: total.watch.avg_latency_ms(),
            avg_publish_latency: total.publish.avg_latency_ms(),
            watch_total: total.watch.count,
            watch_error_total: total.watch.error_count,
            publish_total: total.publish.count,
            publish_error_total: total.publish.error_count,
            retry_buffer_length,
            back_pressure_count: total.back_pressure,
            retry_evicted_total: total.retry_evicted,
            dead_letter_total: total.dead_lettered,
        }
    }
}

#[cfg(test)]
mod tests {
    use tf_core::metrics::MetricsAggregator;

    use super::*;

    #[test]
    fn report_sums_shards_and_averages() {
        let agg = MetricsAggregator::<ProducerCounters>::new();
        agg.update(0, |c| {
            c.watch.record_ok(2.0);
            c.publish.record_ok(1.0);
        });
        agg.update(1, |c| {
            c.watch.record_ok(4.0);
            c.watch.record_error();
            c.publish.record_error();
            c.back_pressure += 1;
        });

        let report = ProducerReport::build("p-1", &agg.drain(), 5);
        assert_eq!(report.watch_total, 2);
        assert_eq!(report.watch_error_total, 1);
        assert_eq!(report.avg_watch_latency, 3.0);
        assert_eq!(report.publish_total, 1);
        assert_eq!(report.publish_error_total, 1);
        assert_eq!(report.back_pressure_count, 1);
        assert_eq!(report.retry_buffer_length, 5);
    }

    #[test]
    fn empty_interval_reports_zeros() {
        let report = ProducerReport::build("p-1", &MetricsAggregator::<ProducerCounters>::new().drain(), 0);
        assert_eq!(report.avg_watch_latency, 0.0);
        assert_eq!(report.avg_publish_latency, 0.0);
        assert_eq!(report.publish_total, 0);
    }

    #[test]
    fn serializes_camel_case() {
        let report = ProducerReport::build("p-9", &MetricsAggregator::<ProducerCounters>::new().drain(), 0);
        let v = serde_json::to_value(&report).unwrap();
        for field in [
            "producerId",
            "avgWatchLatency",
            "avgPublishLatency",
            "watchTotal",
            "watchErrorTotal",
            "publishTotal",
            "publishErrorTotal",
            "retryBufferLength",
            "backPressureCount",
        ] {
            assert!(v.get(field).is_some(), "missing {field}");
        }
        assert_eq!(v["producerId"], "p-9");
    }
}
