//! Per-shard metrics aggregation.
//!
//! Hot-path operations record into a [`MetricsAggregator`] keyed by shard id.
//! The reporter task periodically calls [`MetricsAggregator::drain`], which
//! swaps the whole map for an empty one under a single lock, so a snapshot
//! and its reset are one atomic step and no increment is lost between them.
//!
//! The lock is a plain `std::sync::Mutex`: critical sections are a hash
//! lookup plus a few additions and never span an `.await`.

use std::sync::Mutex;

use ahash::AHashMap;

/// Identifier of a producer shard (or consumer partition).
pub type ShardId = usize;

/// Count / error / latency-sum triple for one kind of operation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpStats {
    pub count: u64,
    pub error_count: u64,
    pub latency_sum_ms: f64,
}

impl OpStats {
    #[inline]
    pub fn record_ok(&mut self, latency_ms: f64) {
        self.count += 1;
        self.latency_sum_ms += latency_ms;
    }

    #[inline]
    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Average latency of successful operations; 0 when there were none.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.latency_sum_ms / self.count as f64 }
    }

    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.error_count += other.error_count;
        self.latency_sum_ms += other.latency_sum_ms;
    }
}

/// A bundle of counters that can be summed across shards.
pub trait Counters: Default + Send + 'static {
    fn merge(&mut self, other: &Self);
}

/// The drained contents of an aggregator for one reporting interval.
#[derive(Debug)]
pub struct MetricsSnapshot<C> {
    pub shards: AHashMap<ShardId, C>,
}

impl<C: Counters> MetricsSnapshot<C> {
    /// Sum of all shards' counters.
    pub fn totals(&self) -> C {
        let mut total = C::default();
        for counters in self.shards.values() {
            total.merge(counters);
        }
        total
    }

    pub fn shard(&self, id: ShardId) -> Option<&C> {
        self.shards.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Concurrent per-shard counter map.
pub struct MetricsAggregator<C> {
    shards: Mutex<AHashMap<ShardId, C>>,
}

impl<C: Counters> MetricsAggregator<C> {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(AHashMap::new()),
        }
    }

    /// Apply `f` to the counters of `shard`, creating them on first use.
    #[inline]
    pub fn update(&self, shard: ShardId, f: impl FnOnce(&mut C)) {
        let mut shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());
        f(shards.entry(shard).or_default());
    }

    /// Take every shard's counters and leave the aggregator empty.
    pub fn drain(&self) -> MetricsSnapshot<C> {
        let mut shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            shards: std::mem::take(&mut *shards),
        }
    }
}

impl<C: Counters + Clone> MetricsAggregator<C> {
    /// Copy of the current counters without resetting them.
    pub fn peek(&self) -> MetricsSnapshot<C> {
        let shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            shards: shards.clone(),
        }
    }
}

impl<C: Counters> Default for MetricsAggregator<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct TestCounters {
        op: OpStats,
        dropped: u64,
    }

    impl Counters for TestCounters {
        fn merge(&mut self, other: &Self) {
            self.op.merge(&other.op);
            self.dropped += other.dropped;
        }
    }

    #[test]
    fn averages_are_zero_without_samples() {
        assert_eq!(OpStats::default().avg_latency_ms(), 0.0);
        let mut s = OpStats::default();
        s.record_ok(10.0);
        s.record_ok(20.0);
        s.record_error();
        assert_eq!(s.avg_latency_ms(), 15.0);
        assert_eq!(s.error_count, 1);
    }

    #[test]
    fn totals_sum_across_shards() {
        let agg = MetricsAggregator::<TestCounters>::new();
        agg.update(0, |c| c.op.record_ok(4.0));
        agg.update(1, |c| c.op.record_ok(8.0));
        agg.update(1, |c| c.dropped += 2);

        let snap = agg.drain();
        let total = snap.totals();
        assert_eq!(total.op.count, 2);
        assert_eq!(total.op.avg_latency_ms(), 6.0);
        assert_eq!(total.dropped, 2);
        assert_eq!(snap.shard(1).unwrap().op.count, 1);
    }

    #[test]
    fn drain_resets_to_empty() {
        let agg = MetricsAggregator::<TestCounters>::new();
        agg.update(3, |c| c.dropped += 1);
        assert!(!agg.drain().is_empty());

        let second = agg.drain();
        assert!(second.is_empty());
        assert_eq!(second.totals().dropped, 0);
    }

    #[test]
    fn peek_does_not_reset() {
        let agg = MetricsAggregator::<TestCounters>::new();
        agg.update(0, |c| c.dropped += 5);
        assert_eq!(agg.peek().totals().dropped, 5);
        assert_eq!(agg.drain().totals().dropped, 5);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let agg = Arc::new(MetricsAggregator::<TestCounters>::new());
        let handles: Vec<_> = (0..8)
            .map(|shard| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        agg.update(shard % 2, |c| c.op.record_ok(1.0));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.drain().totals().op.count, 8000);
    }
}
