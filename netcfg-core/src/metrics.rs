//! In-process metrics for allocators and the mutation pipeline
//!
//! Each control-plane instance owns one [`MetricsRegistry`]; clones share
//! the same underlying maps. Latencies go into fixed buckets so a long
//! running instance holds constant memory per metric.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bounds of the latency buckets in milliseconds; one more bucket
/// catches everything slower
const LATENCY_BOUNDS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 1000, 5000];

/// Bucketed latency distribution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyHistogram {
    buckets: [u64; LATENCY_BOUNDS_MS.len() + 1],
    count: u64,
    sum: Duration,
    max: Duration,
}

impl LatencyHistogram {
    fn observe(&mut self, duration: Duration) {
        let ms = duration.as_millis();
        let bucket = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| ms <= u128::from(*bound))
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.buckets[bucket] += 1;
        self.count += 1;
        self.sum += duration;
        self.max = self.max.max(duration);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.sum / count,
            Err(_) => Duration::from_secs_f64(self.sum.as_secs_f64() / self.count as f64),
        }
    }

    /// Upper bound of the bucket holding quantile `q` (0.0..=1.0)
    ///
    /// Observations past the last bound report the largest one seen.
    pub fn quantile_bound(&self, q: f64) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let rank = ((self.count as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                return Some(match LATENCY_BOUNDS_MS.get(i) {
                    Some(bound) => Duration::from_millis(*bound).min(self.max),
                    None => self.max,
                });
            }
        }
        Some(self.max)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    latencies: Arc<RwLock<HashMap<String, LatencyHistogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str) {
        self.increment_counter_by(name, 1);
    }

    pub fn increment_counter_by(&self, name: &str, value: u64) {
        let mut counters = self.counters.write();
        match counters.get_mut(name) {
            Some(counter) => *counter += value,
            None => {
                counters.insert(name.to_string(), value);
            }
        }
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        let mut latencies = self.latencies.write();
        match latencies.get_mut(name) {
            Some(histogram) => histogram.observe(duration),
            None => {
                let mut histogram = LatencyHistogram::default();
                histogram.observe(duration);
                latencies.insert(name.to_string(), histogram);
            }
        }
    }

    pub fn latency(&self, name: &str) -> Option<LatencyHistogram> {
        self.latencies.read().get(name).cloned()
    }

    /// Start a timer that records into `name` when dropped
    pub fn timer(&self, name: &str) -> Timer {
        Timer {
            name: name.to_string(),
            start: Instant::now(),
            registry: self.clone(),
        }
    }
}

/// Records the elapsed time when dropped
pub struct Timer {
    name: String,
    start: Instant,
    registry: MetricsRegistry,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.registry
            .record_duration(&self.name, self.start.elapsed());
    }
}

/// Metric names used throughout the control plane
pub mod names {
    // Allocator metrics
    pub const ALLOC_TOTAL: &str = "allocator.alloc.total";
    pub const ALLOC_CONFLICT_RETRIES: &str = "allocator.alloc.conflict_retries";
    pub const ALLOC_EXHAUSTED: &str = "allocator.alloc.exhausted";
    pub const ALLOC_RESERVED: &str = "allocator.reserve.total";
    pub const ALLOC_FREED: &str = "allocator.free.total";
    pub const ALLOC_FREE_SKIPPED: &str = "allocator.free.owner_mismatch";

    // Pipeline metrics
    pub const PIPELINE_CREATE_DURATION: &str = "pipeline.create.duration";
    pub const PIPELINE_UPDATE_DURATION: &str = "pipeline.update.duration";
    pub const PIPELINE_DELETE_DURATION: &str = "pipeline.delete.duration";
    pub const PIPELINE_FAILED: &str = "pipeline.failed.total";
    pub const PIPELINE_COMMIT_FAILED: &str = "pipeline.commit.failed";
    pub const PIPELINE_NAME_RETRIES: &str = "pipeline.name_collision.retries";
    pub const PIPELINE_POST_COMMIT_WARNINGS: &str = "pipeline.post_commit.warnings";
    pub const UNDO_EXECUTED: &str = "pipeline.undo.executed";
    pub const UNDO_FAILED: &str = "pipeline.undo.failed";

    // Coordination metrics
    pub const COORDINATION_RECONNECTS: &str = "coordination.reconnects.total";

    // Replica notification metrics
    pub const NOTIFICATIONS_APPLIED: &str = "notifications.applied.total";
    pub const NOTIFICATIONS_LAGGED: &str = "notifications.lagged.total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_metrics() {
        let registry = MetricsRegistry::new();
        registry.increment_counter(names::ALLOC_TOTAL);
        registry.increment_counter_by(names::ALLOC_TOTAL, 4);
        assert_eq!(registry.get_counter(names::ALLOC_TOTAL), 5);
        assert_eq!(registry.get_counter(names::UNDO_FAILED), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = MetricsRegistry::new();
        let clone = registry.clone();
        clone.increment_counter(names::UNDO_EXECUTED);
        assert_eq!(registry.get_counter(names::UNDO_EXECUTED), 1);
    }

    #[test]
    fn test_latency_buckets() {
        let registry = MetricsRegistry::new();
        for ms in [1, 3, 4, 20, 7000] {
            registry.record_duration("op", Duration::from_millis(ms));
        }
        let latency = registry.latency("op").unwrap();
        assert_eq!(latency.count(), 5);
        assert_eq!(latency.max(), Duration::from_millis(7000));
        assert_eq!(latency.mean(), Duration::from_micros(1_405_600));
        assert_eq!(latency.quantile_bound(0.0), Some(Duration::from_millis(1)));
        assert_eq!(latency.quantile_bound(0.5), Some(Duration::from_millis(5)));
        assert_eq!(latency.quantile_bound(0.8), Some(Duration::from_millis(25)));
        assert_eq!(latency.quantile_bound(1.0), Some(Duration::from_millis(7000)));
        assert!(registry.latency("other").is_none());
    }

    #[test]
    fn test_memory_does_not_grow_with_observations() {
        let registry = MetricsRegistry::new();
        for _ in 0..10_000 {
            registry.record_duration("op", Duration::from_micros(300));
        }
        let latency = registry.latency("op").unwrap();
        assert_eq!(latency.count(), 10_000);
        assert_eq!(latency.buckets.iter().sum::<u64>(), 10_000);
        assert_eq!(latency.buckets[0], 10_000);
        // the bound never exceeds what was observed
        assert_eq!(latency.quantile_bound(0.99), Some(Duration::from_micros(300)));
    }

    #[test]
    fn test_timer_records_on_drop() {
        let registry = MetricsRegistry::new();
        for _ in 0..2 {
            let _timer = registry.timer(names::PIPELINE_CREATE_DURATION);
        }
        let latency = registry.latency(names::PIPELINE_CREATE_DURATION).unwrap();
        assert_eq!(latency.count(), 2);
    }
}
