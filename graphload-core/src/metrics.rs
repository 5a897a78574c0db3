//! Prometheus metrics for monitoring
//!
//! Lock-free counters, gauges and histograms. Each loader keeps its own
//! `LoaderStats`; process-wide totals live in `standard`.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Raise to `val` if it is higher than the current value
    pub fn set_max(&self, val: i64) {
        self.value.fetch_max(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    /// Sum in microseconds
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default latency buckets (seconds)
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0],
        )
    }

    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observation in seconds, 0 when empty
    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0 / n as f64,
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Counters of one loader, shared with its producer tasks
pub struct LoaderStats {
    pub batches_produced: Counter,
    pub batches_failed: Counter,
    pub producers_spawned: Counter,
    pub passes_started: Counter,
    pub queue_high_water: Gauge,
    pub fetch_duration: Histogram,
}

impl LoaderStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batches_produced: Counter::new("loader_batches_produced", "Batches delivered"),
            batches_failed: Counter::new("loader_batches_failed", "Partitions that failed"),
            producers_spawned: Counter::new("loader_producers_spawned", "Background producers"),
            passes_started: Counter::new("loader_passes_started", "Production passes"),
            queue_high_water: Gauge::new("loader_queue_high_water", "Deepest queue observed"),
            fetch_duration: Histogram::new("loader_fetch_duration_seconds", "Partition fetch latency"),
        })
    }

    /// Record one delivered batch, also in the process-wide totals
    pub fn record_batch(&self) {
        self.batches_produced.inc();
        standard::BATCHES_PRODUCED.inc();
    }

    pub fn record_failure(&self) {
        self.batches_failed.inc();
        standard::BATCHES_FAILED.inc();
    }

    pub fn record_fetch(&self, start: Instant) {
        self.fetch_duration.observe_since(start);
        standard::FETCH_DURATION.observe_since(start);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_produced: self.batches_produced.get(),
            batches_failed: self.batches_failed.get(),
            producers_spawned: self.producers_spawned.get(),
            passes_started: self.passes_started.get(),
            queue_high_water: self.queue_high_water.get().max(0) as usize,
            fetches: self.fetch_duration.count(),
            mean_fetch_secs: self.fetch_duration.mean(),
        }
    }
}

/// Point-in-time copy of `LoaderStats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub batches_produced: u64,
    pub batches_failed: u64,
    pub producers_spawned: u64,
    pub passes_started: u64,
    pub queue_high_water: usize,
    pub fetches: u64,
    pub mean_fetch_secs: f64,
}

/// Process-wide loader metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static BATCHES_PRODUCED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("graphload_batches_produced_total", "Total batches delivered")
    });

    pub static BATCHES_FAILED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("graphload_batches_failed_total", "Total partitions that failed")
    });

    pub static PRODUCERS_SPAWNED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("graphload_producers_spawned_total", "Total background producers started")
    });

    pub static ACTIVE_PRODUCERS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("graphload_active_producers", "Producers currently running")
    });

    pub static QUERIES_INSTALLED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("graphload_queries_installed_total", "Partitioning queries installed")
    });

    pub static FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("graphload_fetch_duration_seconds", "Partition fetch latency")
    });
}

/// Export all process-wide loader metrics
pub fn gather_loader_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::BATCHES_PRODUCED.to_prometheus());
    output.push_str(&standard::BATCHES_FAILED.to_prometheus());
    output.push_str(&standard::PRODUCERS_SPAWNED.to_prometheus());
    output.push_str(&standard::QUERIES_INSTALLED.to_prometheus());

    output.push_str(&standard::ACTIVE_PRODUCERS.to_prometheus());

    output.push_str(&standard::FETCH_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert!(counter.to_prometheus().contains("test_counter 6"));
    }

    #[test]
    fn test_gauge_high_water() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set_max(3);
        gauge.set_max(2);
        assert_eq!(gauge.get(), 3);
        gauge.dec();
        assert_eq!(gauge.get(), 2);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");
        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(0.1);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
        assert!((histogram.mean() - 0.037).abs() < 1e-6);
    }

    #[test]
    fn test_loader_stats_snapshot() {
        let stats = LoaderStats::new();
        stats.record_batch();
        stats.record_batch();
        stats.record_failure();
        stats.queue_high_water.set_max(4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_produced, 2);
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.queue_high_water, 4);
        assert!(gather_loader_metrics().contains("graphload_batches_produced_total"));
    }
}
