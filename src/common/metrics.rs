//! Replication metrics
//!
//! Prometheus-compatible counters, gauges and histograms for the binlog,
//! followers and bootstrap copies, plus per-source follow metrics.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for batch apply latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Sum kept in thousandths to stay integral
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for one follow relationship, keyed by `"<follower> <- <source>"`
#[derive(Debug, Default)]
pub struct FollowMetrics {
    pub batches: Counter,
    pub entries_applied: Counter,
    pub entries_ignored: Counter,
    pub apply_latency: Histogram,
    pub segment: Gauge,
    pub offset: Gauge,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    follows: Mutex<HashMap<String, Arc<FollowMetrics>>>,

    // binlog
    pub entries_appended: Counter,
    pub bytes_appended: Counter,
    pub segments_rolled: Counter,
    pub segments_purged: Counter,
    pub corrupt_entries_skipped: Counter,

    // followers
    pub entries_applied: Counter,
    pub entries_ignored: Counter,
    pub entries_merged: Counter,
    pub out_of_sync_restarts: Counter,
    pub active_followers: Gauge,

    // bootstrap
    pub bootstraps_completed: Counter,
    pub bootstrap_rows_copied: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            follows: Mutex::new(HashMap::new()),
            entries_appended: Counter::new(),
            bytes_appended: Counter::new(),
            segments_rolled: Counter::new(),
            segments_purged: Counter::new(),
            corrupt_entries_skipped: Counter::new(),
            entries_applied: Counter::new(),
            entries_ignored: Counter::new(),
            entries_merged: Counter::new(),
            out_of_sync_restarts: Counter::new(),
            active_followers: Gauge::new(),
            bootstraps_completed: Counter::new(),
            bootstrap_rows_copied: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a follow relationship
    pub fn follow(&self, name: &str) -> Arc<FollowMetrics> {
        self.follows
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drop a follow relationship once it is torn down for good
    pub fn remove_follow(&self, name: &str) {
        self.follows.lock().remove(name);
    }

    /// Record one applied tail batch
    pub fn record_follow_batch(
        &self,
        name: &str,
        applied: u64,
        ignored: u64,
        duration: Duration,
        segment: u32,
        offset: u64,
    ) {
        let follow = self.follow(name);
        follow.batches.inc();
        follow.entries_applied.add(applied);
        follow.entries_ignored.add(ignored);
        follow.apply_latency.observe(duration.as_secs_f64() * 1000.0);
        follow.segment.set(segment as u64);
        follow.offset.set(offset);

        self.entries_applied.add(applied);
        self.entries_ignored.add(ignored);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, u64); 12] = [
            ("ringkv_binlog_entries_appended_total", "Entries appended to local binlogs", self.entries_appended.get()),
            ("ringkv_binlog_bytes_appended_total", "Bytes appended to local binlogs", self.bytes_appended.get()),
            ("ringkv_binlog_segments_rolled_total", "Binlog segment rollovers", self.segments_rolled.get()),
            ("ringkv_binlog_segments_purged_total", "Binlog segments purged", self.segments_purged.get()),
            ("ringkv_binlog_corrupt_entries_total", "Corrupt binlog entries skipped", self.corrupt_entries_skipped.get()),
            ("ringkv_follow_entries_applied_total", "Replicated entries applied", self.entries_applied.get()),
            ("ringkv_follow_entries_ignored_total", "Replicated entries older than local data", self.entries_ignored.get()),
            ("ringkv_follow_entries_merged_total", "Replicated merge entries applied", self.entries_merged.get()),
            ("ringkv_follow_out_of_sync_total", "Follows restarted from a bootstrap copy", self.out_of_sync_restarts.get()),
            ("ringkv_bootstraps_total", "Completed bootstrap copies", self.bootstraps_completed.get()),
            ("ringkv_bootstrap_rows_total", "Rows written by bootstrap copies", self.bootstrap_rows_copied.get()),
            ("ringkv_uptime_seconds", "Process uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in counters {
            let kind = if name == "ringkv_uptime_seconds" { "gauge" } else { "counter" };
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out.push_str("# HELP ringkv_active_followers Running follow tasks\n");
        out.push_str("# TYPE ringkv_active_followers gauge\n");
        let _ = writeln!(out, "ringkv_active_followers {}", self.active_followers.get());

        let follows = self.follows.lock();

        out.push_str("# HELP ringkv_follow_source_applied_total Entries applied per follow source\n");
        out.push_str("# TYPE ringkv_follow_source_applied_total counter\n");
        for (name, m) in follows.iter() {
            let _ = writeln!(
                out,
                "ringkv_follow_source_applied_total{{follow=\"{}\"}} {}",
                name,
                m.entries_applied.get()
            );
        }

        out.push_str("# HELP ringkv_follow_source_position Last applied binlog position per follow source\n");
        out.push_str("# TYPE ringkv_follow_source_position gauge\n");
        for (name, m) in follows.iter() {
            let _ = writeln!(
                out,
                "ringkv_follow_source_position{{follow=\"{}\",part=\"segment\"}} {}",
                name,
                m.segment.get()
            );
            let _ = writeln!(
                out,
                "ringkv_follow_source_position{{follow=\"{}\",part=\"offset\"}} {}",
                name,
                m.offset.get()
            );
        }

        out.push_str("# HELP ringkv_follow_apply_duration_ms Tail batch apply duration in milliseconds\n");
        out.push_str("# TYPE ringkv_follow_apply_duration_ms histogram\n");
        for (name, m) in follows.iter() {
            for (le, count) in m.apply_latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "ringkv_follow_apply_duration_ms_bucket{{follow=\"{}\",le=\"{}\"}} {}",
                    name, le, count
                );
            }
            let _ = writeln!(
                out,
                "ringkv_follow_apply_duration_ms_sum{{follow=\"{}\"}} {}",
                name,
                m.apply_latency.sum()
            );
            let _ = writeln!(
                out,
                "ringkv_follow_apply_duration_ms_count{{follow=\"{}\"}} {}",
                name,
                m.apply_latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.first(), Some(&(1.0, 0)));
        assert_eq!(buckets.last(), Some(&(f64::INFINITY, 3)));
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_follow_batches() {
        let registry = MetricsRegistry::new();
        registry.record_follow_batch("users.1.1 <- 2.1", 10, 2, Duration::from_millis(3), 4, 512);
        registry.record_follow_batch("users.1.1 <- 2.1", 5, 0, Duration::from_millis(7), 5, 64);

        assert_eq!(registry.entries_applied.get(), 15);
        assert_eq!(registry.entries_ignored.get(), 2);

        let follow = registry.follow("users.1.1 <- 2.1");
        assert_eq!(follow.batches.get(), 2);
        assert_eq!(follow.segment.get(), 5);

        let text = registry.to_prometheus();
        assert!(text.contains("ringkv_follow_entries_applied_total 15"));
        assert!(text.contains("ringkv_follow_source_applied_total{follow=\"users.1.1 <- 2.1\"} 15"));

        registry.remove_follow("users.1.1 <- 2.1");
        assert!(!registry.to_prometheus().contains("users.1.1"));
    }
}
