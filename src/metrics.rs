use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Operational counters for a shard manager
#[derive(Debug)]
pub struct MetricsCollector {
    // Operation counts
    /// Number of inserts, updates and deletes
    write_count: AtomicUsize,
    /// Number of read queries
    read_count: AtomicUsize,
    /// Number of reads that spanned more than one shard
    fanout_count: AtomicUsize,
    /// Number of shards skipped during fan-out
    partial_failures: AtomicUsize,
    /// Number of writes refused by the write-safety guard
    write_safety_violations: AtomicUsize,

    // Rotation metrics
    /// Number of rotation checks
    rotation_checks: AtomicUsize,
    /// Number of completed rotations
    rotation_count: AtomicUsize,
    /// Number of failed rotations
    rotation_failures: AtomicUsize,
    /// Last rotation duration
    last_rotation_duration: Mutex<Duration>,

    // Timing metrics
    /// Total write duration in nanoseconds
    write_duration_ns: AtomicU64,
    /// Total query duration in nanoseconds
    query_duration_ns: AtomicU64,

    // Internal state
    /// Start time of the metrics collector
    start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub writes: usize,
    pub reads: usize,
    pub fanout_reads: usize,
    pub partial_failures: usize,
    pub write_safety_violations: usize,
    pub rotation_checks: usize,
    pub rotations: usize,
    pub rotation_failures: usize,
    pub last_rotation_ms: u64,
    pub uptime_secs: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            write_count: AtomicUsize::new(0),
            read_count: AtomicUsize::new(0),
            fanout_count: AtomicUsize::new(0),
            partial_failures: AtomicUsize::new(0),
            write_safety_violations: AtomicUsize::new(0),

            rotation_checks: AtomicUsize::new(0),
            rotation_count: AtomicUsize::new(0),
            rotation_failures: AtomicUsize::new(0),
            last_rotation_duration: Mutex::new(Duration::from_secs(0)),

            write_duration_ns: AtomicU64::new(0),
            query_duration_ns: AtomicU64::new(0),

            start_time: Instant::now(),
        }
    }

    /// Record a sharded write and its duration
    pub fn record_write(&self, duration: Duration) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a read query over `shards` shards
    pub fn record_query(&self, shards: usize, duration: Duration) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        if shards > 1 {
            self.fanout_count.fetch_add(1, Ordering::Relaxed);
        }
        self.query_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a shard skipped during fan-out
    pub fn record_partial_failure(&self) {
        self.partial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused write
    pub fn record_write_safety_violation(&self) {
        self.write_safety_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rotation check
    pub fn record_rotation_check(&self) {
        self.rotation_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed rotation
    pub fn record_rotation(&self, duration: Duration) {
        self.rotation_count.fetch_add(1, Ordering::Relaxed);
        *self.last_rotation_duration.lock() = duration;
    }

    /// Record a failed rotation
    pub fn record_rotation_failure(&self) {
        self.rotation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get write count
    pub fn get_write_count(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Get read count
    pub fn get_read_count(&self) -> usize {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Get partial failure count
    pub fn get_partial_failures(&self) -> usize {
        self.partial_failures.load(Ordering::Relaxed)
    }

    /// Get write-safety violation count
    pub fn get_write_safety_violations(&self) -> usize {
        self.write_safety_violations.load(Ordering::Relaxed)
    }

    /// Get rotation count
    pub fn get_rotation_count(&self) -> usize {
        self.rotation_count.load(Ordering::Relaxed)
    }

    /// Get rotation check count
    pub fn get_rotation_checks(&self) -> usize {
        self.rotation_checks.load(Ordering::Relaxed)
    }

    /// Get the last rotation duration
    pub fn get_last_rotation_duration(&self) -> Duration {
        *self.last_rotation_duration.lock()
    }

    /// Get total write duration
    pub fn get_write_duration(&self) -> Duration {
        Duration::from_nanos(self.write_duration_ns.load(Ordering::Relaxed))
    }

    /// Get total query duration
    pub fn get_query_duration(&self) -> Duration {
        Duration::from_nanos(self.query_duration_ns.load(Ordering::Relaxed))
    }

    /// Get uptime of the metrics collector
    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes: self.get_write_count(),
            reads: self.get_read_count(),
            fanout_reads: self.fanout_count.load(Ordering::Relaxed),
            partial_failures: self.get_partial_failures(),
            write_safety_violations: self.get_write_safety_violations(),
            rotation_checks: self.get_rotation_checks(),
            rotations: self.get_rotation_count(),
            rotation_failures: self.rotation_failures.load(Ordering::Relaxed),
            last_rotation_ms: self.get_last_rotation_duration().as_millis() as u64,
            uptime_secs: self.get_uptime().as_secs(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.write_count.store(0, Ordering::Relaxed);
        self.read_count.store(0, Ordering::Relaxed);
        self.fanout_count.store(0, Ordering::Relaxed);
        self.partial_failures.store(0, Ordering::Relaxed);
        self.write_safety_violations.store(0, Ordering::Relaxed);
        self.rotation_checks.store(0, Ordering::Relaxed);
        self.rotation_count.store(0, Ordering::Relaxed);
        self.rotation_failures.store(0, Ordering::Relaxed);
        *self.last_rotation_duration.lock() = Duration::from_secs(0);
        self.write_duration_ns.store(0, Ordering::Relaxed);
        self.query_duration_ns.store(0, Ordering::Relaxed);
    }

    /// Get a report of all metrics
    pub fn get_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Shard Manager Metrics ===\n\n");
        report.push_str(&format!("Uptime: {:?}\n\n", self.get_uptime()));

        report.push_str("Operation Counts:\n");
        report.push_str(&format!("  Writes: {}\n", self.get_write_count()));
        report.push_str(&format!("  Reads: {}\n", self.get_read_count()));
        report.push_str(&format!("  Fan-out Reads: {}\n", self.fanout_count.load(Ordering::Relaxed)));
        report.push_str(&format!("  Partial Failures: {}\n", self.get_partial_failures()));
        report.push_str(&format!("  Write Safety Violations: {}\n\n", self.get_write_safety_violations()));

        report.push_str("Rotation:\n");
        report.push_str(&format!("  Checks: {}\n", self.get_rotation_checks()));
        report.push_str(&format!("  Rotations: {}\n", self.get_rotation_count()));
        report.push_str(&format!("  Failures: {}\n", self.rotation_failures.load(Ordering::Relaxed)));
        report.push_str(&format!("  Last Rotation Time: {:?}\n\n", self.get_last_rotation_duration()));

        report.push_str("Performance Metrics:\n");
        if self.get_write_count() > 0 {
            let avg_write = self.get_write_duration().as_micros() / self.get_write_count() as u128;
            report.push_str(&format!("  Avg. Write Time: {}µs\n", avg_write));
        }
        if self.get_read_count() > 0 {
            let avg_query = self.get_query_duration().as_micros() / self.get_read_count() as u128;
            report.push_str(&format!("  Avg. Query Time: {}µs\n", avg_query));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_metrics_recording() {
        let metrics = MetricsCollector::new();

        metrics.record_write(Duration::from_micros(10));
        metrics.record_query(1, Duration::from_micros(5));
        metrics.record_query(3, Duration::from_micros(5));
        metrics.record_partial_failure();
        metrics.record_rotation(Duration::from_millis(42));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 1);
        assert_eq!(snapshot.reads, 2);
        assert_eq!(snapshot.fanout_reads, 1);
        assert_eq!(snapshot.partial_failures, 1);
        assert_eq!(snapshot.rotations, 1);
        assert_eq!(snapshot.last_rotation_ms, 42);
        assert!(metrics.get_report().contains("Rotations: 1"));

        metrics.reset();
        assert_eq!(metrics.snapshot().writes, 0);
        assert_eq!(metrics.get_last_rotation_duration(), Duration::from_secs(0));
    }

    #[test]
    fn test_metrics_thread_safety() {
        let metrics = Arc::new(MetricsCollector::new());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let metrics_clone = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    metrics_clone.record_write(Duration::from_nanos(1));
                    metrics_clone.record_rotation_check();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.get_write_count(), 1000);
        assert_eq!(metrics.get_rotation_checks(), 1000);
        assert_eq!(metrics.get_write_duration(), Duration::from_nanos(1000));
    }
}
