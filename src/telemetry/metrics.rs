// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for performance monitoring.
//!
//! Lightweight in-process counters for worker calls, restarts, event bus
//! pressure and session outcomes. No exporter; `foreman run --metrics` prints
//! a report at exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Call metrics by worker role.
    workers: RwLock<HashMap<String, WorkerMetrics>>,

    /// General operation metrics.
    operations: RwLock<HashMap<String, OperationMetrics>>,

    /// Event bus counters.
    events: EventCounters,

    /// Tool-server respawns across all sessions.
    respawns: AtomicU64,

    /// Start time for calculating uptime.
    start_time: Instant,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            events: EventCounters::default(),
            respawns: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished worker call. `failure` is the wire code of a failed call.
    pub fn record_call(&self, agent: &str, duration: Duration, failure: Option<&str>) {
        let mut workers = write(&self.workers);
        let metrics = workers.entry(agent.to_string()).or_default();
        metrics.record(duration, failure);
    }

    /// Record a generic operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = write(&self.operations);
        let metrics = ops.entry(name.to_string()).or_default();
        metrics.record(duration);
    }

    /// Record a tool-server respawn.
    pub fn record_respawn(&self) {
        self.respawns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event accepted by a bus.
    pub fn record_event_published(&self) {
        self.events.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped by a full bus.
    pub fn record_event_dropped(&self) {
        self.events.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get metrics for a specific worker role.
    pub fn worker_metrics(&self, agent: &str) -> Option<WorkerMetrics> {
        read(&self.workers).get(agent).cloned()
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        read(&self.operations).get(name).cloned()
    }

    /// Total respawns.
    pub fn respawn_count(&self) -> u64 {
        self.respawns.load(Ordering::Relaxed)
    }

    /// (published, dropped) event counts.
    pub fn event_counts(&self) -> (u64, u64) {
        (
            self.events.published.load(Ordering::Relaxed),
            self.events.dropped.load(Ordering::Relaxed),
        )
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (events_published, events_dropped) = self.event_counts();
        MetricsSnapshot {
            workers: read(&self.workers).clone(),
            operations: read(&self.operations).clone(),
            respawns: self.respawn_count(),
            events_published,
            events_dropped,
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        write(&self.workers).clear();
        write(&self.operations).clear();
        self.respawns.store(0, Ordering::Relaxed);
        self.events.published.store(0, Ordering::Relaxed);
        self.events.dropped.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Call metrics for one worker role.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Total number of calls.
    pub calls: u64,

    /// Calls that returned a worker output.
    pub successes: u64,

    /// Failed calls by failure code.
    pub failures: HashMap<String, u64>,

    /// Total time spent in calls.
    pub total_duration: Duration,

    /// Minimum call time.
    pub min_duration: Duration,

    /// Maximum call time.
    pub max_duration: Duration,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            calls: 0,
            successes: 0,
            failures: HashMap::new(),
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
        }
    }

    /// Record a call.
    pub fn record(&mut self, duration: Duration, failure: Option<&str>) {
        self.calls += 1;
        match failure {
            None => self.successes += 1,
            Some(code) => *self.failures.entry(code.to_string()).or_insert(0) += 1,
        }
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
    }

    /// Total failed calls.
    pub fn failure_count(&self) -> u64 {
        self.failures.values().sum()
    }

    /// Calculate average call time.
    pub fn avg_duration(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.calls as u32
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Histogram buckets for latency distribution.
    pub histogram: Histogram,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket histogram for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in milliseconds.
    buckets: Vec<u64>,

    /// Count per bucket, plus one overflow bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in milliseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let idx = self
            .buckets
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Approximate percentile: the upper bound of the bucket holding it.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let millis = match self.buckets.get(i) {
                    Some(bound) => *bound,
                    None => self.buckets.last().copied().unwrap_or(0) * 10,
                };
                return Duration::from_millis(millis);
            }
        }

        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Worker calls run from milliseconds to many minutes.
        Self::with_buckets(vec![10, 100, 1_000, 10_000, 60_000, 300_000])
    }
}

#[derive(Debug, Default)]
struct EventCounters {
    published: AtomicU64,
    dropped: AtomicU64,
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub workers: HashMap<String, WorkerMetrics>,
    pub operations: HashMap<String, OperationMetrics>,
    pub respawns: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Metrics Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Events: {} published, {} dropped\n",
            self.events_published, self.events_dropped
        ));
        report.push_str(&format!("Respawns: {}\n\n", self.respawns));

        if !self.workers.is_empty() {
            report.push_str("Worker Calls:\n");
            let mut names: Vec<_> = self.workers.keys().collect();
            names.sort();
            for name in names {
                let metrics = &self.workers[name];
                report.push_str(&format!(
                    "  {}: {} calls, {:.1}% success, avg {:.2?}\n",
                    name,
                    metrics.calls,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration()
                ));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            report.push_str("Operations:\n");
            for (name, metrics) in &self.operations {
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_metrics() {
        let mut metrics = WorkerMetrics::new();
        metrics.record(Duration::from_millis(100), None);
        metrics.record(Duration::from_millis(200), None);
        metrics.record(Duration::from_millis(50), Some("timeout"));

        assert_eq!(metrics.calls, 3);
        assert_eq!(metrics.successes, 2);
        assert_eq!(metrics.failure_count(), 1);
        assert_eq!(metrics.failures["timeout"], 1);
        assert!((metrics.success_rate() - 0.666).abs() < 0.01);
        assert_eq!(metrics.min_duration, Duration::from_millis(50));
    }

    #[test]
    fn test_operation_metrics() {
        let mut metrics = OperationMetrics::new();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(20));
        metrics.record(Duration::from_millis(30));

        assert_eq!(metrics.count, 3);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_millis(500));
        }
        assert_eq!(hist.counts()[2], 100);
        assert_eq!(hist.p50(), Duration::from_millis(1_000));
        assert_eq!(hist.p99(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_counters_and_reset() {
        let metrics = Metrics::new();
        metrics.record_call("code", Duration::from_millis(5), Some("process_crashed"));
        metrics.record_respawn();
        metrics.record_event_published();
        metrics.record_event_dropped();

        let snapshot = metrics.snapshot();
        assert!(snapshot.workers.contains_key("code"));
        assert_eq!(snapshot.respawns, 1);
        assert_eq!(snapshot.events_dropped, 1);
        assert!(snapshot.format_report().contains("code: 1 calls"));

        metrics.reset();
        assert!(metrics.worker_metrics("code").is_none());
        assert_eq!(metrics.event_counts(), (0, 0));
    }
}
