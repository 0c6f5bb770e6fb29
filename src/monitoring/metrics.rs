//! Prometheus-style runtime metrics.
//!
//! Provides counters, gauges and histograms, and the fixed metric set the
//! supervisor updates.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A counter metric (monotonically increasing).
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by amount.
    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gauge value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A histogram metric for measuring distributions.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with latency buckets in seconds.
    pub fn new() -> Self {
        Self::with_buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    }

    /// Create with custom buckets.
    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            bucket_counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value in seconds.
    pub fn observe(&self, seconds: f64) {
        for (i, bucket) in self.buckets.iter().enumerate() {
            if seconds <= *bucket {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        let micros = (seconds.max(0.0) * 1_000_000.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get observation count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get sum of observations.
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Get mean value.
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }

    /// Cumulative counts per upper bound.
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .zip(&self.bucket_counts)
            .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RuntimeMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub attach_succeeded: u64,
    pub attach_failed: u64,
    pub plugin_errors: u64,
    pub stop_requests: u64,
    pub stop_timeouts: u64,
    pub detached: u64,
    pub reclaimed_in_time: u64,
    pub reclaimed_late: u64,
    pub attached: i64,
    pub pending_reclamation: i64,
    pub stop_seconds_count: u64,
    pub stop_seconds_sum: f64,
}

/// Metrics maintained by the host supervisor.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub attach_succeeded: Counter,
    pub attach_failed: Counter,
    pub plugin_errors: Counter,
    pub stop_requests: Counter,
    pub stop_timeouts: Counter,
    pub detached: Counter,
    pub reclaimed_in_time: Counter,
    pub reclaimed_late: Counter,
    /// Currently attached plugins
    pub attached: Gauge,
    /// Detached plugins whose unit is still resident
    pub pending_reclamation: Gauge,
    /// Time from stop request to `Stopped`
    pub stop_seconds: Histogram,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attach_succeeded: self.attach_succeeded.get(),
            attach_failed: self.attach_failed.get(),
            plugin_errors: self.plugin_errors.get(),
            stop_requests: self.stop_requests.get(),
            stop_timeouts: self.stop_timeouts.get(),
            detached: self.detached.get(),
            reclaimed_in_time: self.reclaimed_in_time.get(),
            reclaimed_late: self.reclaimed_late.get(),
            attached: self.attached.get(),
            pending_reclamation: self.pending_reclamation.get(),
            stop_seconds_count: self.stop_seconds.count(),
            stop_seconds_sum: self.stop_seconds.sum(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            ("plughost_attach_succeeded_total", "Successful attaches", &self.attach_succeeded),
            ("plughost_attach_failed_total", "Failed attaches", &self.attach_failed),
            ("plughost_plugin_errors_total", "Plugins entering the errored condition", &self.plugin_errors),
            ("plughost_stop_requests_total", "Plugin stop requests", &self.stop_requests),
            ("plughost_stop_timeouts_total", "Plugins not stopped within the timeout", &self.stop_timeouts),
            ("plughost_detached_total", "Detached plugins", &self.detached),
            ("plughost_reclaimed_in_time_total", "Units reclaimed within the grace window", &self.reclaimed_in_time),
            ("plughost_reclaimed_late_total", "Units reclaimed after the grace window", &self.reclaimed_late),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, counter.get()));
        }

        let gauges = [
            ("plughost_attached", "Currently attached plugins", &self.attached),
            ("plughost_pending_reclamation", "Detached units still resident", &self.pending_reclamation),
        ];
        for (name, help, gauge) in gauges {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{} {}\n", name, gauge.get()));
        }

        let name = "plughost_stop_seconds";
        output.push_str(&format!("# HELP {} Time from stop request to stopped\n", name));
        output.push_str(&format!("# TYPE {} histogram\n", name));
        for (bound, count) in self.stop_seconds.buckets() {
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, bound, count));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, self.stop_seconds.count()));
        output.push_str(&format!("{}_sum {}\n", name, self.stop_seconds.sum()));
        output.push_str(&format!("{}_count {}\n", name, self.stop_seconds.count()));
        output
    }
}
