// Lifecycle metrics
//
// Counters for every lifecycle transition and its failure modes, a gauge of
// running bots, and latency histograms for launches and installs. Exported in
// Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::BotError;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down, never below zero)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    pub fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|&le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for process launches (seconds)
    pub fn new_launch() -> Self {
        Self::with_bounds(&[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    }

    /// Buckets sized for package installs (seconds)
    pub fn new_install() -> Self {
        Self::with_bounds(&[1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0])
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum.fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, name: &str, help: &str, output: &mut String) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} histogram\n", name));
        for bucket in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, self.get_count()));
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count {}\n", name, self.get_count()));
    }
}

/// Error kinds tracked per failed operation
const ERROR_KINDS: [&str; 14] = [
    "not_found",
    "unauthorized",
    "invalid_state",
    "validation_failed",
    "install_failed",
    "launch_failed",
    "timeout",
    "infrastructure_unavailable",
    "unsupported_upload",
    "workspace",
    "config",
    "store",
    "io",
    "lock",
];

#[derive(Debug)]
pub struct MetricsRegistry {
    pub uploads: Counter,
    pub validation_failures: Counter,
    pub starts: Counter,
    pub start_failures: Counter,
    pub stops: Counter,
    pub restarts: Counter,
    pub deletes: Counter,
    pub installs: Counter,
    pub install_failures: Counter,
    /// Running records found without a live context
    pub crash_reconciliations: Counter,

    pub running_bots: Gauge,

    pub launch_latency: Histogram,
    pub install_duration: Histogram,

    errors: [Counter; ERROR_KINDS.len()],
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            uploads: Counter::new(),
            validation_failures: Counter::new(),
            starts: Counter::new(),
            start_failures: Counter::new(),
            stops: Counter::new(),
            restarts: Counter::new(),
            deletes: Counter::new(),
            installs: Counter::new(),
            install_failures: Counter::new(),
            crash_reconciliations: Counter::new(),
            running_bots: Gauge::new(),
            launch_latency: Histogram::new_launch(),
            install_duration: Histogram::new_install(),
            errors: Default::default(),
        }
    }

    /// Count a failed operation by error kind.
    pub fn record_error(&self, error: &BotError) {
        if let Some(idx) = ERROR_KINDS.iter().position(|k| *k == error.kind()) {
            self.errors[idx].inc();
        }
    }

    pub fn errors_of_kind(&self, kind: &str) -> u64 {
        ERROR_KINDS
            .iter()
            .position(|k| *k == kind)
            .map(|idx| self.errors[idx].get())
            .unwrap_or(0)
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("botbox_uploads_total", "Accepted uploads", &self.uploads),
            ("botbox_validation_failures_total", "Uploads that failed syntax validation", &self.validation_failures),
            ("botbox_starts_total", "Successful bot starts", &self.starts),
            ("botbox_start_failures_total", "Bot starts that failed to launch", &self.start_failures),
            ("botbox_stops_total", "Bot stops", &self.stops),
            ("botbox_restarts_total", "Manual restarts", &self.restarts),
            ("botbox_deletes_total", "Deleted bots", &self.deletes),
            ("botbox_installs_total", "Successful dependency installs", &self.installs),
            ("botbox_install_failures_total", "Failed or timed-out dependency installs", &self.install_failures),
            ("botbox_crash_reconciliations_total", "Running records found without a live context", &self.crash_reconciliations),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, counter.get()));
        }

        output.push_str("# HELP botbox_errors_total Failed operations by error kind\n");
        output.push_str("# TYPE botbox_errors_total counter\n");
        for (kind, counter) in ERROR_KINDS.iter().zip(self.errors.iter()) {
            output.push_str(&format!(
                "botbox_errors_total{{kind=\"{}\"}} {}\n",
                kind,
                counter.get()
            ));
        }

        output.push_str("# HELP botbox_running_bots Bots currently recorded as running\n");
        output.push_str("# TYPE botbox_running_bots gauge\n");
        output.push_str(&format!("botbox_running_bots {}\n", self.running_bots.get()));

        self.launch_latency.export(
            "botbox_launch_latency_seconds",
            "Time from start request to running context",
            &mut output,
        );
        self.install_duration.export(
            "botbox_install_duration_seconds",
            "Dependency installer run time",
            &mut output,
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry used by the CLI
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.set(2);
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 2);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_launch();
        histogram.observe(Duration::from_millis(40));
        histogram.observe(Duration::from_millis(300));
        histogram.observe(Duration::from_secs(4));

        assert_eq!(histogram.get_count(), 3);
        assert_eq!(histogram.get_bucket_count(0.05), 1);
        assert_eq!(histogram.get_bucket_count(0.5), 2);
        assert_eq!(histogram.get_bucket_count(5.0), 3);
    }

    #[test]
    fn test_errors_by_kind() {
        let metrics = MetricsRegistry::new();
        metrics.record_error(&BotError::InvalidState("running".into()));
        metrics.record_error(&BotError::InvalidState("uploaded".into()));
        metrics.record_error(&BotError::LaunchFailed("no image".into()));
        assert_eq!(metrics.errors_of_kind("invalid_state"), 2);
        assert_eq!(metrics.errors_of_kind("launch_failed"), 1);
        assert_eq!(metrics.errors_of_kind("store"), 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();
        metrics.starts.inc();
        metrics.starts.inc();
        metrics.start_failures.inc();
        metrics.running_bots.set(1);
        metrics.record_error(&BotError::NotFound("bot 3".into()));
        metrics.launch_latency.observe(Duration::from_millis(120));

        let output = metrics.export_prometheus();
        assert!(output.contains("botbox_starts_total 2"));
        assert!(output.contains("botbox_start_failures_total 1"));
        assert!(output.contains("botbox_running_bots 1"));
        assert!(output.contains("botbox_errors_total{kind=\"not_found\"} 1"));
        assert!(output.contains("botbox_launch_latency_seconds_count 1"));
        assert!(output.contains("botbox_launch_latency_seconds_bucket{le=\"+Inf\"} 1"));
    }

    #[test]
    fn test_global_metrics_is_shared() {
        assert!(Arc::ptr_eq(&get_metrics(), &get_metrics()));
    }
}
