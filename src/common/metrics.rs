//! Prometheus-compatible controller metrics
//!
//! One `Metrics` value is created per controller and shared through `Arc`,
//! so tests can assert on counters without global state.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Histogram bucket boundaries for probe latency (in milliseconds)
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
        let buckets = (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: LATENCY_BUCKETS.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        // sum kept in microseconds
        self.sum.fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf
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
        Self {
            value: AtomicU64::new(0),
        }
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
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Controller metrics
#[derive(Debug)]
pub struct Metrics {
    pub probes_total: Counter,
    pub probe_failures_total: Counter,
    pub failovers_total: Counter,
    pub failovers_aborted_total: Counter,
    pub promotions_failed_total: Counter,
    pub registry_mutations_total: Counter,
    pub leadership_changes_total: Counter,

    pub monitored_masters: Gauge,
    pub is_leader: Gauge,

    pub probe_duration_ms: Histogram,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            probes_total: Counter::new(),
            probe_failures_total: Counter::new(),
            failovers_total: Counter::new(),
            failovers_aborted_total: Counter::new(),
            promotions_failed_total: Counter::new(),
            registry_mutations_total: Counter::new(),
            leadership_changes_total: Counter::new(),
            monitored_masters: Gauge::new(),
            is_leader: Gauge::new(),
            probe_duration_ms: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus text exposition output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 7] = [
            ("probes_total", "Master probes issued", &self.probes_total),
            (
                "probe_failures_total",
                "Master probes that failed",
                &self.probe_failures_total,
            ),
            ("failovers_total", "Completed failovers", &self.failovers_total),
            (
                "failovers_aborted_total",
                "Failovers aborted before promotion",
                &self.failovers_aborted_total,
            ),
            (
                "promotions_failed_total",
                "Promotions that left a group without a master",
                &self.promotions_failed_total,
            ),
            (
                "registry_mutations_total",
                "Registry actions committed by this controller",
                &self.registry_mutations_total,
            ),
            (
                "leadership_changes_total",
                "Leadership transitions observed",
                &self.leadership_changes_total,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP failoverd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE failoverd_{} counter", name);
            let _ = writeln!(out, "failoverd_{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            (
                "monitored_masters",
                "Masters currently monitored",
                self.monitored_masters.get(),
            ),
            ("is_leader", "1 when this controller is leader", self.is_leader.get()),
            ("uptime_seconds", "Controller uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP failoverd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE failoverd_{} gauge", name);
            let _ = writeln!(out, "failoverd_{} {}", name, value);
        }

        out.push_str("# HELP failoverd_probe_duration_ms Probe duration in milliseconds\n");
        out.push_str("# TYPE failoverd_probe_duration_ms histogram\n");
        for (le, count) in self.probe_duration_ms.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "failoverd_probe_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "failoverd_probe_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "failoverd_probe_duration_ms_sum {}", self.probe_duration_ms.sum());
        let _ = writeln!(
            out,
            "failoverd_probe_duration_ms_count {}",
            self.probe_duration_ms.count()
        );

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.last().unwrap().1, 3);
        assert_eq!(buckets[1], (5.0, 1));
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.failovers_total.inc();
        metrics.monitored_masters.set(2);
        metrics.probe_duration_ms.observe(3.0);

        let text = metrics.to_prometheus();
        assert!(text.contains("failoverd_failovers_total 1"));
        assert!(text.contains("failoverd_monitored_masters 2"));
        assert!(text.contains("# TYPE failoverd_probe_duration_ms histogram"));
        assert!(text.contains("failoverd_probe_duration_ms_count 1"));
    }
}
