//! Client-side metrics
//!
//! Atomic counters and gauges updated by the dispatcher, the partition
//! executor and the tend loop, with a Prometheus text export.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counter for metrics
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for metrics (can go up and down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Set the gauge value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics shared by every component of one cluster client.
#[derive(Debug)]
pub struct ClientMetrics {
    /// Commands handed to the transport
    pub commands: Counter,
    /// Commands that returned an error
    pub command_errors: Counter,
    /// Commands refused because the node was in backoff
    pub backoff_rejections: Counter,
    /// Commands refused because the node's pool was saturated
    pub pool_rejections: Counter,
    /// Records delivered by partition queries
    pub records: Counter,
    /// Partition query rounds started
    pub rounds: Counter,
    /// Rounds started to retry unfinished partitions
    pub retry_rounds: Counter,
    /// Completed tend passes
    pub tends: Counter,
    /// Open connections across all nodes, refreshed every tend
    pub open_connections: Gauge,
    start_time: Instant,
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub commands: u64,
    pub command_errors: u64,
    pub backoff_rejections: u64,
    pub pool_rejections: u64,
    pub records: u64,
    pub rounds: u64,
    pub retry_rounds: u64,
    pub tends: u64,
    pub open_connections: u64,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            commands: Counter::new(),
            command_errors: Counter::new(),
            backoff_rejections: Counter::new(),
            pool_rejections: Counter::new(),
            records: Counter::new(),
            rounds: Counter::new(),
            retry_rounds: Counter::new(),
            tends: Counter::new(),
            open_connections: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands: self.commands.get(),
            command_errors: self.command_errors.get(),
            backoff_rejections: self.backoff_rejections.get(),
            pool_rejections: self.pool_rejections.get(),
            records: self.records.get(),
            rounds: self.rounds.get(),
            retry_rounds: self.retry_rounds.get(),
            tends: self.tends.get(),
            open_connections: self.open_connections.get(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let s = self.snapshot();

        push_metric(
            &mut output,
            "kvscatter_uptime_seconds",
            "gauge",
            "Client uptime in seconds",
            self.uptime_seconds(),
        );
        push_metric(
            &mut output,
            "kvscatter_commands_total",
            "counter",
            "Commands sent to nodes",
            s.commands,
        );
        push_metric(
            &mut output,
            "kvscatter_command_errors_total",
            "counter",
            "Commands that failed",
            s.command_errors,
        );
        push_metric(
            &mut output,
            "kvscatter_backoff_rejections_total",
            "counter",
            "Commands refused while the node was in backoff",
            s.backoff_rejections,
        );
        push_metric(
            &mut output,
            "kvscatter_pool_rejections_total",
            "counter",
            "Commands refused by a saturated connection pool",
            s.pool_rejections,
        );
        push_metric(
            &mut output,
            "kvscatter_records_total",
            "counter",
            "Records received from partition queries",
            s.records,
        );
        push_metric(
            &mut output,
            "kvscatter_rounds_total",
            "counter",
            "Partition query rounds",
            s.rounds,
        );
        push_metric(
            &mut output,
            "kvscatter_retry_rounds_total",
            "counter",
            "Partition query retry rounds",
            s.retry_rounds,
        );
        push_metric(
            &mut output,
            "kvscatter_tends_total",
            "counter",
            "Completed cluster tend passes",
            s.tends,
        );
        push_metric(
            &mut output,
            "kvscatter_open_connections",
            "gauge",
            "Open connections across all nodes",
            s.open_connections,
        );

        output
    }
}

fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} {}\n", name, kind));
    output.push_str(&format!("{} {}\n", name, value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(100);
        assert_eq!(gauge.get(), 100);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ClientMetrics::new();
        metrics.commands.inc_by(3);
        metrics.retry_rounds.inc();
        metrics.open_connections.set(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands, 3);
        assert_eq!(snapshot.retry_rounds, 1);
        assert_eq!(snapshot.open_connections, 7);
        assert_eq!(snapshot.records, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = ClientMetrics::new();
        metrics.records.inc_by(42);

        let output = metrics.export_prometheus();
        assert!(output.contains("# TYPE kvscatter_records_total counter"));
        assert!(output.contains("kvscatter_records_total 42"));
        assert!(output.contains("kvscatter_open_connections 0"));
    }
}
