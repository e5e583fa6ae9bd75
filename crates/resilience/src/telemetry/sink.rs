//! Metrics export seam
//!
//! [`MetricsSink`] mirrors a plain counter/gauge/histogram recorder. The
//! [`MetricsCollector`](crate::metrics::MetricsCollector) forwards every
//! update to one.

use std::fmt::Debug;

/// Metric names emitted by the collector
pub mod names {
    /// Counter, labels: `operation`
    pub const ATTEMPTS_TOTAL: &str = "resilience_attempts_total";
    /// Counter, labels: `operation`
    pub const SUCCESSES_TOTAL: &str = "resilience_successes_total";
    /// Counter, labels: `operation`, `kind`, `retryable`
    pub const FAILURES_TOTAL: &str = "resilience_failures_total";
    /// Histogram in milliseconds, labels: `operation`
    pub const RETRY_DELAY_MS: &str = "resilience_retry_delay_ms";
    /// Gauge (0=closed, 1=open, 2=half-open), labels: `operation`
    pub const CIRCUIT_STATE: &str = "resilience_circuit_state";
    /// Counter, labels: `operation`, `from`, `to`
    pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "resilience_circuit_transitions_total";
    /// Counter, labels: `operation`
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "resilience_circuit_rejections_total";
    /// Counter, labels: `operation`
    pub const CANCELLATIONS_TOTAL: &str = "resilience_cancellations_total";
    /// Counter, labels: `operation`
    pub const EXHAUSTED_TOTAL: &str = "resilience_exhausted_total";
}

/// Backend receiving metric updates
pub trait MetricsSink: Send + Sync + Debug {
    /// Increment a counter metric
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Record a gauge value
    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record a histogram value
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Discards every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}

    fn record_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}

    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}
