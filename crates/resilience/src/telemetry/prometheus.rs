//! Prometheus exporter for resilience metrics
//!
//! Registers one collector per metric in [`names`](super::sink::names) on a
//! caller-supplied registry. Label values are matched by label name, so the
//! order of the `labels` slice does not matter; a missing label records as
//! an empty string.

use std::collections::HashMap;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use tracing::debug;

use super::sink::{names, MetricsSink};

const OPERATION: &[&str] = &["operation"];
const FAILURE_LABELS: &[&str] = &["operation", "kind", "retryable"];
const TRANSITION_LABELS: &[&str] = &["operation", "from", "to"];

/// Retry delay buckets in milliseconds
const DELAY_BUCKETS_MS: &[f64] =
    &[10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_000.0, 5_000.0, 10_000.0, 30_000.0];

struct Labelled<M> {
    metric: M,
    labels: &'static [&'static str],
}

impl<M> Labelled<M> {
    fn values<'a>(&self, labels: &[(&str, &'a str)]) -> Vec<&'a str> {
        self.labels
            .iter()
            .map(|name| {
                labels.iter().find(|(key, _)| key == name).map(|(_, value)| *value).unwrap_or("")
            })
            .collect()
    }
}

/// [`MetricsSink`] backed by `prometheus` collectors
pub struct PrometheusMetricsSink {
    counters: HashMap<&'static str, Labelled<CounterVec>>,
    gauges: HashMap<&'static str, Labelled<GaugeVec>>,
    histograms: HashMap<&'static str, Labelled<HistogramVec>>,
}

impl std::fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsSink")
            .field("counters", &self.counters.keys().collect::<Vec<_>>())
            .field("gauges", &self.gauges.keys().collect::<Vec<_>>())
            .field("histograms", &self.histograms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PrometheusMetricsSink {
    /// Create the collectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter_specs: [(&'static str, &str, &'static [&'static str]); 6] = [
            (names::ATTEMPTS_TOTAL, "Total number of attempts made", OPERATION),
            (names::SUCCESSES_TOTAL, "Total number of successful calls", OPERATION),
            (names::FAILURES_TOTAL, "Total number of failed attempts", FAILURE_LABELS),
            (
                names::CIRCUIT_TRANSITIONS_TOTAL,
                "Total number of circuit breaker state transitions",
                TRANSITION_LABELS,
            ),
            (
                names::CIRCUIT_REJECTIONS_TOTAL,
                "Total number of calls rejected by an open circuit",
                OPERATION,
            ),
            (names::CANCELLATIONS_TOTAL, "Total number of cancelled calls", OPERATION),
        ];

        let mut counters = HashMap::new();
        for (name, help, labels) in counter_specs {
            let metric = CounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(metric.clone()))?;
            counters.insert(name, Labelled { metric, labels });
        }

        let exhausted = CounterVec::new(
            Opts::new(names::EXHAUSTED_TOTAL, "Total number of calls that exhausted retries"),
            OPERATION,
        )?;
        registry.register(Box::new(exhausted.clone()))?;
        counters.insert(names::EXHAUSTED_TOTAL, Labelled { metric: exhausted, labels: OPERATION });

        let state = GaugeVec::new(
            Opts::new(
                names::CIRCUIT_STATE,
                "Current state of circuit breaker (0=closed, 1=open, 2=half-open)",
            ),
            OPERATION,
        )?;
        registry.register(Box::new(state.clone()))?;
        let mut gauges = HashMap::new();
        gauges.insert(names::CIRCUIT_STATE, Labelled { metric: state, labels: OPERATION });

        let delays = HistogramVec::new(
            HistogramOpts::new(
                names::RETRY_DELAY_MS,
                "Delay between retry attempts in milliseconds",
            )
            .buckets(DELAY_BUCKETS_MS.to_vec()),
            OPERATION,
        )?;
        registry.register(Box::new(delays.clone()))?;
        let mut histograms = HashMap::new();
        histograms.insert(names::RETRY_DELAY_MS, Labelled { metric: delays, labels: OPERATION });

        Ok(Self { counters, gauges, histograms })
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        match self.counters.get(name) {
            Some(counter) => counter.metric.with_label_values(&counter.values(labels)).inc(),
            None => debug!(metric = name, "Unknown counter ignored"),
        }
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        match self.gauges.get(name) {
            Some(gauge) => gauge.metric.with_label_values(&gauge.values(labels)).set(value),
            None => debug!(metric = name, "Unknown gauge ignored"),
        }
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        match self.histograms.get(name) {
            Some(histogram) => {
                histogram.metric.with_label_values(&histogram.values(labels)).observe(value)
            }
            None => debug!(metric = name, "Unknown histogram ignored"),
        }
    }
}
