//! Per-operation execution metrics
//!
//! [`MetricsCollector`] keeps one [`OperationMetrics`] per operation id in a
//! sharded map, each behind its own lock held only for the counter update.
//! Snapshots are clones, never live views. Every update is also forwarded to
//! the configured [`MetricsSink`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::circuit_breaker::StateTransition;
use crate::error::FailureKind;
use crate::telemetry::sink::{names, MetricsSink, NoopMetricsSink};

/// Counters for one operation id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationMetrics {
    /// Times the operation was invoked
    pub attempts: u64,
    pub successes: u64,
    /// Failed attempts, retryable or not
    pub failures: u64,
    /// Failed attempts that were not eligible for retry
    pub non_retryable_failures: u64,
    /// Backoff waits that completed
    pub retries_observed: u64,
    /// Sum of completed backoff waits
    #[serde(with = "crate::utils::serde::duration_millis")]
    pub total_retry_time: Duration,
    pub circuit_rejections: u64,
    pub cancellations: u64,
    /// Calls that ended in retry exhaustion
    pub exhausted: u64,
    pub circuit_transitions: u64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<FailureKind>,
}

impl OperationMetrics {
    /// Cumulative mean of completed backoff waits
    pub fn average_retry_wait(&self) -> Duration {
        if self.retries_observed == 0 {
            return Duration::ZERO;
        }
        let divisor = u32::try_from(self.retries_observed).unwrap_or(u32::MAX);
        self.total_retry_time / divisor
    }

    /// Fraction of attempts that succeeded, 0.0 with no attempts
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

impl fmt::Display for OperationMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OperationMetrics {{ attempts: {}, successes: {}, failures: {}, \
             average_retry_wait: {:?} }}",
            self.attempts,
            self.successes,
            self.failures,
            self.average_retry_wait()
        )
    }
}

/// Records execution metrics keyed by operation id
pub struct MetricsCollector {
    operations: DashMap<String, Arc<Mutex<OperationMetrics>>>,
    sink: Arc<dyn MetricsSink>,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("operations", &self.operations.len())
            .field("sink", &self.sink)
            .finish()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Collector that keeps counters in memory only
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NoopMetricsSink))
    }

    /// Collector that also forwards every update to `sink`
    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self { operations: DashMap::new(), sink }
    }

    fn update<R>(&self, operation_id: &str, f: impl FnOnce(&mut OperationMetrics) -> R) -> R {
        // The read guard must be gone before `entry` takes the shard write lock
        let existing = self.operations.get(operation_id).map(|entry| Arc::clone(entry.value()));
        let entry = match existing {
            Some(entry) => entry,
            None => {
                Arc::clone(self.operations.entry(operation_id.to_string()).or_default().value())
            }
        };
        let mut metrics = entry.lock();
        f(&mut metrics)
    }

    /// A completed successful attempt
    pub fn record_success(&self, operation_id: &str) {
        self.update(operation_id, |m| {
            m.attempts += 1;
            m.successes += 1;
        });

        let labels = [("operation", operation_id)];
        self.sink.increment_counter(names::ATTEMPTS_TOTAL, &labels);
        self.sink.increment_counter(names::SUCCESSES_TOTAL, &labels);
    }

    /// A completed failed attempt
    pub fn record_failure(
        &self,
        operation_id: &str,
        kind: &FailureKind,
        error: &str,
        retryable: bool,
    ) {
        self.update(operation_id, |m| {
            m.attempts += 1;
            m.failures += 1;
            if !retryable {
                m.non_retryable_failures += 1;
            }
            m.last_error = Some(error.to_string());
            m.last_error_kind = Some(kind.clone());
        });

        self.sink.increment_counter(names::ATTEMPTS_TOTAL, &[("operation", operation_id)]);
        self.sink.increment_counter(
            names::FAILURES_TOTAL,
            &[
                ("operation", operation_id),
                ("kind", kind.as_str()),
                ("retryable", if retryable { "true" } else { "false" }),
            ],
        );
    }

    /// A backoff wait that ran to completion
    pub fn record_retry_wait(&self, operation_id: &str, delay: Duration) {
        self.update(operation_id, |m| {
            m.retries_observed += 1;
            m.total_retry_time = m.total_retry_time.saturating_add(delay);
        });

        self.sink.record_histogram(
            names::RETRY_DELAY_MS,
            delay.as_secs_f64() * 1_000.0,
            &[("operation", operation_id)],
        );
    }

    /// A call refused by the circuit breaker
    pub fn record_rejection(&self, operation_id: &str) {
        self.update(operation_id, |m| m.circuit_rejections += 1);
        self.sink
            .increment_counter(names::CIRCUIT_REJECTIONS_TOTAL, &[("operation", operation_id)]);
    }

    /// A call abandoned through cancellation or deadline
    pub fn record_cancellation(&self, operation_id: &str) {
        self.update(operation_id, |m| m.cancellations += 1);
        self.sink.increment_counter(names::CANCELLATIONS_TOTAL, &[("operation", operation_id)]);
    }

    /// A call that used all of its attempts
    pub fn record_exhausted(&self, operation_id: &str) {
        self.update(operation_id, |m| m.exhausted += 1);
        self.sink.increment_counter(names::EXHAUSTED_TOTAL, &[("operation", operation_id)]);
    }

    /// A circuit breaker phase change
    pub fn record_transition(&self, operation_id: &str, transition: StateTransition) {
        self.update(operation_id, |m| m.circuit_transitions += 1);

        let from = transition.from.to_string();
        let to = transition.to.to_string();
        self.sink.increment_counter(
            names::CIRCUIT_TRANSITIONS_TOTAL,
            &[("operation", operation_id), ("from", from.as_str()), ("to", to.as_str())],
        );
        self.sink.record_gauge(
            names::CIRCUIT_STATE,
            transition.to.as_gauge(),
            &[("operation", operation_id)],
        );
    }

    /// Copy of one operation's counters
    pub fn snapshot(&self, operation_id: &str) -> Option<OperationMetrics> {
        self.operations.get(operation_id).map(|entry| entry.value().lock().clone())
    }

    /// Copy of every operation's counters
    pub fn snapshot_all(&self) -> HashMap<String, OperationMetrics> {
        self.operations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().clone()))
            .collect()
    }

    /// Drop all recorded counters
    pub fn clear(&self) {
        self.operations.clear();
    }
}
