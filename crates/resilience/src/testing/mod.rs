//! Test doubles for code built on this crate
//!
//! - [`RecordingEventSink`] and [`RecordingMetricsSink`] capture what the
//!   executor and collector emit.
//! - [`ScriptedOperation`] plays back a fixed sequence of outcomes and counts
//!   invocations.
//! - [`TestError`] is a classifiable error carrying a [`FailureKind`].
//!
//! Pair with [`MockClock`] for breakers and with
//! `#[tokio::test(start_paused = true)]` for backoff timing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

pub use crate::clock::MockClock;
use crate::circuit_breaker::CircuitState;
use crate::error::{Classify, FailureKind};
use crate::telemetry::events::{EventSink, ResilienceEvent};
use crate::telemetry::sink::MetricsSink;

/// Error with an explicit classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure on call {call}")]
pub struct TestError {
    pub kind: FailureKind,
    /// 1-based invocation number that produced the error
    pub call: u32,
}

impl TestError {
    pub fn new(kind: FailureKind) -> Self {
        Self { kind, call: 0 }
    }
}

impl Classify for TestError {
    fn failure_kind(&self) -> FailureKind {
        self.kind.clone()
    }
}

/// One scripted invocation result
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Return `Ok(call_number)`
    Succeed,
    /// Return a [`TestError`] of this kind
    Fail(FailureKind),
    /// Sleep on the tokio clock, then succeed
    Slow(Duration),
}

#[derive(Debug)]
struct Script {
    steps: VecDeque<Step>,
    last: Step,
}

/// Operation that plays back [`Step`]s
///
/// Once the script runs out the final step repeats. Clones share the script
/// and the call counter.
#[derive(Debug, Clone)]
pub struct ScriptedOperation {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicU32>,
}

impl ScriptedOperation {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let steps: VecDeque<Step> = steps.into_iter().collect();
        let last = steps.back().cloned().unwrap_or(Step::Succeed);
        Self {
            script: Arc::new(Mutex::new(Script { steps, last })),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fails with `kind` on every call
    pub fn always_failing(kind: FailureKind) -> Self {
        Self::new([Step::Fail(kind)])
    }

    /// Fails `failures` times with `kind`, then succeeds
    pub fn succeed_after(failures: u32, kind: FailureKind) -> Self {
        let steps = (0..failures).map(|_| Step::Fail(kind.clone())).chain([Step::Succeed]);
        Self::new(steps)
    }

    /// Invocations so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Run the next step
    pub fn call(&self) -> impl Future<Output = Result<u32, TestError>> + Send + 'static {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = {
            let mut script = self.script.lock();
            match script.steps.pop_front() {
                Some(step) => step,
                None => script.last.clone(),
            }
        };

        async move {
            match step {
                Step::Succeed => Ok(call),
                Step::Fail(kind) => Err(TestError { kind, call }),
                Step::Slow(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(call)
                }
            }
        }
    }
}

/// [`EventSink`] that stores every event
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }

    /// Delays of every `RetryScheduled` event for an operation, in order
    pub fn retry_delays(&self, operation_id: &str) -> Vec<Duration> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ResilienceEvent::RetryScheduled { operation_id: id, delay, .. }
                    if id == operation_id =>
                {
                    Some(*delay)
                }
                _ => None,
            })
            .collect()
    }

    /// Circuit transitions recorded for an operation, in order
    pub fn transitions(&self, operation_id: &str) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ResilienceEvent::CircuitTransition { operation_id: id, from, to }
                    if id == operation_id =>
                {
                    Some((*from, *to))
                }
                _ => None,
            })
            .collect()
    }

    /// Number of events with this outcome label
    pub fn count(&self, outcome: &str) -> usize {
        self.events.lock().iter().filter(|event| event.outcome() == outcome).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        self.events.lock().push(event.clone());
    }
}

type SeriesKey = (String, String);

/// [`MetricsSink`] that keeps values keyed by metric name and `operation`
/// label
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    counters: Mutex<HashMap<SeriesKey, u64>>,
    gauges: Mutex<HashMap<SeriesKey, f64>>,
    histograms: Mutex<HashMap<SeriesKey, Vec<f64>>>,
}

fn series(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let operation =
        labels.iter().find(|(key, _)| *key == "operation").map(|(_, value)| *value).unwrap_or("");
    (name.to_string(), operation.to_string())
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, operation_id: &str) -> u64 {
        let key = (name.to_string(), operation_id.to_string());
        self.counters.lock().get(&key).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, operation_id: &str) -> Option<f64> {
        let key = (name.to_string(), operation_id.to_string());
        self.gauges.lock().get(&key).copied()
    }

    pub fn histogram(&self, name: &str, operation_id: &str) -> Vec<f64> {
        let key = (name.to_string(), operation_id.to_string());
        self.histograms.lock().get(&key).cloned().unwrap_or_default()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self.counters.lock().entry(series(name, labels)).or_insert(0) += 1;
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.gauges.lock().insert(series(name, labels), value);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.histograms.lock().entry(series(name, labels)).or_default().push(value);
    }
}
