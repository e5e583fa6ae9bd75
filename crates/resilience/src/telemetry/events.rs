//! Structured execution events
//!
//! The executor emits one [`ResilienceEvent`] per attempt, per scheduled
//! retry, per circuit transition and per terminal outcome. The default sink
//! writes them through `tracing`.

use std::fmt::Debug;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::error::{CancelReason, FailureKind};
use crate::policy::Urgency;

/// One observable step of a resilient call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    AttemptStarted {
        operation_id: String,
        urgency: Option<Urgency>,
        attempt: u32,
        max_attempts: u32,
    },
    AttemptSucceeded {
        operation_id: String,
        urgency: Option<Urgency>,
        attempt: u32,
        #[serde(with = "crate::utils::serde::duration_millis")]
        elapsed: Duration,
    },
    AttemptFailed {
        operation_id: String,
        urgency: Option<Urgency>,
        attempt: u32,
        kind: FailureKind,
        retryable: bool,
        error: String,
    },
    RetryScheduled {
        operation_id: String,
        urgency: Option<Urgency>,
        /// The attempt that just failed
        attempt: u32,
        #[serde(with = "crate::utils::serde::duration_millis")]
        delay: Duration,
    },
    CircuitRejected {
        operation_id: String,
        urgency: Option<Urgency>,
        attempt: u32,
        #[serde(with = "crate::utils::serde::option_duration_millis")]
        retry_after: Option<Duration>,
    },
    CircuitTransition {
        operation_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    NonRetryable {
        operation_id: String,
        urgency: Option<Urgency>,
        attempt: u32,
        kind: FailureKind,
    },
    Exhausted {
        operation_id: String,
        urgency: Option<Urgency>,
        attempts: u32,
        #[serde(with = "crate::utils::serde::duration_millis")]
        elapsed: Duration,
    },
    Cancelled {
        operation_id: String,
        urgency: Option<Urgency>,
        attempts: u32,
        reason: CancelReason,
    },
}

impl ResilienceEvent {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::AttemptStarted { operation_id, .. }
            | Self::AttemptSucceeded { operation_id, .. }
            | Self::AttemptFailed { operation_id, .. }
            | Self::RetryScheduled { operation_id, .. }
            | Self::CircuitRejected { operation_id, .. }
            | Self::CircuitTransition { operation_id, .. }
            | Self::NonRetryable { operation_id, .. }
            | Self::Exhausted { operation_id, .. }
            | Self::Cancelled { operation_id, .. } => operation_id,
        }
    }

    /// Short outcome label
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::AttemptStarted { .. } => "started",
            Self::AttemptSucceeded { .. } => "success",
            Self::AttemptFailed { .. } => "failure",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::CircuitRejected { .. } => "circuit_open",
            Self::CircuitTransition { .. } => "circuit_transition",
            Self::NonRetryable { .. } => "non_retryable",
            Self::Exhausted { .. } => "exhausted",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Receiver of [`ResilienceEvent`]s
pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, event: &ResilienceEvent);
}

/// Writes events as `tracing` records
///
/// Absorbed attempt failures and circuit rejections log at `warn`, exhaustion
/// and non-retryable failures at `error`. Cancellation is not a failure and
/// logs at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::AttemptStarted { operation_id, urgency, attempt, max_attempts } => {
                debug!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempt = attempt,
                    max_attempts = max_attempts,
                    "Attempt started"
                );
            }
            ResilienceEvent::AttemptSucceeded { operation_id, urgency, attempt, elapsed } => {
                info!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempt = attempt,
                    elapsed_ms = elapsed.as_millis(),
                    outcome = "success",
                    "Operation succeeded"
                );
            }
            ResilienceEvent::AttemptFailed {
                operation_id,
                urgency,
                attempt,
                kind,
                retryable,
                error,
            } => {
                warn!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempt = attempt,
                    kind = %kind,
                    retryable = retryable,
                    error = %error,
                    outcome = "failure",
                    "Attempt failed"
                );
            }
            ResilienceEvent::RetryScheduled { operation_id, urgency, attempt, delay } => {
                info!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    "Retry attempt with delay"
                );
            }
            ResilienceEvent::CircuitRejected { operation_id, urgency, attempt, retry_after } => {
                warn!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempt = attempt,
                    retry_after_ms = retry_after.map(|d| d.as_millis()),
                    outcome = "circuit_open",
                    "Circuit breaker is open, rejecting call"
                );
            }
            ResilienceEvent::CircuitTransition { operation_id, from, to } => {
                if *to == CircuitState::Open {
                    warn!(
                        operation = %operation_id,
                        from = %from,
                        to = %to,
                        "Circuit breaker transition"
                    );
                } else {
                    info!(
                        operation = %operation_id,
                        from = %from,
                        to = %to,
                        "Circuit breaker transition"
                    );
                }
            }
            ResilienceEvent::NonRetryable { operation_id, urgency, attempt, kind } => {
                error!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempt = attempt,
                    kind = %kind,
                    outcome = "non_retryable",
                    "Operation failed with non-retryable error"
                );
            }
            ResilienceEvent::Exhausted { operation_id, urgency, attempts, elapsed } => {
                error!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempts = attempts,
                    elapsed_ms = elapsed.as_millis(),
                    outcome = "exhausted",
                    "All retry attempts exhausted"
                );
            }
            ResilienceEvent::Cancelled { operation_id, urgency, attempts, reason } => {
                info!(
                    operation = %operation_id,
                    urgency = urgency.map(Urgency::get),
                    attempts = attempts,
                    reason = %reason,
                    outcome = "cancelled",
                    "Operation cancelled"
                );
            }
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &ResilienceEvent) {}
}
