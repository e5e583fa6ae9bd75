//! Urgency-tiered retry and circuit-breaker protection for CareLink
//! downstream calls.
//!
//! Every protected call goes through [`ResilienceManager::execute_with_resilience`]:
//!
//! - the [`RetryPolicyRegistry`] resolves the operation id and urgency to an
//!   immutable [`RetryConfig`],
//! - the operation's [`CircuitBreaker`] decides whether an attempt may run,
//! - the [`RetryExecutor`] runs attempts, classifies failures through
//!   [`Classify`] and waits out the [`BackoffCalculator`] delay between them,
//! - the [`MetricsCollector`] and the configured sinks observe every step.
//!
//! Terminal failures come back as [`ResilienceError`]: `RetryExhausted`,
//! `NonRetryable`, `CircuitOpen`, `CircuitTripped` or `Cancelled`.
//!
//! # Feature Flags
//! - `prometheus`: [`telemetry::PrometheusMetricsSink`] exporter

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod settings;
pub mod telemetry;
pub mod testing;
pub mod utils;

pub use backoff::BackoffCalculator;
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerSnapshot, CircuitState, StateTransition,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{
    BackoffStrategy, CircuitBreakerConfig, CircuitBreakerConfigBuilder, RetryConfig,
    RetryConfigBuilder,
};
pub use error::{
    AttemptFailure, CancelReason, CancelledError, CircuitOpenError, Classify, ConfigError,
    ConfigResult, FailureKind, ResilienceError, ResilienceResult,
};
pub use executor::{Cancellation, ExecutionContext, RetryExecutor, RetryOutcome};
pub use manager::{ResilienceManager, ResilienceManagerBuilder};
pub use metrics::{MetricsCollector, OperationMetrics};
pub use policy::{PolicyName, PolicySelector, RetryPolicyRegistry, Urgency};
pub use settings::{ResilienceSettings, SettingsError};
pub use telemetry::{EventSink, MetricsSink, ResilienceEvent, TracingEventSink};
pub use utils::serde::duration_millis;

/// Everything a call site needs
pub mod prelude {
    pub use crate::error::{Classify, FailureKind, ResilienceError, ResilienceResult};
    pub use crate::executor::Cancellation;
    pub use crate::manager::ResilienceManager;
    pub use crate::policy::{PolicyName, Urgency};
}
