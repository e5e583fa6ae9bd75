//! Owner of the per-operation breakers, metrics and policies
//!
//! A [`ResilienceManager`] is constructed explicitly and shared by reference
//! (usually behind an `Arc`). Breakers are created lazily per operation id
//! and live as long as the manager.
//!
//! ```no_run
//! use carelink_resilience::prelude::*;
//!
//! # async fn fetch_record() -> Result<String, std::io::Error> { Ok(String::new()) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ResilienceManager::new();
//! let record = manager
//!     .execute_with_resilience("fhir.patient", Urgency::new(4)?, &Cancellation::new(), || {
//!         fetch_record()
//!     })
//!     .await?;
//! # let _ = record;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{Classify, ResilienceResult};
use crate::executor::{Cancellation, ExecutionContext, RetryExecutor, RetryOutcome};
use crate::metrics::{MetricsCollector, OperationMetrics};
use crate::policy::{PolicySelector, RetryPolicyRegistry};
use crate::settings::{ResilienceSettings, SettingsError};
use crate::telemetry::events::{EventSink, TracingEventSink};
use crate::telemetry::sink::{MetricsSink, NoopMetricsSink};

/// Retry and circuit-breaker protection for many operations
pub struct ResilienceManager<C: Clock + Clone = SystemClock> {
    registry: RetryPolicyRegistry,
    breakers: DashMap<String, Arc<CircuitBreaker<C>>>,
    breaker_defaults: CircuitBreakerConfig,
    breaker_overrides: DashMap<String, CircuitBreakerConfig>,
    executor: RetryExecutor<C>,
    clock: C,
}

impl<C: Clock + Clone> fmt::Debug for ResilienceManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("breakers", &self.breakers.len())
            .field("breaker_defaults", &self.breaker_defaults)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Default for ResilienceManager<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceManager<SystemClock> {
    /// Manager with built-in tiers, default breakers and tracing events
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ResilienceManagerBuilder<SystemClock> {
        ResilienceManagerBuilder::new(SystemClock)
    }

    /// Manager configured from [`settings::load`](crate::settings::load)
    pub fn from_env_or_file() -> Result<Self, SettingsError> {
        let settings = crate::settings::load()?;
        Ok(Self::builder().with_settings(&settings)?.build())
    }
}

impl<C: Clock + Clone> ResilienceManager<C> {
    /// Run `operation` under the resolved retry policy and the operation's
    /// circuit breaker.
    ///
    /// `policy` accepts an [`Urgency`](crate::policy::Urgency), a
    /// [`PolicyName`](crate::policy::PolicyName), a
    /// [`RetryConfig`](crate::config::RetryConfig) or a [`PolicySelector`].
    ///
    /// # Errors
    /// - `RetryExhausted` after the last permitted retryable failure
    /// - `NonRetryable` on the first failure outside the allow-list
    /// - `CircuitOpen` when the breaker refuses an attempt
    /// - `CircuitTripped` when a failure opens the breaker before the
    ///   attempts run out
    /// - `Cancelled` when the token fires or the deadline passes
    pub async fn execute_with_resilience<F, Fut, T, E>(
        &self,
        operation_id: &str,
        policy: impl Into<PolicySelector>,
        cancellation: &Cancellation,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        self.execute_with_outcome(operation_id, policy, cancellation, operation).await.into_result()
    }

    /// Like [`execute_with_resilience`](Self::execute_with_resilience) but also
    /// returns attempt and timing statistics
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        operation_id: &str,
        policy: impl Into<PolicySelector>,
        cancellation: &Cancellation,
        operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        let selector = policy.into();
        let config = self.registry.resolve(operation_id, &selector);
        let breaker = self.breaker(operation_id);

        let ctx = ExecutionContext {
            operation_id,
            urgency: selector.urgency(),
            config: &config,
            breaker: &breaker,
            cancellation,
        };
        self.executor.execute_with_outcome(ctx, operation).await
    }

    /// The breaker for an operation, created on first use
    pub fn breaker(&self, operation_id: &str) -> Arc<CircuitBreaker<C>> {
        if let Some(breaker) = self.breakers.get(operation_id) {
            return Arc::clone(breaker.value());
        }

        let config = self.breaker_config(operation_id);
        let entry = self.breakers.entry(operation_id.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(operation_id, config, self.clock.clone()))
        });
        Arc::clone(entry.value())
    }

    /// Breaker configuration that applies to an operation
    pub fn breaker_config(&self, operation_id: &str) -> CircuitBreakerConfig {
        self.breaker_overrides
            .get(operation_id)
            .map(|entry| *entry.value())
            .unwrap_or(self.breaker_defaults)
    }

    /// Set the breaker configuration for an operation
    ///
    /// Takes effect when the operation's breaker is created. An existing
    /// breaker keeps its configuration.
    pub fn register_circuit_breaker(
        &self,
        operation_id: impl Into<String>,
        config: CircuitBreakerConfig,
    ) {
        self.breaker_overrides.insert(operation_id.into(), config);
    }

    /// Per-operation metrics snapshot
    pub fn get_metrics(&self) -> HashMap<String, OperationMetrics> {
        self.executor.metrics().snapshot_all()
    }

    pub fn get_operation_metrics(&self, operation_id: &str) -> Option<OperationMetrics> {
        self.executor.metrics().snapshot(operation_id)
    }

    /// Snapshot of every breaker created so far
    pub fn get_circuit_breaker_status(&self) -> HashMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn circuit_breaker_status(&self, operation_id: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.get(operation_id).map(|breaker| breaker.snapshot())
    }

    /// Force an operation's breaker back to closed
    ///
    /// Returns `false` if no breaker exists for the operation.
    pub fn reset_circuit_breaker(&self, operation_id: &str) -> bool {
        let Some(breaker) = self.breakers.get(operation_id).map(|b| Arc::clone(b.value())) else {
            return false;
        };

        info!(operation = %operation_id, "Resetting circuit breaker");
        if let Some(transition) = breaker.reset() {
            self.executor.record_transition(operation_id, transition);
        }
        true
    }

    pub fn registry(&self) -> &RetryPolicyRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.executor.metrics()
    }
}

/// Builder for [`ResilienceManager`]
pub struct ResilienceManagerBuilder<C: Clock + Clone = SystemClock> {
    clock: C,
    registry: RetryPolicyRegistry,
    breaker_defaults: CircuitBreakerConfig,
    breaker_overrides: Vec<(String, CircuitBreakerConfig)>,
    events: Arc<dyn EventSink>,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl<C: Clock + Clone> fmt::Debug for ResilienceManagerBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManagerBuilder")
            .field("breaker_defaults", &self.breaker_defaults)
            .field("breaker_overrides", &self.breaker_overrides)
            .field("events", &self.events)
            .field("metrics_sink", &self.metrics_sink)
            .finish()
    }
}

impl<C: Clock + Clone> ResilienceManagerBuilder<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            registry: RetryPolicyRegistry::new(),
            breaker_defaults: CircuitBreakerConfig::default(),
            breaker_overrides: Vec::new(),
            events: Arc::new(TracingEventSink),
            metrics_sink: Arc::new(NoopMetricsSink),
        }
    }

    /// Swap the clock used by breakers and elapsed-time accounting
    pub fn clock<C2: Clock + Clone>(self, clock: C2) -> ResilienceManagerBuilder<C2> {
        ResilienceManagerBuilder {
            clock,
            registry: self.registry,
            breaker_defaults: self.breaker_defaults,
            breaker_overrides: self.breaker_overrides,
            events: self.events,
            metrics_sink: self.metrics_sink,
        }
    }

    pub fn registry(mut self, registry: RetryPolicyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Breaker configuration for operations without an override
    pub fn circuit_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = config;
        self
    }

    pub fn circuit_breaker_for(
        mut self,
        operation_id: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.breaker_overrides.push((operation_id.into(), config));
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    /// Apply tier, operation and breaker settings
    ///
    /// # Errors
    /// Returns the first section that fails validation.
    pub fn with_settings(mut self, settings: &ResilienceSettings) -> Result<Self, SettingsError> {
        self.registry = settings.to_registry()?;
        self.breaker_defaults = settings.circuit_breaker_defaults()?;
        self.breaker_overrides.extend(settings.circuit_breaker_overrides()?);
        Ok(self)
    }

    pub fn build(self) -> ResilienceManager<C> {
        let metrics = Arc::new(MetricsCollector::with_sink(self.metrics_sink));
        let executor = RetryExecutor::new(metrics, self.events, self.clock.clone());

        ResilienceManager {
            registry: self.registry,
            breakers: DashMap::new(),
            breaker_defaults: self.breaker_defaults,
            breaker_overrides: self.breaker_overrides.into_iter().collect(),
            executor,
            clock: self.clock,
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the manager's keyed state and query surface.

    use std::time::Duration;

    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::RetryConfig;
    use crate::error::{FailureKind, ResilienceError};
    use crate::policy::{PolicyName, Urgency};
    use crate::testing::{MockClock, RecordingEventSink, ScriptedOperation, Step};

    fn single_attempt() -> RetryConfig {
        RetryConfig::builder().max_attempts(1).build().unwrap()
    }

    fn breaker_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .open_timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    #[test]
    fn test_breakers_are_created_lazily_and_shared() {
        let manager = ResilienceManager::new();
        assert!(manager.get_circuit_breaker_status().is_empty());

        let first = manager.breaker("fhir");
        let second = manager.breaker("fhir");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.get_circuit_breaker_status().len(), 1);
        assert!(manager.circuit_breaker_status("other").is_none());
    }

    #[test]
    fn test_breaker_overrides_apply_per_operation() {
        let manager = ResilienceManager::builder()
            .circuit_breaker_defaults(breaker_config(7))
            .circuit_breaker_for("inference", breaker_config(2))
            .build();

        assert_eq!(manager.breaker("inference").config().failure_threshold(), 2);
        assert_eq!(manager.breaker("fhir").config().failure_threshold(), 7);

        manager.register_circuit_breaker("audit", breaker_config(3));
        assert_eq!(manager.breaker("audit").config().failure_threshold(), 3);
    }

    /// Validates breaker isolation between operation ids.
    ///
    /// Assertions:
    /// - Opening one operation's breaker leaves another closed.
    /// - Reset closes the open breaker and reports the transition.
    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_isolated_and_resettable() {
        let events = Arc::new(RecordingEventSink::new());
        let manager = ResilienceManager::builder()
            .clock(MockClock::new())
            .circuit_breaker_defaults(breaker_config(1))
            .event_sink(events.clone())
            .build();
        let failing = ScriptedOperation::always_failing(FailureKind::Connection);
        let healthy = ScriptedOperation::new([Step::Succeed]);
        let cancellation = Cancellation::new();

        let result = manager
            .execute_with_resilience("inference", single_attempt(), &cancellation, || {
                failing.call()
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::RetryExhausted { attempts: 1, .. })));

        let ok = manager
            .execute_with_resilience("fhir", single_attempt(), &cancellation, || healthy.call())
            .await;
        assert!(ok.is_ok());

        let status = manager.get_circuit_breaker_status();
        assert_eq!(status["inference"].state, CircuitState::Open);
        assert_eq!(status["fhir"].state, CircuitState::Closed);

        assert!(manager.reset_circuit_breaker("inference"));
        assert!(!manager.reset_circuit_breaker("unknown"));
        assert_eq!(manager.breaker("inference").state(), CircuitState::Closed);
        assert_eq!(
            events.transitions("inference"),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgency_selects_tier() {
        let events = Arc::new(RecordingEventSink::new());
        let manager = ResilienceManager::builder()
            .circuit_breaker_defaults(breaker_config(50))
            .event_sink(events.clone())
            .build();
        let op = ScriptedOperation::always_failing(FailureKind::Timeout);

        let result = manager
            .execute_with_resilience("triage", Urgency::EMERGENCY, &Cancellation::new(), || {
                op.call()
            })
            .await;

        assert_eq!(result.unwrap_err().attempts(), 5);
        assert_eq!(
            events.retry_delays("triage"),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );

        let metrics = manager.get_operation_metrics("triage").unwrap();
        assert_eq!(metrics.attempts, 5);
        assert_eq!(metrics.failures, 5);
        assert_eq!(metrics.exhausted, 1);
        assert_eq!(metrics.retries_observed, 4);
        assert_eq!(metrics.average_retry_wait(), Duration::from_millis(375));
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_policy_bypasses_operation_override() {
        let manager = ResilienceManager::new();
        manager.registry().register_operation("triage", single_attempt());
        let op = ScriptedOperation::succeed_after(2, FailureKind::Connection);

        let overridden = manager
            .execute_with_outcome("triage", PolicySelector::Default, &Cancellation::new(), || {
                op.call()
            })
            .await;
        assert_eq!(overridden.attempts, 1);

        let named = manager
            .execute_with_outcome("triage", PolicyName::Aggressive, &Cancellation::new(), || {
                op.call()
            })
            .await;
        assert!(named.is_success());
        assert_eq!(named.attempts, 2);
    }

    #[test]
    fn test_with_settings_applies_every_section() {
        let settings: ResilienceSettings = toml::from_str(
            r#"
            [circuit_breaker]
            failure_threshold = 9

            [operations.inference.circuit_breaker]
            failure_threshold = 2

            [operations.inference.retry]
            max_attempts = 1
            "#,
        )
        .unwrap();

        let manager = ResilienceManager::builder().with_settings(&settings).unwrap().build();

        assert_eq!(manager.breaker("inference").config().failure_threshold(), 2);
        assert_eq!(manager.breaker("fhir").config().failure_threshold(), 9);
        let config = manager.registry().resolve("inference", &PolicySelector::Default);
        assert_eq!(config.max_attempts(), 1);
    }
}
