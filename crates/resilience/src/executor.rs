//! Retry loop with circuit breaker, attempt timeout and cancellation
//!
//! For each attempt the executor:
//!
//! 1. stops with [`CancelledError`] if the caller cancelled or the deadline
//!    passed,
//! 2. asks the breaker for a permit and stops with [`CircuitOpenError`] if
//!    refused,
//! 3. runs the operation under the per-attempt timeout, abandoning it if the
//!    caller cancels or the deadline passes meanwhile,
//! 4. on success reports to breaker and metrics and returns,
//! 5. on failure classifies it. Non-retryable kinds end the call without
//!    touching the breaker. Retryable ones count against the breaker and
//!    either exhaust the budget, end the call if they opened the breaker, or
//!    wait out the backoff.
//!
//! Both the attempt and the backoff wait race the cancellation token and
//! deadline. No lock is held across the operation or the wait.
//!
//! [`CircuitOpenError`]: crate::error::CircuitOpenError

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backoff::BackoffCalculator;
use crate::circuit_breaker::{CircuitBreaker, CircuitState, StateTransition};
use crate::clock::{Clock, SystemClock};
use crate::config::RetryConfig;
use crate::error::{
    AttemptFailure, CancelReason, CancelledError, Classify, ResilienceError, ResilienceResult,
};
use crate::metrics::MetricsCollector;
use crate::policy::Urgency;
use crate::telemetry::events::{EventSink, ResilienceEvent};

//==============================================================================
// Cancellation
//==============================================================================

/// Caller-side abort signal: a cancellation token plus an optional deadline
///
/// The deadline is measured on tokio's clock, so paused-time tests can
/// advance past it.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<TokioInstant>,
}

impl Cancellation {
    /// Never fires unless the returned token is cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires when `token` is cancelled
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Add an absolute deadline
    pub fn with_deadline(mut self, deadline: TokioInstant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Add a deadline `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = TokioInstant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<TokioInstant> {
        self.deadline
    }

    /// Cancel the token
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Non-blocking check; the token wins over the deadline
    pub fn check(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if TokioInstant::now() >= deadline => {
                Some(CancelReason::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Resolves when the token fires or the deadline passes
    pub async fn fired(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}

//==============================================================================
// Outcome
//==============================================================================

/// Result of one resilient call plus its statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: ResilienceResult<T, E>,
    /// Times the operation was invoked
    pub attempts: u32,
    /// Time from entry to return
    pub elapsed: Duration,
    /// Sum of completed backoff waits
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Average completed wait between attempts
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

//==============================================================================
// Executor
//==============================================================================

/// Everything one call needs besides the operation itself
pub struct ExecutionContext<'a, C: Clock = SystemClock> {
    pub operation_id: &'a str,
    /// Urgency the config was resolved for, reported on events
    pub urgency: Option<Urgency>,
    pub config: &'a RetryConfig,
    pub breaker: &'a CircuitBreaker<C>,
    pub cancellation: &'a Cancellation,
}

impl<C: Clock> fmt::Debug for ExecutionContext<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("operation_id", &self.operation_id)
            .field("urgency", &self.urgency)
            .field("max_attempts", &self.config.max_attempts())
            .finish()
    }
}

/// Runs operations through the retry loop
pub struct RetryExecutor<C: Clock = SystemClock> {
    metrics: Arc<MetricsCollector>,
    events: Arc<dyn EventSink>,
    clock: C,
}

impl<C: Clock> fmt::Debug for RetryExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor").field("events", &self.events).finish()
    }
}

impl<C: Clock> RetryExecutor<C> {
    pub fn new(metrics: Arc<MetricsCollector>, events: Arc<dyn EventSink>, clock: C) -> Self {
        Self { metrics, events, clock }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: ExecutionContext<'_, C>,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        self.execute_with_outcome(ctx, operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    #[instrument(
        skip_all,
        fields(
            operation = %ctx.operation_id,
            urgency = ctx.urgency.map(Urgency::get),
            max_attempts = ctx.config.max_attempts()
        )
    )]
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        ctx: ExecutionContext<'_, C>,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + Send + Sync + 'static,
    {
        let ExecutionContext { operation_id, urgency, config, breaker, cancellation } = ctx;
        let start = self.clock.now();
        let max_attempts = config.max_attempts();
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        let outcome =
            |result: ResilienceResult<T, E>, attempts: u32, total_delay: Duration| RetryOutcome {
                result,
                attempts,
                elapsed: self.clock.now().saturating_duration_since(start),
                total_delay,
            };

        loop {
            if let Some(reason) = cancellation.check() {
                let result = Err(self.cancelled(operation_id, urgency, attempts, reason));
                return outcome(result, attempts, total_delay);
            }

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(rejection) => {
                    self.metrics.record_rejection(operation_id);
                    self.events.emit(&ResilienceEvent::CircuitRejected {
                        operation_id: operation_id.to_string(),
                        urgency,
                        attempt: attempts + 1,
                        retry_after: rejection.retry_after,
                    });
                    return outcome(Err(rejection.into()), attempts, total_delay);
                }
            };
            if let Some(transition) = permit.transition() {
                self.record_transition(operation_id, transition);
            }

            attempts += 1;
            self.events.emit(&ResilienceEvent::AttemptStarted {
                operation_id: operation_id.to_string(),
                urgency,
                attempt: attempts,
                max_attempts,
            });

            let attempt_started = self.clock.now();
            let attempt = async {
                match config.attempt_timeout() {
                    Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                        Ok(result) => result.map_err(AttemptFailure::Operation),
                        Err(_) => Err(AttemptFailure::TimedOut { timeout }),
                    },
                    None => operation().await.map_err(AttemptFailure::Operation),
                }
            };
            let result = tokio::select! {
                biased;
                reason = cancellation.fired() => {
                    // Abandoned attempts leave the breaker untouched
                    drop(permit);
                    let result = Err(self.cancelled(operation_id, urgency, attempts, reason));
                    return outcome(result, attempts, total_delay);
                }
                result = attempt => result,
            };

            let failure = match result {
                Ok(value) => {
                    if let Some(transition) = permit.record_success() {
                        self.record_transition(operation_id, transition);
                    }
                    self.metrics.record_success(operation_id);
                    self.events.emit(&ResilienceEvent::AttemptSucceeded {
                        operation_id: operation_id.to_string(),
                        urgency,
                        attempt: attempts,
                        elapsed: self.clock.now().saturating_duration_since(attempt_started),
                    });
                    return outcome(Ok(value), attempts, total_delay);
                }
                Err(failure) => failure,
            };

            let kind = failure.failure_kind();
            let retryable = config.is_retryable(&kind);
            let message = failure.to_string();
            self.metrics.record_failure(operation_id, &kind, &message, retryable);
            self.events.emit(&ResilienceEvent::AttemptFailed {
                operation_id: operation_id.to_string(),
                urgency,
                attempt: attempts,
                kind: kind.clone(),
                retryable,
                error: message,
            });

            if !retryable {
                // Releases a trial slot without counting against the breaker
                drop(permit);
                self.events.emit(&ResilienceEvent::NonRetryable {
                    operation_id: operation_id.to_string(),
                    urgency,
                    attempt: attempts,
                    kind: kind.clone(),
                });
                let elapsed = self.clock.now().saturating_duration_since(start);
                let result = Err(ResilienceError::NonRetryable {
                    operation_id: operation_id.to_string(),
                    kind,
                    source: failure,
                    attempts,
                    elapsed,
                });
                return outcome(result, attempts, total_delay);
            }

            let tripped = permit.record_failure().is_some_and(|transition| {
                self.record_transition(operation_id, transition);
                transition.to == CircuitState::Open
            });

            if attempts >= max_attempts {
                let elapsed = self.clock.now().saturating_duration_since(start);
                self.metrics.record_exhausted(operation_id);
                self.events.emit(&ResilienceEvent::Exhausted {
                    operation_id: operation_id.to_string(),
                    urgency,
                    attempts,
                    elapsed,
                });
                let result = Err(ResilienceError::RetryExhausted {
                    operation_id: operation_id.to_string(),
                    last_error: failure,
                    attempts,
                    elapsed,
                });
                return outcome(result, attempts, total_delay);
            }

            if tripped {
                let result = Err(ResilienceError::CircuitTripped {
                    operation_id: operation_id.to_string(),
                    last_error: failure,
                    attempts,
                    elapsed: self.clock.now().saturating_duration_since(start),
                    retry_after: breaker.config().open_timeout(),
                });
                return outcome(result, attempts, total_delay);
            }

            let delay = BackoffCalculator::compute_delay(attempts, config);
            self.events.emit(&ResilienceEvent::RetryScheduled {
                operation_id: operation_id.to_string(),
                urgency,
                attempt: attempts,
                delay,
            });

            tokio::select! {
                biased;
                reason = cancellation.fired() => {
                    let result = Err(self.cancelled(operation_id, urgency, attempts, reason));
                    return outcome(result, attempts, total_delay);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            total_delay = total_delay.saturating_add(delay);
            self.metrics.record_retry_wait(operation_id, delay);
        }
    }

    /// Report a breaker transition to metrics and events
    pub fn record_transition(&self, operation_id: &str, transition: StateTransition) {
        self.metrics.record_transition(operation_id, transition);
        self.events.emit(&ResilienceEvent::CircuitTransition {
            operation_id: operation_id.to_string(),
            from: transition.from,
            to: transition.to,
        });
    }

    fn cancelled<E>(
        &self,
        operation_id: &str,
        urgency: Option<Urgency>,
        attempts: u32,
        reason: CancelReason,
    ) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.metrics.record_cancellation(operation_id);
        self.events.emit(&ResilienceEvent::Cancelled {
            operation_id: operation_id.to_string(),
            urgency,
            attempts,
            reason,
        });
        CancelledError { operation_id: operation_id.to_string(), reason, attempts }.into()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the retry loop.
    //!
    //! Timing tests run on paused tokio time so backoff sleeps complete
    //! instantly while `SystemClock` still observes the advanced time.

    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::error::FailureKind;
    use crate::testing::{RecordingEventSink, ScriptedOperation, Step, TestError};

    struct Harness {
        executor: RetryExecutor<SystemClock>,
        events: Arc<RecordingEventSink>,
        breaker: CircuitBreaker<SystemClock>,
    }

    fn harness(failure_threshold: u32) -> Harness {
        let events = Arc::new(RecordingEventSink::new());
        let executor =
            RetryExecutor::new(Arc::new(MetricsCollector::new()), events.clone(), SystemClock);
        let breaker_config =
            CircuitBreakerConfig::builder().failure_threshold(failure_threshold).build().unwrap();
        let breaker = CircuitBreaker::new("inference", breaker_config, SystemClock);
        Harness { executor, events, breaker }
    }

    fn fixed_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .exponential_backoff(2.0)
            .no_jitter()
            .build()
            .unwrap()
    }

    impl Harness {
        async fn run(
            &self,
            config: &RetryConfig,
            cancellation: &Cancellation,
            op: &ScriptedOperation,
        ) -> RetryOutcome<u32, TestError> {
            let ctx = ExecutionContext {
                operation_id: "inference",
                urgency: None,
                config,
                breaker: &self.breaker,
                cancellation,
            };
            self.executor.execute_with_outcome(ctx, || op.call()).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_try() {
        let h = harness(5);
        let op = ScriptedOperation::new([Step::Succeed]);

        let outcome = h.run(&fixed_config(3), &Cancellation::new(), &op).await;

        assert_eq!(outcome.result.unwrap(), 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.total_delay, Duration::ZERO);
        assert!(h.events.retry_delays("inference").is_empty());
    }

    /// Validates backoff between failing attempts.
    ///
    /// Assertions:
    /// - Three attempts with waits of 100ms then 200ms.
    /// - Elapsed time on the paused clock equals the waits.
    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff() {
        let h = harness(5);
        let op = ScriptedOperation::succeed_after(2, FailureKind::Connection);

        let outcome = h.run(&fixed_config(3), &Cancellation::new(), &op).await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(300));
        assert_eq!(outcome.average_delay(), Duration::from_millis(150));
        assert!(outcome.elapsed >= Duration::from_millis(300));
        assert_eq!(
            h.events.retry_delays("inference"),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(outcome.result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let h = harness(10);
        let op = ScriptedOperation::always_failing(FailureKind::ServiceUnavailable);

        let outcome = h.run(&fixed_config(3), &Cancellation::new(), &op).await;

        match outcome.result {
            Err(ResilienceError::RetryExhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.operation_error().map(|e| e.call), Some(3));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(op.calls(), 3);
        assert_eq!(h.events.count("exhausted"), 1);
    }

    /// Validates fail-fast on non-retryable kinds.
    ///
    /// Assertions:
    /// - Exactly one invocation.
    /// - The breaker counters are untouched.
    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let h = harness(1);
        let op = ScriptedOperation::always_failing(FailureKind::Permission);

        let outcome = h.run(&fixed_config(5), &Cancellation::new(), &op).await;

        assert!(matches!(
            outcome.result,
            Err(ResilienceError::NonRetryable { kind: FailureKind::Permission, attempts: 1, .. })
        ));
        assert_eq!(op.calls(), 1);
        assert_eq!(h.breaker.state(), CircuitState::Closed);
        assert_eq!(h.breaker.snapshot().failed_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlisted_kind_is_not_retried() {
        let h = harness(5);
        let op = ScriptedOperation::always_failing(FailureKind::Other("gpu_oom".into()));

        let outcome = h.run(&fixed_config(5), &Cancellation::new(), &op).await;

        assert!(matches!(outcome.result, Err(ResilienceError::NonRetryable { .. })));
        assert_eq!(op.calls(), 1);
    }

    /// Validates the per-attempt timeout.
    ///
    /// Assertions:
    /// - A slow attempt is cut off and classified as `Timeout`.
    /// - The retry then succeeds.
    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_timeout_failure() {
        let h = harness(5);
        let config = fixed_config(2)
            .to_builder()
            .attempt_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let op = ScriptedOperation::new([Step::Slow(Duration::from_secs(10)), Step::Succeed]);

        let outcome = h.run(&config, &Cancellation::new(), &op).await;

        assert_eq!(outcome.result.unwrap(), 2);
        let failed = h.events.events().into_iter().find_map(|event| match event {
            ResilienceEvent::AttemptFailed { kind, .. } => Some(kind),
            _ => None,
        });
        assert_eq!(failed, Some(FailureKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let h = harness(5);
        let op = ScriptedOperation::new([Step::Succeed]);
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let outcome = h.run(&fixed_config(3), &cancellation, &op).await;

        assert!(matches!(
            outcome.result,
            Err(ResilienceError::Cancelled(CancelledError {
                reason: CancelReason::Cancelled,
                attempts: 0,
                ..
            }))
        ));
        assert_eq!(op.calls(), 0);
    }

    /// Validates that the deadline interrupts the backoff wait.
    ///
    /// Assertions:
    /// - Execution stops at the deadline, not at the end of the 1s wait.
    /// - The breaker sees only the one real failure.
    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_backoff() {
        let h = harness(5);
        let config = RetryConfig::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(1))
            .constant_backoff()
            .no_jitter()
            .build()
            .unwrap();
        let op = ScriptedOperation::always_failing(FailureKind::Timeout);
        let cancellation = Cancellation::new().with_timeout(Duration::from_millis(250));

        let outcome = h.run(&config, &cancellation, &op).await;

        assert!(matches!(
            outcome.result,
            Err(ResilienceError::Cancelled(CancelledError {
                reason: CancelReason::DeadlineExceeded,
                attempts: 1,
                ..
            }))
        ));
        assert_eq!(op.calls(), 1);
        assert!(outcome.elapsed < Duration::from_secs(1));
        assert_eq!(outcome.total_delay, Duration::ZERO);
        assert_eq!(h.breaker.snapshot().failed_requests, 1);
    }

    /// Validates that tripping the breaker mid-call stops the retry loop.
    ///
    /// Assertions:
    /// - Second failure opens the breaker and ends the call at once.
    /// - Only the first backoff was waited; the last failure is kept.
    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_call_stops_without_backoff() {
        let h = harness(2);
        let op = ScriptedOperation::always_failing(FailureKind::Connection);

        let outcome = h.run(&fixed_config(5), &Cancellation::new(), &op).await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.total_delay, Duration::from_millis(100));
        assert!(outcome.elapsed < Duration::from_millis(200));
        assert!(outcome.result.as_ref().is_err_and(ResilienceError::is_circuit_open));
        match &outcome.result {
            Err(ResilienceError::CircuitTripped { last_error, retry_after, .. }) => {
                assert_eq!(last_error.operation_error().map(|e| e.call), Some(2));
                assert_eq!(*retry_after, h.breaker.config().open_timeout());
            }
            other => panic!("expected CircuitTripped, got {other:?}"),
        }
        assert_eq!(op.calls(), 2);
        assert_eq!(h.breaker.snapshot().rejected_requests, 0);
        assert_eq!(
            h.events.transitions("inference"),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    /// Validates that the deadline abandons a hung attempt.
    ///
    /// Assertions:
    /// - The call returns `DeadlineExceeded` at the deadline, not at the
    ///   attempt timeout.
    /// - The abandoned attempt is not counted as a breaker failure.
    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_running_attempt() {
        let h = harness(1);
        let config = fixed_config(3).to_builder().attempt_timeout(Duration::from_secs(60)).build();
        let op = ScriptedOperation::new([Step::Slow(Duration::from_secs(3600))]);
        let cancellation = Cancellation::new().with_timeout(Duration::from_secs(1));

        let outcome = h.run(&config.unwrap(), &cancellation, &op).await;

        assert!(matches!(
            outcome.result,
            Err(ResilienceError::Cancelled(CancelledError {
                reason: CancelReason::DeadlineExceeded,
                attempts: 1,
                ..
            }))
        ));
        assert!(outcome.elapsed < Duration::from_secs(2));
        let snapshot = h.breaker.snapshot();
        assert_eq!(snapshot.failed_requests, 0);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[test]
    fn test_cancellation_check_prefers_token() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            let cancellation = Cancellation::new().with_timeout(Duration::ZERO);
            assert_eq!(cancellation.check(), Some(CancelReason::DeadlineExceeded));
            cancellation.cancel();
            assert_eq!(cancellation.check(), Some(CancelReason::Cancelled));
            assert_eq!(Cancellation::new().check(), None);
        });
    }
}
