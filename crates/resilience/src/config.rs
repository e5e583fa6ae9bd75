//! Immutable retry and circuit-breaker configuration
//!
//! Both config types are constructed through validating builders and expose
//! read-only accessors, so an invalid or unbounded configuration can never
//! reach the executor.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CRITICAL_ATTEMPT_TIMEOUT, CRITICAL_INITIAL_DELAY, CRITICAL_MAX_ATTEMPTS, CRITICAL_MAX_DELAY,
    DEFAULT_BACKOFF_BASE, DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_REQUESTS,
    DEFAULT_OPEN_TIMEOUT, DEFAULT_SUCCESS_THRESHOLD, MAX_MAX_ATTEMPTS, MIN_MAX_ATTEMPTS,
};
use crate::error::{ConfigError, ConfigResult, FailureKind};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every retry waits `initial_delay`
    Constant,
    /// Retry `n` waits `initial_delay * n`
    Linear,
    /// Retry `n` waits `initial_delay * base^(n-1)`
    #[default]
    Exponential,
}

//==============================================================================
// RetryConfig
//==============================================================================

/// Retry behavior for one call
///
/// Defaults match the critical tier (4 attempts, 500ms initial, 10s cap,
/// 15s per attempt, exponential base 2.0 with jitter).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_base: f64,
    backoff_strategy: BackoffStrategy,
    jitter_enabled: bool,
    retryable_errors: HashSet<FailureKind>,
    excluded_errors: HashSet<FailureKind>,
    attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: CRITICAL_MAX_ATTEMPTS,
            initial_delay: CRITICAL_INITIAL_DELAY,
            max_delay: CRITICAL_MAX_DELAY,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_enabled: true,
            retryable_errors: FailureKind::TRANSIENT.into_iter().collect(),
            excluded_errors: FailureKind::FATAL.into_iter().collect(),
            attempt_timeout: Some(CRITICAL_ATTEMPT_TIMEOUT),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder starting from the defaults
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Exponential base-2 tier with the default error lists
    ///
    /// Callers pass constants that satisfy `validate`.
    pub(crate) fn tier(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        jitter_enabled: bool,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            jitter_enabled,
            attempt_timeout: Some(attempt_timeout),
            ..Self::default()
        }
    }

    /// Create a builder seeded with this configuration
    pub fn to_builder(&self) -> RetryConfigBuilder {
        RetryConfigBuilder { config: self.clone() }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    pub fn backoff_strategy(&self) -> BackoffStrategy {
        self.backoff_strategy
    }

    pub fn jitter_enabled(&self) -> bool {
        self.jitter_enabled
    }

    pub fn retryable_errors(&self) -> &HashSet<FailureKind> {
        &self.retryable_errors
    }

    pub fn excluded_errors(&self) -> &HashSet<FailureKind> {
        &self.excluded_errors
    }

    /// Timeout applied to each individual attempt
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Whether a failure of this kind may be retried
    ///
    /// The deny-list wins over the allow-list; kinds in neither are not
    /// retried.
    pub fn is_retryable(&self, kind: &FailureKind) -> bool {
        !self.excluded_errors.contains(kind) && self.retryable_errors.contains(kind)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(ConfigError::invalid(
                "max_attempts",
                format!(
                    "must be between {MIN_MAX_ATTEMPTS} and {MAX_MAX_ATTEMPTS}, got {}",
                    self.max_attempts
                ),
            ));
        }

        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "initial_delay",
                format!(
                    "initial_delay ({:?}) must not exceed max_delay ({:?})",
                    self.initial_delay, self.max_delay
                ),
            ));
        }

        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_base",
                format!("must be a finite number >= 1.0, got {}", self.backoff_base),
            ));
        }

        if self.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("attempt_timeout", "must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`RetryConfig`] with fluent API
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_base(mut self, base: f64) -> Self {
        self.config.backoff_base = base;
        self
    }

    pub fn backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.config.backoff_strategy = strategy;
        self
    }

    pub fn constant_backoff(self) -> Self {
        self.backoff_strategy(BackoffStrategy::Constant)
    }

    pub fn linear_backoff(self) -> Self {
        self.backoff_strategy(BackoffStrategy::Linear)
    }

    pub fn exponential_backoff(self, base: f64) -> Self {
        self.backoff_strategy(BackoffStrategy::Exponential).backoff_base(base)
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter_enabled = enabled;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter(false)
    }

    /// Replace the allow-list
    pub fn retryable_errors<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = FailureKind>,
    {
        self.config.retryable_errors = kinds.into_iter().collect();
        self
    }

    /// Add one kind to the allow-list
    pub fn retry_on(mut self, kind: FailureKind) -> Self {
        self.config.retryable_errors.insert(kind);
        self
    }

    /// Replace the deny-list
    pub fn excluded_errors<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = FailureKind>,
    {
        self.config.excluded_errors = kinds.into_iter().collect();
        self
    }

    /// Add one kind to the deny-list
    pub fn exclude(mut self, kind: FailureKind) -> Self {
        self.config.excluded_errors.insert(kind);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(timeout);
        self
    }

    pub fn no_attempt_timeout(mut self) -> Self {
        self.config.attempt_timeout = None;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// CircuitBreakerConfig
//==============================================================================

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            half_open_max_requests: DEFAULT_HALF_OPEN_REQUESTS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder starting from the defaults
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Builder seeded with this configuration
    pub fn to_builder(&self) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: *self }
    }

    /// Consecutive classified failures that open a closed circuit
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Trial successes needed to close a half-open circuit
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Time to wait before transitioning from open to half-open
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Concurrent trials admitted while half-open
    pub fn half_open_max_requests(&self) -> u32 {
        self.half_open_max_requests
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be greater than 0"));
        }

        if self.half_open_max_requests == 0 {
            return Err(ConfigError::invalid("half_open_max_requests", "must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    pub fn half_open_max_requests(mut self, max_requests: u32) -> Self {
        self.config.half_open_max_requests = max_requests;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for configuration builders and validation.

    use super::*;

    /// Validates `RetryConfig::default` matches the critical tier.
    ///
    /// Assertions:
    /// - Attempt, delay, timeout and jitter values equal the critical tier
    ///   constants.
    /// - Transient kinds are retryable and fatal kinds are excluded.
    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();

        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.initial_delay(), Duration::from_millis(500));
        assert_eq!(config.max_delay(), Duration::from_secs(10));
        assert_eq!(config.backoff_strategy(), BackoffStrategy::Exponential);
        assert!((config.backoff_base() - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_enabled());
        assert_eq!(config.attempt_timeout(), Some(Duration::from_secs(15)));
        assert!(config.validate().is_ok());

        for kind in FailureKind::TRANSIENT {
            assert!(config.is_retryable(&kind), "{kind} should be retryable");
        }
        for kind in FailureKind::FATAL {
            assert!(!config.is_retryable(&kind), "{kind} should not be retryable");
        }
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .exponential_backoff(2.0)
            .no_jitter()
            .attempt_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.initial_delay(), Duration::from_millis(100));
        assert_eq!(config.max_delay(), Duration::from_secs(1));
        assert!(!config.jitter_enabled());
        assert_eq!(config.attempt_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_to_builder_preserves_fields() {
        let base = RetryConfig::builder().max_attempts(2).no_jitter().build().unwrap();
        let derived = base.to_builder().max_attempts(7).build().unwrap();

        assert_eq!(derived.max_attempts(), 7);
        assert!(!derived.jitter_enabled());
        assert_eq!(derived.initial_delay(), base.initial_delay());
    }

    /// Validates rejection of every out-of-range retry field.
    ///
    /// Assertions:
    /// - Each invalid builder reports the offending field name.
    #[test]
    fn test_retry_config_validation_errors() {
        let cases: Vec<(RetryConfigBuilder, &str)> = vec![
            (RetryConfig::builder().max_attempts(0), "max_attempts"),
            (RetryConfig::builder().max_attempts(101), "max_attempts"),
            (
                RetryConfig::builder()
                    .initial_delay(Duration::from_secs(5))
                    .max_delay(Duration::from_secs(1)),
                "initial_delay",
            ),
            (RetryConfig::builder().backoff_base(0.5), "backoff_base"),
            (RetryConfig::builder().backoff_base(f64::NAN), "backoff_base"),
            (RetryConfig::builder().backoff_base(f64::INFINITY), "backoff_base"),
            (RetryConfig::builder().attempt_timeout(Duration::ZERO), "attempt_timeout"),
        ];

        for (builder, expected_field) in cases {
            match builder.build() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
                Ok(config) => panic!("expected {expected_field} to be rejected: {config:?}"),
            }
        }
    }

    /// Validates that the deny-list overrides the allow-list.
    ///
    /// Assertions:
    /// - A kind on both lists is not retryable.
    /// - A kind on neither list is not retryable.
    #[test]
    fn test_excluded_errors_take_precedence() {
        let config = RetryConfig::builder()
            .retry_on(FailureKind::Validation)
            .retry_on(FailureKind::Other("gpu_oom".into()))
            .build()
            .unwrap();

        assert!(!config.is_retryable(&FailureKind::Validation));
        assert!(config.is_retryable(&FailureKind::Other("gpu_oom".into())));
        assert!(!config.is_retryable(&FailureKind::Other("unknown".into())));

        let permissive = RetryConfig::builder()
            .excluded_errors([])
            .retry_on(FailureKind::Validation)
            .build()
            .unwrap();
        assert!(permissive.is_retryable(&FailureKind::Validation));
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();

        assert_eq!(config.failure_threshold(), 5);
        assert_eq!(config.success_threshold(), 2);
        assert_eq!(config.open_timeout(), Duration::from_secs(60));
        assert_eq!(config.half_open_max_requests(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().half_open_max_requests(0).build().is_err());

        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .success_threshold(1)
            .open_timeout(Duration::from_secs(5))
            .half_open_max_requests(2)
            .build()
            .unwrap();
        assert_eq!(config.failure_threshold(), 3);
        assert_eq!(config.half_open_max_requests(), 2);
    }

    #[test]
    fn test_backoff_strategy_serde() {
        let parsed: BackoffStrategy = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(parsed, BackoffStrategy::Linear);
        assert_eq!(BackoffStrategy::default(), BackoffStrategy::Exponential);
    }
}
