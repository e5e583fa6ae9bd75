//! Inter-attempt delay calculation
//!
//! [`BackoffCalculator`] is pure and stateless. Arithmetic runs on integer
//! nanoseconds and saturates at `max_delay`; jitter multiplies the clamped
//! delay by a uniform factor in `[0.5, 1.5]` and clamps again.

use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffStrategy, RetryConfig};
use crate::constants::{JITTER_MAX_FACTOR, JITTER_MIN_FACTOR, MAX_BACKOFF_EXPONENT};

/// Computes the wait before the next attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// Delay after failed attempt `attempt` (1-based), jittered with the
    /// thread-local RNG when the config enables it
    ///
    /// The result is always within `[0, max_delay]`.
    pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
        Self::compute_delay_with_rng(attempt, config, &mut rand::thread_rng())
    }

    /// Same as [`compute_delay`](Self::compute_delay) with a caller-supplied
    /// RNG
    pub fn compute_delay_with_rng<R>(attempt: u32, config: &RetryConfig, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        let delay = Self::base_delay(attempt, config);
        if !config.jitter_enabled() || delay.is_zero() {
            return delay;
        }

        let factor = rng.gen_range(JITTER_MIN_FACTOR..=JITTER_MAX_FACTOR);
        apply_jitter(delay, factor, config.max_delay())
    }

    /// Deterministic delay before jitter, clamped to `max_delay`
    pub fn base_delay(attempt: u32, config: &RetryConfig) -> Duration {
        let attempt = attempt.max(1);
        let initial = config.initial_delay();
        let max_delay = config.max_delay();

        let raw = match config.backoff_strategy() {
            BackoffStrategy::Constant => initial,
            BackoffStrategy::Linear => initial.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
                scale(initial, config.backoff_base(), exponent, max_delay)
            }
        };

        raw.min(max_delay)
    }

    /// Un-jittered delays for every retry a config can schedule
    ///
    /// Has `max_attempts - 1` entries; the last attempt is never followed by
    /// a wait.
    pub fn schedule(config: &RetryConfig) -> Vec<Duration> {
        (1..config.max_attempts()).map(|attempt| Self::base_delay(attempt, config)).collect()
    }
}

/// `initial * base^exponent`, saturating to `ceiling`
fn scale(initial: Duration, base: f64, exponent: u32, ceiling: Duration) -> Duration {
    let Ok(exponent) = i32::try_from(exponent) else {
        return ceiling;
    };

    let factor = base.powi(exponent);
    let nanos = initial.as_nanos() as f64 * factor;
    let ceiling_nanos = ceiling.as_nanos() as f64;

    if !nanos.is_finite() || nanos >= ceiling_nanos {
        return ceiling;
    }

    // Below the ceiling, but a ceiling near Duration::MAX can still exceed u64
    match u64::try_from(nanos.round() as u128) {
        Ok(value) => Duration::from_nanos(value),
        Err(_) => ceiling,
    }
}

fn apply_jitter(delay: Duration, factor: f64, ceiling: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .map(|jittered| jittered.min(ceiling))
        .unwrap_or(ceiling)
}

#[cfg(test)]
mod tests {
    //! Unit tests for backoff arithmetic and jitter bounds.

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn exponential(initial_ms: u64, max_ms: u64, attempts: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(attempts)
            .initial_delay(Duration::from_millis(initial_ms))
            .max_delay(Duration::from_millis(max_ms))
            .exponential_backoff(2.0)
            .no_jitter()
            .build()
            .unwrap()
    }

    /// Validates exponential growth without jitter.
    ///
    /// Assertions:
    /// - Delays double from 100ms and saturate at the 1s cap.
    #[test]
    fn test_exponential_without_jitter() {
        let config = exponential(100, 1_000, 10);

        let delays: Vec<u128> =
            (1..=6).map(|n| BackoffCalculator::compute_delay(n, &config).as_millis()).collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_constant_and_linear() {
        let constant = RetryConfig::builder()
            .initial_delay(Duration::from_millis(250))
            .constant_backoff()
            .no_jitter()
            .build()
            .unwrap();
        assert_eq!(BackoffCalculator::compute_delay(1, &constant), Duration::from_millis(250));
        assert_eq!(BackoffCalculator::compute_delay(4, &constant), Duration::from_millis(250));

        let linear = RetryConfig::builder()
            .initial_delay(Duration::from_millis(300))
            .max_delay(Duration::from_secs(1))
            .linear_backoff()
            .no_jitter()
            .build()
            .unwrap();
        assert_eq!(BackoffCalculator::compute_delay(1, &linear), Duration::from_millis(300));
        assert_eq!(BackoffCalculator::compute_delay(3, &linear), Duration::from_millis(900));
        assert_eq!(BackoffCalculator::compute_delay(4, &linear), Duration::from_secs(1));
    }

    #[test]
    fn test_attempt_zero_is_treated_as_first() {
        let config = exponential(100, 1_000, 3);
        assert_eq!(BackoffCalculator::compute_delay(0, &config), Duration::from_millis(100));
    }

    /// Validates saturation for huge attempt numbers and bases.
    ///
    /// Assertions:
    /// - No overflow panic; delay equals `max_delay`.
    #[test]
    fn test_saturates_instead_of_overflowing() {
        let config = RetryConfig::builder()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(3600))
            .exponential_backoff(1_000.0)
            .no_jitter()
            .build()
            .unwrap();

        assert_eq!(BackoffCalculator::compute_delay(u32::MAX, &config), Duration::from_secs(3600));

        let huge_cap = RetryConfig::builder()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::MAX)
            .linear_backoff()
            .no_jitter()
            .build()
            .unwrap();
        assert_eq!(
            BackoffCalculator::compute_delay(u32::MAX, &huge_cap),
            Duration::from_secs(u64::from(u32::MAX))
        );
    }

    /// Validates jitter stays within `[0.5, 1.5]` of the base and under the
    /// cap.
    ///
    /// Assertions:
    /// - Every sampled delay is in range.
    /// - Samples are not all identical.
    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::builder()
            .initial_delay(Duration::from_millis(400))
            .max_delay(Duration::from_secs(10))
            .exponential_backoff(2.0)
            .jitter(true)
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let samples: Vec<Duration> = (0..200)
            .map(|_| BackoffCalculator::compute_delay_with_rng(1, &config, &mut rng))
            .collect();

        for delay in &samples {
            assert!(*delay >= Duration::from_millis(200), "{delay:?} below jitter floor");
            assert!(*delay <= Duration::from_millis(600), "{delay:?} above jitter ceiling");
        }
        assert!(samples.iter().any(|d| *d != samples[0]), "jitter should vary");
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let config = RetryConfig::builder()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(2))
            .exponential_backoff(2.0)
            .jitter(true)
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 1..=8 {
            for _ in 0..50 {
                let delay = BackoffCalculator::compute_delay_with_rng(attempt, &config, &mut rng);
                assert!(delay <= config.max_delay());
            }
        }
    }

    #[test]
    fn test_schedule_excludes_final_attempt() {
        let config = exponential(100, 2_000, 5);
        let schedule = BackoffCalculator::schedule(&config);

        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }
}
