//! Per-operation circuit breaker
//!
//! The breaker guards whether an attempt may proceed. All state lives behind
//! a single `parking_lot::Mutex`, so reading the phase, bumping a counter and
//! applying the resulting transition happen as one unit.
//!
//! Admission hands out a [`CallPermit`]. The caller reports the attempt's
//! outcome by consuming the permit with [`CallPermit::record_success`] or
//! [`CallPermit::record_failure`]. Dropping the permit instead (cancellation,
//! a non-retryable error, a dropped future) releases any half-open trial slot
//! and leaves the failure and success counters untouched.
//!
//! Every transition bumps a generation counter. An outcome reported under an
//! older generation is counted in the request totals but cannot move the
//! state machine.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::CircuitOpenError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// A phase change applied by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time copy of a breaker's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_inflight: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub transitions: u64,
    /// Wall-clock time of the most recent transition into Open
    pub opened_at: Option<SystemTime>,
    #[serde(with = "crate::utils::serde::duration_millis")]
    pub time_in_state: Duration,
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_inflight: u32,
    last_transition: Instant,
    opened_at: Option<SystemTime>,
    generation: u64,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    transitions: u64,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            phase: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_inflight: 0,
            last_transition: now,
            opened_at: None,
            generation: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            transitions: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant, wall: SystemTime) -> StateTransition {
        let from = self.phase;
        self.phase = to;
        self.last_transition = now;
        self.generation = self.generation.wrapping_add(1);
        self.transitions = self.transitions.saturating_add(1);

        match to {
            CircuitState::Open => {
                self.consecutive_successes = 0;
                self.half_open_inflight = 0;
                self.opened_at = Some(wall);
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.half_open_inflight = 0;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.half_open_inflight = 0;
            }
        }

        StateTransition { from, to }
    }
}

/// Per-operation circuit breaker
///
/// Supports any [`Clock`] for deterministic testing.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &state.phase)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("consecutive_successes", &state.consecutive_successes)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock
    pub fn with_system_clock(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::new(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker in the closed state
    ///
    /// `config` is already validated by its builder.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: C) -> Self {
        let now = clock.now();
        Self { name: name.into(), config, state: Mutex::new(BreakerState::new(now)), clock }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current phase as stored
    ///
    /// An open breaker whose timeout has elapsed still reports `Open` until
    /// the next admission attempt moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.state.lock().phase
    }

    /// Ask to run one attempt
    ///
    /// Closed admits. Open rejects until `open_timeout` has elapsed since it
    /// opened, after which this call moves the breaker to half-open and is
    /// admitted as a trial. Half-open admits up to `half_open_max_requests`
    /// concurrent trials.
    pub fn try_acquire(&self) -> Result<CallPermit<'_, C>, CircuitOpenError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut admission_transition = None;

        if state.phase == CircuitState::Open {
            let open_for = now.saturating_duration_since(state.last_transition);
            if open_for < self.config.open_timeout() {
                state.rejected_requests = state.rejected_requests.saturating_add(1);
                return Err(self.rejection(&state, Some(self.config.open_timeout() - open_for)));
            }

            let transition =
                state.transition(CircuitState::HalfOpen, now, self.clock.system_time());
            debug!(breaker = %self.name, "Circuit breaker half-open, admitting trials");
            admission_transition = Some(transition);
        }

        let trial = state.phase == CircuitState::HalfOpen;
        if trial {
            if state.half_open_inflight >= self.config.half_open_max_requests() {
                state.rejected_requests = state.rejected_requests.saturating_add(1);
                return Err(self.rejection(&state, None));
            }
            state.half_open_inflight += 1;
        }

        state.total_requests = state.total_requests.saturating_add(1);

        Ok(CallPermit {
            breaker: self,
            generation: state.generation,
            trial,
            transition: admission_transition,
            settled: false,
        })
    }

    /// Administrative override back to closed
    ///
    /// Clears the consecutive counters and in-flight trial accounting while
    /// keeping request totals. Outcomes of calls admitted before the reset
    /// are ignored. Returns the transition if the breaker was not already
    /// closed.
    pub fn reset(&self) -> Option<StateTransition> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.phase == CircuitState::Closed {
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            state.half_open_inflight = 0;
            state.generation = state.generation.wrapping_add(1);
            return None;
        }

        let transition = state.transition(CircuitState::Closed, now, self.clock.system_time());
        debug!(breaker = %self.name, from = %transition.from, "Circuit breaker reset");
        Some(transition)
    }

    /// Deep copy of the breaker's state
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let state = self.state.lock();

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: state.phase,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            half_open_inflight: state.half_open_inflight,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            transitions: state.transitions,
            opened_at: state.opened_at,
            time_in_state: now.saturating_duration_since(state.last_transition),
        }
    }

    fn rejection(&self, state: &BreakerState, retry_after: Option<Duration>) -> CircuitOpenError {
        CircuitOpenError {
            operation_id: self.name.clone(),
            opened_at: state.opened_at.unwrap_or_else(|| self.clock.system_time()),
            retry_after,
        }
    }

    fn on_success(&self, generation: u64, trial: bool) -> Option<StateTransition> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.successful_requests = state.successful_requests.saturating_add(1);

        if state.generation != generation {
            return None;
        }

        match state.phase {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                if trial {
                    state.half_open_inflight = state.half_open_inflight.saturating_sub(1);
                }
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold() {
                    let transition =
                        state.transition(CircuitState::Closed, now, self.clock.system_time());
                    debug!(breaker = %self.name, "Circuit breaker closed after successful trials");
                    Some(transition)
                } else {
                    None
                }
            }
            // An Open phase always carries a newer generation than any permit
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self, generation: u64, trial: bool) -> Option<StateTransition> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.failed_requests = state.failed_requests.saturating_add(1);

        if state.generation != generation {
            return None;
        }

        match state.phase {
            CircuitState::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.config.failure_threshold() {
                    let failures = state.consecutive_failures;
                    let transition =
                        state.transition(CircuitState::Open, now, self.clock.system_time());
                    debug!(breaker = %self.name, failures, "Circuit breaker opened");
                    Some(transition)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if trial {
                    state.half_open_inflight = state.half_open_inflight.saturating_sub(1);
                }
                let transition =
                    state.transition(CircuitState::Open, now, self.clock.system_time());
                debug!(breaker = %self.name, "Circuit breaker re-opened by failed trial");
                Some(transition)
            }
            CircuitState::Open => None,
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.phase == CircuitState::HalfOpen {
            state.half_open_inflight = state.half_open_inflight.saturating_sub(1);
        }
    }
}

/// Admission to run one attempt through a [`CircuitBreaker`]
///
/// Consume with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure); dropping it unconsumed only
/// frees the trial slot.
#[must_use = "report the attempt outcome or drop the permit to release it"]
pub struct CallPermit<'a, C: Clock = SystemClock> {
    breaker: &'a CircuitBreaker<C>,
    generation: u64,
    trial: bool,
    transition: Option<StateTransition>,
    settled: bool,
}

impl<C: Clock> fmt::Debug for CallPermit<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.name)
            .field("generation", &self.generation)
            .field("trial", &self.trial)
            .finish()
    }
}

impl<C: Clock> CallPermit<'_, C> {
    /// Whether this permit occupies a half-open trial slot
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The Open to HalfOpen transition performed while admitting this call
    pub fn transition(&self) -> Option<StateTransition> {
        self.transition
    }

    /// Report a successful attempt
    pub fn record_success(mut self) -> Option<StateTransition> {
        self.settled = true;
        self.breaker.on_success(self.generation, self.trial)
    }

    /// Report a classified (retryable) failure
    pub fn record_failure(mut self) -> Option<StateTransition> {
        self.settled = true;
        self.breaker.on_failure(self.generation, self.trial)
    }
}

impl<C: Clock> Drop for CallPermit<'_, C> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release(self.generation);
        }
    }
}
