// Constants shared by the retry and circuit-breaker configuration
use std::time::Duration;

/// Minimum allowed max_attempts value
pub const MIN_MAX_ATTEMPTS: u32 = 1;

/// Maximum allowed max_attempts value
pub const MAX_MAX_ATTEMPTS: u32 = 100;

/// Maximum exponent for exponential backoff calculation to prevent overflow
pub const MAX_BACKOFF_EXPONENT: u32 = 63;

/// Default exponential backoff base
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Lower bound of the multiplicative jitter factor
pub const JITTER_MIN_FACTOR: f64 = 0.5;

/// Upper bound of the multiplicative jitter factor
pub const JITTER_MAX_FACTOR: f64 = 1.5;

/// Emergency tier (urgency 5)
pub const EMERGENCY_MAX_ATTEMPTS: u32 = 5;
pub const EMERGENCY_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const EMERGENCY_MAX_DELAY: Duration = Duration::from_secs(2);
pub const EMERGENCY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Critical tier (urgency 3-4)
pub const CRITICAL_MAX_ATTEMPTS: u32 = 4;
pub const CRITICAL_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const CRITICAL_MAX_DELAY: Duration = Duration::from_secs(10);
pub const CRITICAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Routine tier (urgency 1-2)
pub const ROUTINE_MAX_ATTEMPTS: u32 = 3;
pub const ROUTINE_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const ROUTINE_MAX_DELAY: Duration = Duration::from_secs(30);
pub const ROUTINE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Circuit breaker: default failure threshold
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker: default success threshold for recovery
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Circuit breaker: default time spent open before probing
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Circuit breaker: default max concurrent trials in half-open state
pub const DEFAULT_HALF_OPEN_REQUESTS: u32 = 1;
