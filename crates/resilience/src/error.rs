//! Error taxonomy for resilient execution
//!
//! Two layers live here:
//!
//! - **Classification**: [`FailureKind`] plus the [`Classify`] trait, which
//!   callers implement on their own error types so the executor can decide
//!   between retrying and failing fast.
//! - **Outcomes**: [`ResilienceError`], the terminal error returned by the
//!   executor, wrapping the caller's error with attempt and timing context.
//!
//! ```rust,ignore
//! #[derive(Debug, thiserror::Error)]
//! enum InferenceError {
//!     #[error("model endpoint unreachable")]
//!     Unreachable,
//!     #[error("prompt rejected: {0}")]
//!     Rejected(String),
//! }
//!
//! impl Classify for InferenceError {
//!     fn failure_kind(&self) -> FailureKind {
//!         match self {
//!             Self::Unreachable => FailureKind::Connection,
//!             Self::Rejected(_) => FailureKind::Validation,
//!         }
//!     }
//! }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

//==============================================================================
// Classification
//==============================================================================

/// Category of a failed attempt
///
/// The retry policy holds an allow-list and a deny-list of kinds; a kind
/// that appears in neither is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureKind {
    /// Connection refused, reset or dropped
    Connection,
    /// The attempt (or the downstream) timed out
    Timeout,
    /// Downstream throttled the request
    RateLimited,
    /// Downstream reported itself unavailable
    ServiceUnavailable,
    /// The request itself is malformed
    Validation,
    /// Caller is not allowed to perform the operation
    Permission,
    /// Request violates a business rule of the downstream
    BusinessRule,
    /// Target resource does not exist
    NotFound,
    /// Anything else, tagged with a caller-chosen name
    Other(String),
}

impl FailureKind {
    /// Kinds retried by the default policy
    pub const TRANSIENT: [FailureKind; 4] = [
        FailureKind::Connection,
        FailureKind::Timeout,
        FailureKind::RateLimited,
        FailureKind::ServiceUnavailable,
    ];

    /// Kinds that are never retried by the default policy
    pub const FATAL: [FailureKind; 4] = [
        FailureKind::Validation,
        FailureKind::Permission,
        FailureKind::BusinessRule,
        FailureKind::NotFound,
    ];

    /// Whether this kind belongs to the network/timeout class
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::RateLimited | Self::ServiceUnavailable
        )
    }

    /// Stable snake_case label used in logs and metric labels
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::BusinessRule => "business_rule",
            Self::NotFound => "not_found",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "connection" => Self::Connection,
            "timeout" => Self::Timeout,
            "rate_limited" => Self::RateLimited,
            "service_unavailable" => Self::ServiceUnavailable,
            "validation" => Self::Validation,
            "permission" => Self::Permission,
            "business_rule" => Self::BusinessRule,
            "not_found" => Self::NotFound,
            _ => Self::Other(s.trim().to_string()),
        };
        Ok(kind)
    }
}

impl From<String> for FailureKind {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<FailureKind> for String {
    fn from(value: FailureKind) -> Self {
        value.as_str().to_string()
    }
}

/// Maps an error to the [`FailureKind`] the retry policy reasons about
///
/// Implement this on the error type returned by wrapped operations.
pub trait Classify {
    /// The category of this failure
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted => FailureKind::Connection,
            io::ErrorKind::PermissionDenied => FailureKind::Permission,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => FailureKind::Validation,
            io::ErrorKind::NotFound => FailureKind::NotFound,
            _ => FailureKind::Other("io".to_string()),
        }
    }
}

//==============================================================================
// Attempt-level failures
//==============================================================================

/// Why a single attempt failed
#[derive(Debug, Error)]
pub enum AttemptFailure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The operation returned an error
    #[error(transparent)]
    Operation(E),

    /// The operation did not finish within the per-attempt timeout
    #[error("attempt timed out after {timeout:?}")]
    TimedOut { timeout: Duration },
}

impl<E> AttemptFailure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The operation's own error, if the attempt did not time out
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::TimedOut { .. } => None,
        }
    }

    /// Consume the failure and return the operation's error
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::TimedOut { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

impl<E> Classify for AttemptFailure<E>
where
    E: std::error::Error + Classify + Send + Sync + 'static,
{
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Operation(err) => err.failure_kind(),
            Self::TimedOut { .. } => FailureKind::Timeout,
        }
    }
}

//==============================================================================
// Terminal errors
//==============================================================================

/// The circuit breaker refused the call without invoking the operation
#[derive(Debug, Clone, Error)]
#[error("circuit breaker for '{operation_id}' is open")]
pub struct CircuitOpenError {
    pub operation_id: String,
    /// Wall-clock time the breaker last entered the open state
    pub opened_at: SystemTime,
    /// Time until the breaker admits a trial; `None` when rejected in
    /// half-open because all trial slots are taken
    pub retry_after: Option<Duration>,
}

/// Why execution was abandoned by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The cancellation token fired
    Cancelled,
    /// The overall deadline passed
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Execution stopped because of caller cancellation or deadline
#[derive(Debug, Clone, Error)]
#[error("operation '{operation_id}' {reason} after {attempts} attempts")]
pub struct CancelledError {
    pub operation_id: String,
    pub reason: CancelReason,
    /// Attempts actually started before cancellation
    pub attempts: u32,
}

/// Terminal errors of resilient execution
///
/// This error type is generic over the underlying operation error type `E`,
/// preserving the original error as the `source` of the retry variants.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Every permitted attempt failed with a retryable error
    #[error("operation '{operation_id}' failed after {attempts} attempts in {elapsed:?}")]
    RetryExhausted {
        operation_id: String,
        #[source]
        last_error: AttemptFailure<E>,
        attempts: u32,
        elapsed: Duration,
    },

    /// The failure was excluded from retry; no further attempts were made
    #[error("operation '{operation_id}' failed with non-retryable {kind} error")]
    NonRetryable {
        operation_id: String,
        kind: FailureKind,
        #[source]
        source: AttemptFailure<E>,
        attempts: u32,
        elapsed: Duration,
    },

    /// A retryable failure opened the circuit breaker, so the remaining
    /// attempts were skipped
    #[error("operation '{operation_id}' opened its circuit breaker after {attempts} attempts")]
    CircuitTripped {
        operation_id: String,
        #[source]
        last_error: AttemptFailure<E>,
        attempts: u32,
        elapsed: Duration,
        /// Time until the breaker admits a trial
        retry_after: Duration,
    },

    /// The circuit breaker rejected the call
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The caller cancelled or the deadline passed
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

/// Result type for resilient execution
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Operation identifier the error belongs to
    pub fn operation_id(&self) -> &str {
        match self {
            Self::RetryExhausted { operation_id, .. }
            | Self::NonRetryable { operation_id, .. }
            | Self::CircuitTripped { operation_id, .. } => operation_id,
            Self::CircuitOpen(err) => &err.operation_id,
            Self::Cancelled(err) => &err.operation_id,
        }
    }

    /// Number of times the operation was actually invoked
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetryExhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::CircuitTripped { attempts, .. } => *attempts,
            Self::CircuitOpen(_) => 0,
            Self::Cancelled(err) => err.attempts,
        }
    }

    /// Whether the call ended because the breaker is open, either by
    /// rejecting it or by opening during it
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_) | Self::CircuitTripped { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The last failure observed from the operation, if any
    pub fn last_failure(&self) -> Option<&AttemptFailure<E>> {
        match self {
            Self::RetryExhausted { last_error, .. } | Self::CircuitTripped { last_error, .. } => {
                Some(last_error)
            }
            Self::NonRetryable { source, .. } => Some(source),
            Self::CircuitOpen(_) | Self::Cancelled(_) => None,
        }
    }

    /// Consume the error and return the operation's own error, if one was
    /// observed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::RetryExhausted { last_error, .. } | Self::CircuitTripped { last_error, .. } => {
                last_error.into_operation_error()
            }
            Self::NonRetryable { source, .. } => source.into_operation_error(),
            Self::CircuitOpen(_) | Self::Cancelled(_) => None,
        }
    }
}

//==============================================================================
// Configuration errors
//==============================================================================

/// Rejected configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream said no")]
    struct Upstream;

    impl Classify for Upstream {
        fn failure_kind(&self) -> FailureKind {
            FailureKind::ServiceUnavailable
        }
    }

    #[test]
    fn test_failure_kind_round_trips_through_strings() {
        for kind in FailureKind::TRANSIENT.iter().chain(FailureKind::FATAL.iter()) {
            let parsed: FailureKind = kind.to_string().parse().unwrap();
            assert_eq!(&parsed, kind);
        }

        assert_eq!(
            "Quota_Exceeded".parse::<FailureKind>().unwrap(),
            FailureKind::Other("Quota_Exceeded".to_string())
        );
    }

    #[test]
    fn test_failure_kind_serde_uses_plain_strings() {
        let json = serde_json::to_string(&FailureKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");

        let kinds: Vec<FailureKind> =
            serde_json::from_str(r#"["timeout", "not_found", "gpu_oom"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![FailureKind::Timeout, FailureKind::NotFound, FailureKind::Other("gpu_oom".into())]
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(FailureKind::TRANSIENT.iter().all(FailureKind::is_transient));
        assert!(!FailureKind::FATAL.iter().any(FailureKind::is_transient));
        assert!(!FailureKind::Other("io".into()).is_transient());
    }

    #[test]
    fn test_io_error_classification() {
        let cases = [
            (io::ErrorKind::TimedOut, FailureKind::Timeout),
            (io::ErrorKind::ConnectionRefused, FailureKind::Connection),
            (io::ErrorKind::ConnectionReset, FailureKind::Connection),
            (io::ErrorKind::PermissionDenied, FailureKind::Permission),
            (io::ErrorKind::InvalidInput, FailureKind::Validation),
            (io::ErrorKind::NotFound, FailureKind::NotFound),
            (io::ErrorKind::Other, FailureKind::Other("io".into())),
        ];

        for (io_kind, expected) in cases {
            assert_eq!(io::Error::from(io_kind).failure_kind(), expected, "{io_kind:?}");
        }
    }

    #[test]
    fn test_attempt_failure_classification() {
        let op: AttemptFailure<Upstream> = AttemptFailure::Operation(Upstream);
        let timed_out: AttemptFailure<Upstream> =
            AttemptFailure::TimedOut { timeout: Duration::from_millis(10) };

        assert_eq!(op.failure_kind(), FailureKind::ServiceUnavailable);
        assert_eq!(timed_out.failure_kind(), FailureKind::Timeout);
        assert!(timed_out.is_timeout());
        assert!(timed_out.operation_error().is_none());
    }

    #[test]
    fn test_retry_exhausted_preserves_source_chain() {
        let err: ResilienceError<Upstream> = ResilienceError::RetryExhausted {
            operation_id: "inference".into(),
            last_error: AttemptFailure::Operation(Upstream),
            attempts: 3,
            elapsed: Duration::from_millis(300),
        };

        assert_eq!(err.operation_id(), "inference");
        assert_eq!(err.attempts(), 3);
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(err.source().map(ToString::to_string), Some("upstream said no".to_string()));
        assert!(err.into_operation_error().is_some());
    }

    #[test]
    fn test_circuit_open_and_cancelled_accessors() {
        let open: ResilienceError<Upstream> = CircuitOpenError {
            operation_id: "fhir".into(),
            opened_at: SystemTime::UNIX_EPOCH,
            retry_after: Some(Duration::from_secs(5)),
        }
        .into();
        assert!(open.is_circuit_open());
        assert_eq!(open.attempts(), 0);
        assert!(open.last_failure().is_none());

        let tripped: ResilienceError<Upstream> = ResilienceError::CircuitTripped {
            operation_id: "fhir".into(),
            last_error: AttemptFailure::Operation(Upstream),
            attempts: 2,
            elapsed: Duration::from_millis(100),
            retry_after: Duration::from_secs(60),
        };
        assert!(tripped.is_circuit_open());
        assert_eq!(tripped.attempts(), 2);
        assert!(tripped.last_failure().is_some_and(|failure| !failure.is_timeout()));
        assert_eq!(tripped.source().map(ToString::to_string), Some("upstream said no".to_string()));

        let cancelled: ResilienceError<Upstream> = CancelledError {
            operation_id: "fhir".into(),
            reason: CancelReason::DeadlineExceeded,
            attempts: 2,
        }
        .into();
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.attempts(), 2);
        assert!(cancelled.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("max_attempts", "must be at least 1");
        assert_eq!(err.to_string(), "Invalid configuration for max_attempts: must be at least 1");
    }
}
