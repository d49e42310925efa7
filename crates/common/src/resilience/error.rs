//! Error types raised by the resilience guards

use std::time::{Duration, SystemTime};

use thiserror::Error;

use super::circuit_breaker::CircuitState;
use crate::error::{ErrorClassification, ErrorSeverity};

/// Simple configuration error for validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Raised when a circuit breaker refuses to run an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Circuit breaker is {state}, rejecting calls ({failure_count} failures, retry after {retry_after:?})"
)]
pub struct CircuitOpenError {
    /// State observed at rejection time (`OPEN`, or `HALF_OPEN` with all
    /// probe slots taken)
    pub state: CircuitState,
    /// Failure count at rejection time
    pub failure_count: u64,
    /// Time remaining until the breaker will admit a probe call
    pub retry_after: Duration,
    /// Wall-clock instant at which a probe call will be admitted
    pub retry_at: SystemTime,
}

/// Raised when a rate limiter denies a permit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limit exceeded: {limit} operations per {window:?}, next permit in {retry_after:?}")]
pub struct RateLimitExceeded {
    /// Configured operations per window
    pub limit: u64,
    /// Configured window length
    pub window: Duration,
    /// Time until the next permit becomes available
    pub retry_after: Duration,
}

/// Raised when the backpressure controller refuses or abandons an entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackpressureError {
    /// At capacity and the wait queue is full or disabled
    #[error(
        "Backpressure rejected entry: {in_flight}/{max_in_flight} in flight, {queued}/{queue_capacity} queued"
    )]
    Rejected { in_flight: usize, max_in_flight: usize, queued: usize, queue_capacity: usize },

    /// Waited in the queue longer than the configured queue timeout
    #[error("Backpressure queue wait exceeded {waited:?}")]
    QueueTimeout { waited: Duration },

    /// The caller cancelled while waiting in the queue
    #[error("Backpressure wait cancelled")]
    Cancelled,

    /// The controller was closed
    #[error("Backpressure controller is closed")]
    Closed,
}

/// Errors that can occur in resilience operations
///
/// Generic over the underlying operation error type `E` so the original error
/// is preserved next to the guard-specific variants.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Rate limit exceeded
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// Backpressure controller refused entry
    #[error(transparent)]
    Backpressure(#[from] BackpressureError),

    /// Operation timed out
    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether this error was produced by a guard rather than the operation.
    pub fn is_guard_rejection(&self) -> bool {
        !matches!(self, Self::OperationFailed { .. })
    }

    /// Return the operation error, if the operation itself failed.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

impl ErrorClassification for CircuitOpenError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        Some(self.retry_after)
    }
}

impl ErrorClassification for RateLimitExceeded {
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        Some(self.retry_after)
    }
}

impl ErrorClassification for BackpressureError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled => ErrorSeverity::Info,
            Self::Closed => ErrorSeverity::Error,
            Self::Rejected { .. } | Self::QueueTimeout { .. } => ErrorSeverity::Warning,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl<E> ErrorClassification for ResilienceError<E>
where
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { source } => source.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen(e) => e.severity(),
            Self::RateLimited(e) => e.severity(),
            Self::Backpressure(e) => e.severity(),
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::OperationFailed { source } => source.severity(),
        }
    }

    fn is_critical(&self) -> bool {
        match self {
            Self::OperationFailed { source } => source.is_critical(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(e) => e.retry_after(),
            Self::RateLimited(e) => e.retry_after(),
            Self::Backpressure(e) => e.retry_after(),
            Self::Timeout { .. } => None,
            Self::OperationFailed { source } => source.retry_after(),
        }
    }
}
