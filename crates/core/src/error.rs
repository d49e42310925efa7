//! Error taxonomy for the pub/sub layer
//!
//! Every public operation returns [`PubSubError`]. Guard-layer kinds
//! (`CircuitOpen`, `RateLimited`, `BackpressureRejected`, `Timeout`) are never
//! retried; driver errors carry their own retryability so the retry policy
//! can classify them.

use std::time::{Duration, SystemTime};

use pubguard_common::error::{BoxedError, ErrorClassification, ErrorSeverity};
use pubguard_common::resilience::{
    BackpressureError, CircuitOpenError, CircuitState, ConfigError, RateLimitExceeded,
    ResilienceError, RetryError,
};
use pubguard_domain::DomainError;
use thiserror::Error;

use crate::delivery::DeliveryReport;

/// Errors surfaced by drivers, the registry and the service
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Driver '{driver}' not found; registered drivers: [{}]", known.join(", "))]
    DriverNotFound { driver: String, known: Vec<String> },

    #[error("Not connected: {operation} requires an active connection")]
    NotConnected { operation: &'static str },

    #[error("Circuit {state} after {failure_count} failures; retry after {retry_after:?}")]
    CircuitOpen {
        state: CircuitState,
        failure_count: u64,
        retry_after: Duration,
        retry_at: SystemTime,
    },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<PubSubError>,
    },

    #[error(transparent)]
    RateLimited(RateLimitExceeded),

    #[error(transparent)]
    BackpressureRejected(BackpressureError),

    #[error("Handler '{handler}' failed: {source}")]
    HandlerFailure {
        handler: String,
        #[source]
        source: BoxedError,
    },

    #[error("{} of {} handlers failed for message {}", .0.failures.len(), .0.handlers, .0.message_id)]
    HandlerFailures(DeliveryReport),

    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Driver '{driver}' error: {message}")]
    Driver { driver: String, message: String, retryable: bool },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Consumer '{consumer}' setup failed: {source}")]
    ConsumerSetup {
        consumer: String,
        #[source]
        source: BoxedError,
    },
}

impl PubSubError {
    /// Transient backend failure that the retry policy may repeat
    pub fn transient(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver { driver: driver.into(), message: message.into(), retryable: true }
    }

    /// Backend failure that retrying cannot fix
    pub fn permanent(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver { driver: driver.into(), message: message.into(), retryable: false }
    }

    /// Stable snake_case label for logs and metrics
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DriverNotFound { .. } => "driver_not_found",
            Self::NotConnected { .. } => "not_connected",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::RateLimited(_) => "rate_limited",
            Self::BackpressureRejected(_) => "backpressure_rejected",
            Self::HandlerFailure { .. } => "handler_failure",
            Self::HandlerFailures(_) => "handler_failures",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::InvalidOptions(_) => "invalid_options",
            Self::Driver { .. } => "driver",
            Self::Serialization(_) => "serialization",
            Self::ConsumerSetup { .. } => "consumer_setup",
        }
    }

    /// Produced by a guard rather than the backend or a handler.
    ///
    /// Guard errors never count as circuit breaker failures and are never
    /// retried.
    pub const fn is_guard_error(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimited(_)
                | Self::BackpressureRejected(_)
                | Self::Timeout { .. }
                | Self::Cancelled
                | Self::NotConnected { .. }
        )
    }
}

impl ErrorClassification for PubSubError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Driver { retryable, .. } => *retryable,
            Self::HandlerFailure { .. } | Self::HandlerFailures(_) => true,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled => ErrorSeverity::Info,
            Self::CircuitOpen { .. }
            | Self::RateLimited(_)
            | Self::BackpressureRejected(_)
            | Self::Timeout { .. }
            | Self::HandlerFailure { .. }
            | Self::HandlerFailures(_) => ErrorSeverity::Warning,
            Self::DriverNotFound { .. } | Self::Config(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::RateLimited(err) => Some(err.retry_after),
            _ => None,
        }
    }
}

impl From<CircuitOpenError> for PubSubError {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitOpen {
            state: err.state,
            failure_count: err.failure_count,
            retry_after: err.retry_after,
            retry_at: err.retry_at,
        }
    }
}

impl From<RateLimitExceeded> for PubSubError {
    fn from(err: RateLimitExceeded) -> Self {
        Self::RateLimited(err)
    }
}

impl From<BackpressureError> for PubSubError {
    fn from(err: BackpressureError) -> Self {
        match err {
            BackpressureError::Cancelled => Self::Cancelled,
            // A closed controller means the service was disconnected while
            // the caller was queued.
            BackpressureError::Closed => Self::NotConnected { operation: "backpressure" },
            other => Self::BackpressureRejected(other),
        }
    }
}

impl From<ResilienceError<Self>> for PubSubError {
    fn from(err: ResilienceError<Self>) -> Self {
        match err {
            ResilienceError::CircuitOpen(open) => open.into(),
            ResilienceError::RateLimited(limited) => limited.into(),
            ResilienceError::Backpressure(rejected) => rejected.into(),
            ResilienceError::Timeout { timeout } => Self::Timeout { timeout },
            ResilienceError::OperationFailed { source } => source,
        }
    }
}

impl From<RetryError<Self>> for PubSubError {
    fn from(err: RetryError<Self>) -> Self {
        match err {
            RetryError::AttemptsExhausted { attempts, last_error } => {
                Self::RetriesExhausted { attempts, last_error: Box::new(last_error) }
            }
            // Terminal errors propagate unchanged.
            RetryError::NonRetryable { source, .. } => source,
            RetryError::Cancelled { .. } => Self::Cancelled,
            RetryError::TimeoutExceeded { attempts, last_error: Some(last_error), .. } => {
                Self::RetriesExhausted { attempts, last_error: Box::new(last_error) }
            }
            RetryError::TimeoutExceeded { elapsed, last_error: None, .. } => {
                Self::Timeout { timeout: elapsed }
            }
        }
    }
}

impl From<ConfigError> for PubSubError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<DomainError> for PubSubError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTopic(msg) => Self::InvalidOptions(msg),
            DomainError::Serialization(msg) => Self::Serialization(msg),
            DomainError::InvalidConfig(msg) => Self::Config(msg),
        }
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for pub/sub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_not_found_lists_known_ids() {
        let err = PubSubError::DriverNotFound {
            driver: "unknown-x".into(),
            known: vec!["kafka".into(), "memory".into()],
        };
        let message = err.to_string();
        assert!(message.contains("unknown-x"));
        assert!(message.contains("kafka"));
        assert!(message.contains("memory"));
        assert_eq!(err.kind(), "driver_not_found");
    }

    #[test]
    fn test_guard_errors_not_retryable() {
        let guard_errors = [
            PubSubError::from(RateLimitExceeded {
                limit: 1,
                window: Duration::from_secs(1),
                retry_after: Duration::from_millis(10),
            }),
            PubSubError::Timeout { timeout: Duration::from_secs(1) },
            PubSubError::BackpressureRejected(BackpressureError::QueueTimeout {
                waited: Duration::from_millis(5),
            }),
        ];
        for err in guard_errors {
            assert!(err.is_guard_error(), "{} should be a guard error", err.kind());
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_driver_retryability() {
        assert!(PubSubError::transient("redis", "connection reset").is_retryable());
        assert!(!PubSubError::permanent("redis", "NOAUTH").is_retryable());
        assert!(!PubSubError::transient("redis", "x").is_guard_error());
    }

    #[test]
    fn test_backpressure_mapping() {
        assert!(matches!(PubSubError::from(BackpressureError::Cancelled), PubSubError::Cancelled));
        assert!(matches!(
            PubSubError::from(BackpressureError::Closed),
            PubSubError::NotConnected { .. }
        ));
    }

    #[test]
    fn test_retry_error_mapping() {
        let exhausted: PubSubError = RetryError::AttemptsExhausted {
            attempts: 3,
            last_error: PubSubError::transient("kafka", "broker down"),
        }
        .into();
        match exhausted {
            PubSubError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.kind(), "driver");
            }
            other => panic!("unexpected {other:?}"),
        }

        let terminal: PubSubError = RetryError::NonRetryable {
            attempts: 1,
            source: PubSubError::permanent("kafka", "topic authorization failed"),
        }
        .into();
        assert_eq!(terminal.kind(), "driver");
    }
}
