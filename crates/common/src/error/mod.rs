//! Error classification shared by every PubGuard crate
//!
//! Errors in PubGuard are plain `thiserror` enums owned by the module that
//! produces them. What they share is a **classification contract** so that the
//! retry layer, the orchestrator, and log sinks can make decisions without
//! knowing the concrete type:
//!
//! - **`is_retryable()`**: may the same operation succeed if attempted again?
//! - **`severity()`**: how loudly should this be reported?
//! - **`is_critical()`**: does this indicate a broken invariant?
//! - **`retry_after()`**: a suggested delay before trying again, if any
//!
//! ## Guard-layer errors
//!
//! Errors raised by a resilience guard (circuit open, rate limited,
//! backpressure rejection, caller deadline) report `is_retryable() == false`
//! even though the condition is transient. Retrying against an open circuit or
//! an exhausted rate limit inside the same call only burns the budget; the
//! hint for the *caller* is carried by `retry_after()` instead.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use pubguard_common::error::{ErrorClassification, ErrorSeverity};
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! enum BrokerError {
//!     #[error("connection reset")]
//!     Reset,
//!     #[error("topic rejected: {0}")]
//!     Rejected(String),
//! }
//!
//! impl ErrorClassification for BrokerError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, Self::Reset)
//!     }
//!
//!     fn severity(&self) -> ErrorSeverity {
//!         match self {
//!             Self::Reset => ErrorSeverity::Warning,
//!             Self::Rejected(_) => ErrorSeverity::Error,
//!         }
//!     }
//!
//!     fn is_critical(&self) -> bool {
//!         false
//!     }
//!
//!     fn retry_after(&self) -> Option<Duration> {
//!         None
//!     }
//! }
//!
//! assert!(BrokerError::Reset.is_retryable());
//! assert!(!BrokerError::Rejected("orders".into()).is_retryable());
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Boxed, thread-safe error used at dynamic boundaries (handlers, drivers).
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Standard interface for classifying errors by their characteristics
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again, such as a dropped connection or a broker that is briefly
    /// unavailable.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    ///
    /// Used for monitoring, alerting, and logging decisions.
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    fn retry_after(&self) -> Option<Duration>;
}

impl<T: ErrorClassification + ?Sized> ErrorClassification for Box<T> {
    fn is_retryable(&self) -> bool {
        (**self).is_retryable()
    }

    fn severity(&self) -> ErrorSeverity {
        (**self).severity()
    }

    fn is_critical(&self) -> bool {
        (**self).is_critical()
    }

    fn retry_after(&self) -> Option<Duration> {
        (**self).retry_after()
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Render an error and its `source()` chain as a single line.
///
/// Used by log statements that need the full cause without `{:?}` noise.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    while let Some(cause) = current {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    /// Validates `ErrorSeverity` ordering for the severity escalation scenario.
    ///
    /// Assertions:
    /// - Ensures `Info < Warning < Error < Critical`.
    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
    }

    /// Validates `ErrorSeverity` display labels.
    #[test]
    fn test_severity_display() {
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
        assert_eq!(ErrorSeverity::Critical.to_string(), "CRITICAL");
    }

    /// Validates `error_chain` behavior for the nested source scenario.
    ///
    /// Assertions:
    /// - Confirms the rendered chain joins every cause with `": "`.
    #[test]
    fn test_error_chain_includes_sources() {
        let error = Outer { inner: Inner };
        assert_eq!(error_chain(&error), "outer: inner");
    }
}
