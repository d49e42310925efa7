//! Scripted failing operations for exercising retry and breaker behavior

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{ErrorClassification, ErrorSeverity};

/// Error produced by [`FlakyOperation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakyError {
    pub call: u32,
    pub retryable: bool,
}

impl fmt::Display for FlakyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scripted failure on call {}", self.call)
    }
}

impl std::error::Error for FlakyError {}

impl ErrorClassification for FlakyError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Fails a fixed number of times, then succeeds with the call number
///
/// `FlakyOperation::always_failing()` never succeeds.
#[derive(Debug)]
pub struct FlakyOperation {
    failures_before_success: u32,
    retryable: bool,
    calls: AtomicU32,
}

impl FlakyOperation {
    pub fn new(failures_before_success: u32) -> Self {
        Self { failures_before_success, retryable: true, calls: AtomicU32::new(0) }
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    /// Make the scripted failures non-retryable
    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Invoke the operation once
    pub async fn call(&self) -> Result<u32, FlakyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.failures_before_success {
            Ok(call)
        } else {
            Err(FlakyError { call, retryable: self.retryable })
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}
