//! Testing utilities and helpers
//!
//! - **[`async_utils`]**: async assertions and polling helpers
//! - **[`flaky`]**: scripted failing operations for retry and breaker tests
//!
//! [`MockClock`] is re-exported so tests can drive breaker and limiter
//! timeouts without sleeping.

pub mod async_utils;
pub mod flaky;

pub use async_utils::{poll_until, timeout_ok};
pub use flaky::{FlakyError, FlakyOperation};

pub use crate::resilience::{Clock, MockClock, SystemClock};
