//! Shared building blocks for the PubGuard crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error classification
//! - `runtime`: async resilience primitives (circuit breaker, retry, rate
//!   limiting, backpressure) and testing helpers
//! - `observability`: tracing (pulled in by `runtime`)
//! - `test-utils`: testing helpers for downstream crates' tests

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{error_chain, BoxedError, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    BackpressureController, BackpressureError, CircuitBreaker, CircuitBreakerConfig,
    CircuitOpenError, CircuitState, Clock, ConfigError, FixedWindowLimiter, Jitter, MockClock,
    RateLimitExceeded, RateLimiter, ResilienceError, RetryConfig, RetryError, RetryExecutor,
    RetryPolicy, SystemClock,
};
