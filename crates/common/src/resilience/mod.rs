//! Resilience primitives for guarding calls to unreliable backends
//!
//! This module provides **generic, reusable** guards:
//! - **Circuit Breaker**: stops calling a dependency that keeps failing
//! - **Retry**: repeats transient failures with backoff and jitter
//! - **Rate Limiter**: bounds operations per time window
//! - **Backpressure**: bounds in-flight work with an optional FIFO queue
//!
//! The primitives are generic over the operation's error type and read time
//! through [`Clock`] so tests can use [`MockClock`]. They do not know about
//! each other; `pubguard-core` composes them in a fixed order.
//!
//! ## Composing breaker and retry
//!
//! When both guard the same operation, the breaker wraps the *whole* retry
//! sequence. An operation that fails twice and then succeeds is one breaker
//! success; an exhausted retry sequence is one breaker failure.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use pubguard_common::resilience::{
//!     policies::AlwaysRetry, CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryExecutor,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::builder().failure_threshold(5).build()?)?;
//! let retry = RetryExecutor::new(
//!     RetryConfig::builder().max_attempts(3).fixed_backoff(Duration::from_millis(10)).build()?,
//!     AlwaysRetry,
//! );
//!
//! let value = breaker
//!     .execute(|| async { retry.execute(|| async { Ok::<_, std::io::Error>(7) }).await })
//!     .await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod rate_limiter;
pub mod retry;

pub use backpressure::{
    BackpressureConfig, BackpressureConfigBuilder, BackpressureController, BackpressureLoad,
    BackpressureToken,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilderWithClock, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, StateChangeListener,
    StateTransition, TransitionReason,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{
    BackpressureError, CircuitOpenError, ConfigError, ConfigResult, RateLimitExceeded,
    ResilienceError, ResilienceResult,
};
pub use rate_limiter::{
    FixedWindowLimiter, RateLimitConfig, RateLimiter, TokenBucket, TokenBucketConfig,
    TokenBucketConfigBuilder,
};
pub use retry::{
    policies, retry, retry_with_policy, BackoffStrategy, Jitter, RetryConfig, RetryConfigBuilder,
    RetryDecision, RetryError, RetryExecutor, RetryOutcome, RetryPolicy, RetryResult,
};
