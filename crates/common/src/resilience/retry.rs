//! Retry execution with configurable backoff, jitter, and error
//! classification
//!
//! A [`RetryExecutor`] drives repeated attempts of an operation until it
//! succeeds, the attempt budget is exhausted, the [`RetryPolicy`] classifies an
//! error as terminal, the optional total-time budget runs out, or the caller
//! cancels. The error is classified *before* exhaustion is checked, so a
//! terminal error on the last attempt is still reported as non-retryable.
//!
//! Delays for the `k`-th retry (0-based) are computed as:
//!
//! | Strategy | Delay |
//! |----------|-------|
//! | Fixed | `delay` |
//! | Linear | `initial_delay + increment * k` |
//! | Exponential | `min(initial_delay * factor^k, max_delay)` |
//! | Custom | `f(k)` |
//!
//! and then passed through [`Jitter`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::error::{ConfigError, ConfigResult};

/// Errors that can occur during retry operations
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All retry attempts have been exhausted
    #[error("All retry attempts exhausted after {attempts} tries: {last_error}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },

    /// The operation failed with a non-retryable error
    #[error("Operation failed with non-retryable error: {source}")]
    NonRetryable {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The caller cancelled between attempts
    #[error("Retry cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last_error: Option<E> },

    /// The total time budget would be exceeded by the next backoff
    #[error("Retry timeout exceeded after {elapsed:?} ({attempts} attempts)")]
    TimeoutExceeded { elapsed: Duration, attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::AttemptsExhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::Cancelled { attempts, .. }
            | Self::TimeoutExceeded { attempts, .. } => *attempts,
        }
    }

    /// The last error returned by the operation, if any attempt ran
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::AttemptsExhausted { last_error, .. } => Some(last_error),
            Self::NonRetryable { source, .. } => Some(source),
            Self::Cancelled { last_error, .. } | Self::TimeoutExceeded { last_error, .. } => {
                last_error
            }
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    pub attempts: u32,
    /// Backoff delays actually slept, in order
    pub delays: Vec<Duration>,
    pub started_at: Instant,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Sum of all backoff delays
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    /// Get the total elapsed time from first attempt to completion.
    pub fn total_elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

//==============================================================================
// Policies and Strategies
//==============================================================================

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide what to do after `attempts_made` attempts ended with `error`
    fn should_retry(&self, error: &E, attempts_made: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation with the configured backoff delay
    Retry,
    /// Retry the operation with a custom delay (jitter is not applied)
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Backoff strategy for calculating retry delays
#[derive(Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Linear backoff: initial_delay + (attempt * increment)
    Linear { initial_delay: Duration, increment: Duration },
    /// Exponential backoff: initial_delay * factor^attempt, capped at max_delay
    Exponential { initial_delay: Duration, factor: f64, max_delay: Duration },
    /// Caller-supplied function of the 0-based retry index
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Linear { initial_delay, increment } => f
                .debug_struct("Linear")
                .field("initial_delay", initial_delay)
                .field("increment", increment)
                .finish(),
            Self::Exponential { initial_delay, factor, max_delay } => f
                .debug_struct("Exponential")
                .field("initial_delay", initial_delay)
                .field("factor", factor)
                .field("max_delay", max_delay)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay before the `attempt`-th retry (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { initial_delay, increment } => {
                initial_delay.saturating_add(increment.saturating_mul(attempt))
            }
            BackoffStrategy::Exponential { initial_delay, factor, max_delay } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = initial_delay.as_secs_f64() * factor.powi(exponent);
                let capped = secs.min(max_delay.as_secs_f64());
                Duration::try_from_secs_f64(capped).unwrap_or(*max_delay)
            }
            BackoffStrategy::Custom(f) => f(attempt),
        }
    }
}

/// Jitter applied to the computed backoff delay `d`
///
/// | Variant | Range |
/// |---------|-------|
/// | `None` | exactly `d` |
/// | `Full` | uniform in `[0, d]` |
/// | `Equal` | uniform in `[d/2, d]` |
/// | `Centered` | uniform in `[d/2, 3d/2]` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
    Centered,
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply(self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => delay.mul_f64(rng.gen_range(0.0..=1.0)),
            Jitter::Equal => delay.mul_f64(rng.gen_range(0.5..=1.0)),
            Jitter::Centered => delay.mul_f64(rng.gen_range(0.5..=1.5)),
        }
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Jitter type for randomizing delays
    pub jitter: Jitter,
    /// Maximum total time to spend retrying
    pub max_total_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial_delay: Duration::from_millis(100),
                factor: 2.0,
                max_delay: Duration::from_secs(30),
            },
            jitter: Jitter::None,
            max_total_time: None,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }

        if let BackoffStrategy::Exponential { factor, initial_delay, max_delay } = &self.backoff {
            if !factor.is_finite() || *factor <= 0.0 {
                return Err(ConfigError::invalid("exponential factor must be greater than 0"));
            }
            if initial_delay > max_delay {
                return Err(ConfigError::invalid("initial_delay must not exceed max_delay"));
            }
        }

        Ok(())
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Fixed(delay);
        self
    }

    pub fn linear_backoff(mut self, initial_delay: Duration, increment: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Linear { initial_delay, increment };
        self
    }

    pub fn exponential_backoff(
        mut self,
        initial_delay: Duration,
        factor: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.backoff = BackoffStrategy::Exponential { initial_delay, factor, max_delay };
        self
    }

    pub fn custom_backoff<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.config.backoff = BackoffStrategy::Custom(Arc::new(f));
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter(Jitter::None)
    }

    pub fn full_jitter(self) -> Self {
        self.jitter(Jitter::Full)
    }

    pub fn equal_jitter(self) -> Self {
        self.jitter(Jitter::Equal)
    }

    pub fn centered_jitter(self) -> Self {
        self.jitter(Jitter::Centered)
    }

    pub fn max_total_time(mut self, duration: Duration) -> Self {
        self.config.max_total_time = Some(duration);
        self
    }

    pub fn unlimited_time(mut self) -> Self {
        self.config.max_total_time = None;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Executor
//==============================================================================

/// The main retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy }
    }

    /// Create with default configuration
    pub fn with_policy(policy: P) -> Self {
        Self::new(RetryConfig::default(), policy)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(None, operation).await.into_result()
    }

    /// Execute with retry logic, stopping when `cancel` fires
    ///
    /// A pending backoff sleep is interrupted immediately; an attempt that is
    /// already running is allowed to finish but no further attempt starts.
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(Some(cancel), operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(None, operation).await
    }

    #[instrument(skip(self, cancel, operation), fields(max_attempts = self.config.max_attempts))]
    async fn run<F, Fut, T, E>(
        &self,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started_at = Instant::now();
        let mut delays = Vec::new();
        let mut attempts = 0u32;
        let mut last_error: Option<E> = None;

        let result = loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                break Err(RetryError::Cancelled { attempts, last_error });
            }

            attempts += 1;
            debug!(attempt = attempts, "retry_attempt_started");

            let error = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "retry_succeeded_after_failures");
                    }
                    break Ok(value);
                }
                Err(error) => error,
            };

            let delay = match self.policy.should_retry(&error, attempts) {
                RetryDecision::Stop => {
                    debug!(attempt = attempts, error = ?error, "retry_stopped_non_retryable");
                    break Err(RetryError::NonRetryable { attempts, source: error });
                }
                RetryDecision::Retry => {
                    let base = self.config.backoff.calculate_delay(attempts - 1);
                    self.config.jitter.apply(base)
                }
                RetryDecision::RetryAfter(delay) => delay,
            };

            if attempts >= self.config.max_attempts {
                warn!(attempts, error = ?error, "retry_attempts_exhausted");
                break Err(RetryError::AttemptsExhausted { attempts, last_error: error });
            }

            if let Some(budget) = self.config.max_total_time {
                let elapsed = started_at.elapsed();
                if elapsed + delay > budget {
                    warn!(attempts, elapsed_ms = elapsed.as_millis() as u64, "retry_budget_exceeded");
                    break Err(RetryError::TimeoutExceeded {
                        elapsed,
                        attempts,
                        last_error: Some(error),
                    });
                }
            }

            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = ?error,
                "retry_scheduled"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!(attempts, "retry_cancelled_during_backoff");
                            break Err(RetryError::Cancelled { attempts, last_error: Some(error) });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            delays.push(delay);
            last_error = Some(error);
        };

        RetryOutcome { result, attempts, delays, started_at }
    }
}

/// Convenience function to create a retry executor and execute an operation
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    RetryExecutor::new(config, policy).execute(operation).await
}

/// Convenience function to retry with default configuration
pub async fn retry<F, Fut, T, E, P>(policy: P, operation: F) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    retry_with_policy(RetryConfig::default(), policy, operation).await
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use std::time::Duration;

    use super::{RetryDecision, RetryPolicy};
    use crate::error::ErrorClassification;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempts_made: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - never retries
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempts_made: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempts_made: u32) -> RetryDecision {
            if (self.predicate)(error, attempts_made) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }

    /// Delay chosen by a caller-supplied function of `(attempts_made, error)`
    ///
    /// Returning `None` stops retrying.
    #[derive(Debug, Clone)]
    pub struct CustomDelay<F> {
        delay: F,
    }

    impl<F> CustomDelay<F> {
        pub fn new(delay: F) -> Self {
            Self { delay }
        }
    }

    impl<F, E> RetryPolicy<E> for CustomDelay<F>
    where
        F: Fn(u32, &E) -> Option<Duration>,
    {
        fn should_retry(&self, error: &E, attempts_made: u32) -> RetryDecision {
            match (self.delay)(attempts_made, error) {
                Some(delay) => RetryDecision::RetryAfter(delay),
                None => RetryDecision::Stop,
            }
        }
    }

    /// Retries errors that classify themselves as retryable
    ///
    /// Honors `retry_after()` hints when the error provides one.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ClassifiedRetry;

    impl<E: ErrorClassification> RetryPolicy<E> for ClassifiedRetry {
        fn should_retry(&self, error: &E, _attempts_made: u32) -> RetryDecision {
            if !error.is_retryable() {
                return RetryDecision::Stop;
            }
            match error.retry_after() {
                Some(delay) => RetryDecision::RetryAfter(delay),
                None => RetryDecision::Retry,
            }
        }
    }
}
