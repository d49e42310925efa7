//! Resilience guard assembly
//!
//! Turns [`ResilienceSettings`] into the primitives from
//! `pubguard_common::resilience` and runs operations through them in a fixed
//! order:
//!
//! ```text
//! rate limit -> circuit breaker -> retry -> backpressure -> operation
//! ```
//!
//! The breaker wraps the whole retry sequence, so an operation that succeeds
//! after transient failures never counts against it, and one exhausted
//! sequence counts as a single failure. Guard errors are excluded from the
//! breaker's failure count.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pubguard_common::resilience::{
    policies::ClassifiedRetry, BackpressureConfig, BackpressureController, BackpressureLoad,
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, FixedWindowLimiter,
    RateLimitConfig, RateLimiter, RetryConfig, RetryExecutor, TokenBucket, TokenBucketConfig,
};
use pubguard_domain::{
    BackoffKind, BackpressureSettings, CircuitBreakerSettings, DeliveryResilience,
    RateLimitAlgorithm, RateLimitMode, RateLimitSettings, ResilienceSettings, RetrySettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PubSubError, Result};

const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Build a breaker configuration from settings
pub fn circuit_breaker_config(settings: &CircuitBreakerSettings) -> Result<CircuitBreakerConfig> {
    let mut builder = CircuitBreakerConfig::builder()
        .failure_threshold(settings.failure_threshold)
        .success_threshold(settings.success_threshold)
        .reset_timeout(millis(settings.reset_timeout_ms))
        .half_open_max_calls(settings.half_open_max_calls);
    if let Some(window) = settings.window_time_ms {
        builder = builder.failure_window(millis(window));
    }
    Ok(builder.build()?)
}

/// Build a retry configuration from settings
///
/// `jitter = true` selects full jitter, uniform in `[0, delay]`.
pub fn retry_config(settings: &RetrySettings) -> Result<RetryConfig> {
    let base = millis(settings.base_delay_ms);
    let builder = RetryConfig::builder().max_attempts(settings.max_attempts);
    let builder = match settings.strategy {
        BackoffKind::Exponential => {
            builder.exponential_backoff(base, settings.factor, millis(settings.max_delay_ms))
        }
        BackoffKind::Linear => {
            let increment = settings.increment_ms.unwrap_or(settings.base_delay_ms);
            builder.linear_backoff(base, millis(increment))
        }
        BackoffKind::Fixed => builder.fixed_backoff(base),
    };
    let builder = if settings.jitter { builder.full_jitter() } else { builder.no_jitter() };
    let builder = match settings.max_total_time_ms {
        Some(budget) => builder.max_total_time(millis(budget)),
        None => builder.unlimited_time(),
    };
    Ok(builder.build()?)
}

/// Build the configured rate limiting algorithm
pub fn rate_limiter(settings: &RateLimitSettings) -> Result<Arc<dyn RateLimiter>> {
    let window = millis(settings.duration_ms);
    Ok(match settings.algorithm {
        RateLimitAlgorithm::FixedWindow => {
            Arc::new(FixedWindowLimiter::new(RateLimitConfig::new(settings.limit, window)?))
        }
        RateLimitAlgorithm::TokenBucket => {
            let config = TokenBucketConfig::builder()
                .capacity(settings.limit)
                .refill_amount(settings.limit)
                .refill_interval(window)
                .build()?;
            Arc::new(TokenBucket::new(config)?)
        }
    })
}

/// Build a backpressure configuration from settings
pub fn backpressure_config(settings: &BackpressureSettings) -> Result<BackpressureConfig> {
    let mut builder = BackpressureConfig::builder()
        .max_in_flight(settings.max_in_flight)
        .queue_capacity(settings.queue_capacity);
    if let Some(timeout) = settings.queue_timeout_ms {
        builder = builder.queue_timeout(millis(timeout));
    }
    Ok(builder.build()?)
}

/// Value produced by a guarded operation plus how many attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Point-in-time view of one guard set
#[derive(Debug, Clone)]
pub struct GuardSnapshot {
    pub circuit: Option<CircuitBreakerMetrics>,
    pub rate_limit_available: Option<u64>,
    pub backpressure: Option<BackpressureLoad>,
}

/// One instance of each enabled guard, shared by every caller of a path
#[derive(Debug, Clone)]
pub struct GuardSet {
    name: Arc<str>,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryExecutor<ClassifiedRetry>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    rate_mode: RateLimitMode,
    backpressure: Option<BackpressureController>,
}

impl GuardSet {
    /// Build the guards enabled in `settings`
    ///
    /// # Errors
    /// `PubSubError::Config` when any enabled guard has invalid knobs.
    pub fn from_settings(name: &str, settings: &ResilienceSettings) -> Result<Self> {
        let breaker = if settings.circuit_breaker.enabled {
            let config = circuit_breaker_config(&settings.circuit_breaker)?;
            Some(CircuitBreaker::new(config)?.with_name(name))
        } else {
            None
        };
        let retry = if settings.retry.enabled {
            Some(RetryExecutor::new(retry_config(&settings.retry)?, ClassifiedRetry))
        } else {
            None
        };
        let limiter = if settings.rate_limit.enabled {
            Some(rate_limiter(&settings.rate_limit)?)
        } else {
            None
        };
        let backpressure = if settings.backpressure.enabled {
            Some(BackpressureController::new(backpressure_config(&settings.backpressure)?))
        } else {
            None
        };

        debug!(
            guards = name,
            circuit_breaker = breaker.is_some(),
            retry = retry.is_some(),
            rate_limit = limiter.is_some(),
            backpressure = backpressure.is_some(),
            "guard_set_built"
        );

        Ok(Self {
            name: Arc::from(name),
            breaker,
            retry,
            limiter,
            rate_mode: settings.rate_limit.mode,
            backpressure,
        })
    }

    /// A guard set that runs operations directly
    pub fn passthrough(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            breaker: None,
            retry: None,
            limiter: None,
            rate_mode: RateLimitMode::Reject,
            backpressure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn backpressure(&self) -> Option<&BackpressureController> {
        self.backpressure.as_ref()
    }

    /// Run `operation` through the guards selected by `enabled`
    ///
    /// `operation` is invoked once per attempt. Cancelling `cancel` aborts
    /// waits and the running attempt; any backpressure slot held is released
    /// on every exit path.
    pub async fn run<T, F, Fut>(
        &self,
        enabled: DeliveryResilience,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<Attempted<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if enabled.rate_limit {
            if let Some(limiter) = &self.limiter {
                self.acquire_permit(limiter.as_ref(), cancel).await?;
            }
        }

        let attempts = AtomicU32::new(0);
        let attempt = || {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.attempt(enabled.backpressure, cancel, &operation)
        };
        let sequence = || async {
            match &self.retry {
                Some(retry) if enabled.retry => {
                    retry.execute_cancellable(cancel, &attempt).await.map_err(PubSubError::from)
                }
                _ => attempt().await,
            }
        };

        let value = match &self.breaker {
            Some(breaker) if enabled.circuit_breaker => breaker
                .execute_with(sequence, |err: &PubSubError| !err.is_guard_error())
                .await
                .map_err(PubSubError::from)?,
            _ => sequence().await?,
        };

        Ok(Attempted { value, attempts: attempts.load(Ordering::Relaxed) })
    }

    async fn acquire_permit(
        &self,
        limiter: &dyn RateLimiter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.rate_mode {
            RateLimitMode::Reject => Ok(limiter.try_acquire()?),
            RateLimitMode::Wait => match limiter.acquire(cancel).await {
                Ok(()) => Ok(()),
                Err(_) if cancel.is_cancelled() => Err(PubSubError::Cancelled),
                Err(denied) => Err(denied.into()),
            },
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        use_backpressure: bool,
        cancel: &CancellationToken,
        operation: &F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = match &self.backpressure {
            Some(controller) if use_backpressure => Some(controller.enter(cancel).await?),
            _ => None,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PubSubError::Cancelled),
            result = operation() => result,
        }
    }

    /// Stop admitting work: queued waiters are rejected, the breaker and
    /// limiter return to their initial state.
    pub fn halt(&self) {
        if let Some(controller) = &self.backpressure {
            controller.close();
        }
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
        if let Some(limiter) = &self.limiter {
            limiter.reset();
        }
        info!(guards = %self.name, "guards_halted");
    }

    /// Admit work again after [`halt`](Self::halt)
    pub fn resume(&self) {
        if let Some(controller) = &self.backpressure {
            controller.reopen();
        }
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            circuit: self.breaker.as_ref().map(CircuitBreaker::metrics),
            rate_limit_available: self.limiter.as_ref().map(|limiter| limiter.available()),
            backpressure: self.backpressure.as_ref().map(BackpressureController::current_load),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pubguard_common::resilience::{CircuitState, Jitter};

    use super::*;

    fn settings() -> ResilienceSettings {
        let mut settings = ResilienceSettings::default();
        settings.retry.base_delay_ms = 10;
        settings
    }

    #[test]
    fn test_retry_config_strategies() {
        let mut retry = RetrySettings { jitter: true, ..RetrySettings::default() };
        let config = retry_config(&retry).unwrap();
        assert_eq!(config.jitter, Jitter::Full);
        assert_eq!(config.backoff.calculate_delay(2), Duration::from_millis(400));

        retry.strategy = BackoffKind::Linear;
        retry.jitter = false;
        let config = retry_config(&retry).unwrap();
        assert_eq!(config.backoff.calculate_delay(2), Duration::from_millis(300));

        retry.strategy = BackoffKind::Fixed;
        let config = retry_config(&retry).unwrap();
        assert_eq!(config.backoff.calculate_delay(5), Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_settings_map_to_config_error() {
        let breaker = CircuitBreakerSettings { failure_threshold: 0, ..Default::default() };
        assert!(matches!(circuit_breaker_config(&breaker), Err(PubSubError::Config(_))));

        let limit = RateLimitSettings { limit: 0, ..Default::default() };
        assert!(matches!(rate_limiter(&limit), Err(PubSubError::Config(_))));

        let backpressure = BackpressureSettings { max_in_flight: 0, ..Default::default() };
        assert!(matches!(backpressure_config(&backpressure), Err(PubSubError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_absorbed_by_retry() {
        let guards = GuardSet::from_settings("test", &settings()).unwrap();
        let calls = AtomicUsize::new(0);

        let outcome = guards
            .run(DeliveryResilience::default(), &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PubSubError::transient("mock", "flaky"))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, Attempted { value: "done", attempts: 3 });
        let snapshot = guards.snapshot();
        assert_eq!(snapshot.circuit.unwrap().failure_count, 0);
        assert_eq!(snapshot.backpressure.unwrap().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_errors_do_not_trip_breaker() {
        let mut settings = settings();
        settings.circuit_breaker.failure_threshold = 1;
        settings.rate_limit.enabled = true;
        settings.rate_limit.limit = 1;
        let guards = GuardSet::from_settings("test", &settings).unwrap();
        let cancel = CancellationToken::new();

        guards.run(DeliveryResilience::default(), &cancel, || async { Ok(()) }).await.unwrap();
        let limited = guards.run(DeliveryResilience::default(), &cancel, || async { Ok(()) }).await;
        assert!(matches!(limited, Err(PubSubError::RateLimited(_))));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let mut no_limit = DeliveryResilience::default();
        no_limit.rate_limit = false;
        let result = guards.run(no_limit, &cancelled, || async { Ok(()) }).await;
        assert!(matches!(result, Err(PubSubError::Cancelled)));

        assert_eq!(guards.circuit_breaker().unwrap().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_resets_breaker_and_closes_backpressure() {
        let mut settings = settings();
        settings.circuit_breaker.failure_threshold = 1;
        settings.retry.enabled = false;
        let guards = GuardSet::from_settings("test", &settings).unwrap();
        let cancel = CancellationToken::new();

        let failed = guards
            .run(DeliveryResilience::default(), &cancel, || async {
                Err::<(), _>(PubSubError::permanent("mock", "down"))
            })
            .await;
        assert!(matches!(failed, Err(PubSubError::Driver { .. })));
        assert_eq!(guards.circuit_breaker().unwrap().state(), CircuitState::Open);

        guards.halt();
        assert_eq!(guards.circuit_breaker().unwrap().state(), CircuitState::Closed);
        let closed = guards.run(DeliveryResilience::default(), &cancel, || async { Ok(()) }).await;
        assert!(matches!(closed, Err(PubSubError::NotConnected { .. })));

        guards.resume();
        guards.run(DeliveryResilience::default(), &cancel, || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_passthrough_runs_once() {
        let guards = GuardSet::passthrough("direct");
        let calls = AtomicUsize::new(0);
        let result = guards
            .run(DeliveryResilience::default(), &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PubSubError::transient("mock", "boom"))
            })
            .await;
        assert!(matches!(result, Err(PubSubError::Driver { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
