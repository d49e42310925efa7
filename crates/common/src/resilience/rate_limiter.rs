//! Process-local rate limiting
//!
//! Two algorithms implement the [`RateLimiter`] trait:
//! - **Fixed window** ([`FixedWindowLimiter`]): at most `limit` permits per
//!   `window`; the count resets when the window rolls over
//! - **Token bucket** ([`TokenBucket`]): bursts up to `capacity`, refilled by
//!   `refill_amount` every `refill_interval`
//!
//! Both keep their counters behind a single mutex so check-and-increment is
//! one atomic unit. Window boundaries only ever move forward in whole
//! windows, so a clock reading that goes backwards never triggers a reset.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, RateLimitExceeded};

/// Smallest pause between permit attempts in [`RateLimiter::acquire`]
const MIN_ACQUIRE_BACKOFF: Duration = Duration::from_millis(1);

/// Common interface of the rate limiting algorithms
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Take one permit without waiting
    fn try_acquire(&self) -> Result<(), RateLimitExceeded>;

    /// Permits currently available
    fn available(&self) -> u64;

    /// Restore full capacity and start a fresh window
    fn reset(&self);

    /// Wait until a permit is granted or `cancel` fires
    ///
    /// On cancellation the most recent rejection is returned, so the caller
    /// still learns how long the limiter wanted it to wait.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitExceeded> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(denied) => {
                    let wait = denied.retry_after.max(MIN_ACQUIRE_BACKOFF);
                    trace!(wait_ms = wait.as_millis() as u64, "rate_limit_waiting");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(denied),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

/// Advance `start` by whole multiples of `period` until `now` falls inside
/// the current period. Returns the number of periods skipped.
fn roll_forward(start: &mut Instant, period: Duration, now: Instant) -> u128 {
    let elapsed = now.saturating_duration_since(*start);
    if elapsed < period {
        return 0;
    }
    let periods = elapsed.as_nanos() / period.as_nanos();
    let advance = periods.saturating_mul(period.as_nanos());
    *start = match u64::try_from(advance) {
        Ok(nanos) => *start + Duration::from_nanos(nanos),
        Err(_) => now,
    };
    periods
}

//==============================================================================
// Fixed Window
//==============================================================================

/// Configuration for the fixed-window limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Permits per window
    pub limit: u64,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { limit: 100, window: Duration::from_secs(1) }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u64, window: Duration) -> ConfigResult<Self> {
        let config = Self { limit, window };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.limit == 0 {
            return Err(ConfigError::invalid("limit must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u64,
}

/// Fixed-window rate limiter
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use pubguard_common::resilience::{FixedWindowLimiter, RateLimitConfig, RateLimiter};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = FixedWindowLimiter::new(RateLimitConfig::new(5, Duration::from_secs(1))?);
///
/// for _ in 0..5 {
///     limiter.try_acquire()?;
/// }
/// assert!(limiter.try_acquire().is_err());
/// # Ok(())
/// # }
/// ```
pub struct FixedWindowLimiter<C: Clock = SystemClock> {
    config: RateLimitConfig,
    state: Arc<Mutex<WindowState>>,
    clock: Arc<C>,
}

impl FixedWindowLimiter<SystemClock> {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> FixedWindowLimiter<C> {
    /// Create a limiter with a custom clock
    pub fn with_clock(config: RateLimitConfig, clock: C) -> Self {
        let state = WindowState { window_start: clock.now(), count: 0 };
        Self { config, state: Arc::new(Mutex::new(state)), clock: Arc::new(clock) }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn roll(&self, state: &mut WindowState, now: Instant) {
        if roll_forward(&mut state.window_start, self.config.window, now) > 0 {
            trace!(previous_count = state.count, "rate_limit_window_rolled");
            state.count = 0;
        }
    }
}

impl<C: Clock> Clone for FixedWindowLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> fmt::Debug for FixedWindowLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("config", &self.config)
            .field("count", &self.state.lock().count)
            .finish()
    }
}

#[async_trait]
impl<C: Clock> RateLimiter for FixedWindowLimiter<C> {
    fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);

        if state.count < self.config.limit {
            state.count += 1;
            return Ok(());
        }

        let window_end = state.window_start + self.config.window;
        let retry_after = window_end.saturating_duration_since(now);
        debug!(
            limit = self.config.limit,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate_limited"
        );
        Err(RateLimitExceeded { limit: self.config.limit, window: self.config.window, retry_after })
    }

    fn available(&self) -> u64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        self.config.limit.saturating_sub(state.count)
    }

    fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.count = 0;
        if now > state.window_start {
            state.window_start = now;
        }
    }
}

//==============================================================================
// Token Bucket
//==============================================================================

/// Configuration for token bucket rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold
    pub capacity: u64,
    /// Number of tokens to refill per interval
    pub refill_amount: u64,
    /// Time interval for token refill
    pub refill_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { capacity: 100, refill_amount: 10, refill_interval: Duration::from_secs(1) }
    }
}

impl TokenBucketConfig {
    /// Create a new configuration builder
    pub fn builder() -> TokenBucketConfigBuilder {
        TokenBucketConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity must be greater than 0"));
        }
        if self.refill_amount == 0 {
            return Err(ConfigError::invalid("refill_amount must be greater than 0"));
        }
        if self.refill_interval.is_zero() {
            return Err(ConfigError::invalid("refill_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for TokenBucketConfig
#[derive(Debug, Default)]
pub struct TokenBucketConfigBuilder {
    config: TokenBucketConfig,
}

impl TokenBucketConfigBuilder {
    pub fn new() -> Self {
        Self { config: TokenBucketConfig::default() }
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn refill_amount(mut self, amount: u64) -> Self {
        self.config.refill_amount = amount;
        self
    }

    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.config.refill_interval = interval;
        self
    }

    pub fn build(self) -> ConfigResult<TokenBucketConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// Allows bursts of requests up to the capacity, then refills tokens at a fixed
/// rate.
pub struct TokenBucket<C: Clock = SystemClock> {
    config: TokenBucketConfig,
    state: Arc<Mutex<BucketState>>,
    clock: Arc<C>,
}

impl TokenBucket<SystemClock> {
    /// Create a new token bucket with system clock
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a new token bucket with custom clock
    pub fn with_clock(config: TokenBucketConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let state = BucketState { tokens: config.capacity, last_refill: clock.now() };
        Ok(Self { config, state: Arc::new(Mutex::new(state)), clock: Arc::new(clock) })
    }

    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let intervals = roll_forward(&mut state.last_refill, self.config.refill_interval, now);
        if intervals > 0 {
            let added = u64::try_from(intervals)
                .unwrap_or(u64::MAX)
                .saturating_mul(self.config.refill_amount);
            state.tokens = state.tokens.saturating_add(added).min(self.config.capacity);
            trace!(added, tokens = state.tokens, "token_bucket_refilled");
        }
    }
}

impl<C: Clock> Clone for TokenBucket<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

#[async_trait]
impl<C: Clock> RateLimiter for TokenBucket<C> {
    fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            return Ok(());
        }

        let next_refill = state.last_refill + self.config.refill_interval;
        let retry_after = next_refill.saturating_duration_since(now);
        debug!(
            capacity = self.config.capacity,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate_limited"
        );
        Err(RateLimitExceeded {
            limit: self.config.capacity,
            window: self.config.refill_interval,
            retry_after,
        })
    }

    fn available(&self) -> u64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.tokens = self.config.capacity;
        if now > state.last_refill {
            state.last_refill = now;
        }
    }
}
