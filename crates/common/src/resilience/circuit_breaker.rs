//! Three-state circuit breaker
//!
//! The breaker wraps a single async (or sync) operation class and stops
//! invoking it once it keeps failing. All counters live in one mutex-guarded
//! [`BreakerState`] so that concurrent callers never observe or produce torn
//! updates: admission, outcome accounting, and transitions each happen inside
//! a single critical section.
//!
//! ```text
//!            failures >= threshold               reset timeout elapsed
//!   CLOSED ─────────────────────────▶ OPEN ─────────────────────────▶ HALF_OPEN
//!     ▲                                ▲                                  │
//!     │                                └────────── probe failed ──────────┤
//!     └──────────────────── successes >= success_threshold ───────────────┘
//! ```
//!
//! The OPEN → HALF_OPEN check is lazy: it runs when a call arrives, never on a
//! background timer.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::error::{CircuitOpenError, ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::error::BoxedError;

//==============================================================================
// States and Transitions
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Why a state transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Failure count reached the configured threshold while CLOSED
    FailureThreshold { failures: u64 },
    /// The reset timeout elapsed while OPEN and a call arrived
    ResetTimeoutElapsed,
    /// A probe call failed while HALF_OPEN
    ProbeFailed,
    /// Enough consecutive probe calls succeeded while HALF_OPEN
    ProbesSucceeded { successes: u64 },
    /// [`CircuitBreaker::reset`] was called
    ManualReset,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailureThreshold { failures } => {
                write!(f, "failure threshold reached ({failures} failures)")
            }
            Self::ResetTimeoutElapsed => write!(f, "reset timeout elapsed"),
            Self::ProbeFailed => write!(f, "probe call failed"),
            Self::ProbesSucceeded { successes } => {
                write!(f, "{successes} probe calls succeeded")
            }
            Self::ManualReset => write!(f, "manual reset"),
        }
    }
}

/// A state change delivered to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: SystemTime,
}

/// Callback invoked synchronously on every state transition.
///
/// Errors and panics raised by a listener are logged and never reach the
/// caller of `execute`.
pub type StateChangeListener =
    Arc<dyn Fn(&StateTransition) -> Result<(), BoxedError> + Send + Sync + 'static>;

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u64,
    /// Number of consecutive successes needed to close the circuit from
    /// half-open
    pub success_threshold: u64,
    /// Time to wait in OPEN before admitting a probe call
    pub reset_timeout: Duration,
    /// When set, failures are counted over this sliding window instead of
    /// consecutively
    pub failure_window: Option<Duration>,
    /// Maximum number of concurrent probe calls in half-open state
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            failure_window: None,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }

        if self.failure_window.is_some_and(|window| window.is_zero()) {
            return Err(ConfigError::invalid("failure_window must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window = Some(window);
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Set a custom clock and build a [`CircuitBreaker`] directly
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { config: self.config, clock }
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a CircuitBreaker directly
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window = Some(window);
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::with_clock(self.config, self.clock)
    }
}

//==============================================================================
// Metrics
//==============================================================================

/// Point-in-time circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Consecutive failures, or failures inside the window when one is set
    pub failure_count: u64,
    /// Consecutive successes while half-open
    pub success_count: u64,
    /// Probe calls currently in flight
    pub half_open_calls: u64,
    /// Calls admitted since creation
    pub total_calls: u64,
    /// Calls rejected with `CircuitOpen` since creation
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub opened_at: Option<Instant>,
    pub state_change_time: Instant,
}

//==============================================================================
// Shared State
//==============================================================================

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older epoch are ignored.
    generation: u64,
    failure_count: u64,
    success_count: u64,
    half_open_in_flight: u64,
    total_calls: u64,
    rejected_calls: u64,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    state_changed_at: Instant,
    failures: VecDeque<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct PendingTransition {
    from: CircuitState,
    to: CircuitState,
    reason: TransitionReason,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            total_calls: 0,
            rejected_calls: 0,
            last_failure: None,
            opened_at: None,
            state_changed_at: now,
            failures: VecDeque::new(),
        }
    }

    fn transition(
        &mut self,
        to: CircuitState,
        reason: TransitionReason,
        now: Instant,
    ) -> PendingTransition {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.state_changed_at = now;
        self.success_count = 0;
        self.half_open_in_flight = 0;

        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                self.failure_count = 0;
                self.failures.clear();
                self.opened_at = None;
            }
        }

        PendingTransition { from, to, reason }
    }

    fn prune_window(&mut self, window: Duration, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn on_success(
        &mut self,
        config: &CircuitBreakerConfig,
        probe: bool,
        now: Instant,
    ) -> Option<PendingTransition> {
        match self.state {
            CircuitState::Closed => {
                match config.failure_window {
                    Some(window) => {
                        self.prune_window(window, now);
                        self.failure_count = self.failures.len() as u64;
                    }
                    None => self.failure_count = 0,
                }
                None
            }
            CircuitState::HalfOpen => {
                if probe {
                    self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                }
                self.success_count += 1;
                (self.success_count >= config.success_threshold).then(|| {
                    let successes = self.success_count;
                    self.transition(
                        CircuitState::Closed,
                        TransitionReason::ProbesSucceeded { successes },
                        now,
                    )
                })
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(
        &mut self,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> Option<PendingTransition> {
        self.last_failure = Some(now);

        match self.state {
            CircuitState::Closed => {
                self.success_count = 0;
                self.failure_count = match config.failure_window {
                    Some(window) => {
                        self.failures.push_back(now);
                        self.prune_window(window, now);
                        self.failures.len() as u64
                    }
                    None => self.failure_count + 1,
                };

                (self.failure_count >= config.failure_threshold).then(|| {
                    let failures = self.failure_count;
                    self.transition(
                        CircuitState::Open,
                        TransitionReason::FailureThreshold { failures },
                        now,
                    )
                })
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                Some(self.transition(CircuitState::Open, TransitionReason::ProbeFailed, now))
            }
            CircuitState::Open => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    probe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Success,
    Failure,
    /// Neither success nor failure: excluded error or dropped future
    Ignored,
}

/// Settles an admitted call exactly once, including when the call's future
/// is dropped mid-flight.
struct CallTicket<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    admission: Admission,
    settled: bool,
}

impl<'a, C: Clock> CallTicket<'a, C> {
    fn new(breaker: &'a CircuitBreaker<C>, admission: Admission) -> Self {
        Self { breaker, admission, settled: false }
    }

    fn settle(mut self, outcome: CallOutcome) {
        self.settled = true;
        self.breaker.settle(self.admission, outcome);
    }
}

impl<C: Clock> Drop for CallTicket<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.admission, CallOutcome::Ignored);
        }
    }
}

//==============================================================================
// Circuit Breaker
//==============================================================================

/// Generic circuit breaker implementation
///
/// Cloning a breaker yields another handle to the same shared state, so one
/// breaker can guard an operation class used from many tasks.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    listeners: Arc<RwLock<Vec<StateChangeListener>>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            listeners: Arc::clone(&self.listeners),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using system
    /// clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();

        Ok(Self {
            name: Arc::from("default"),
            config,
            inner: Arc::new(Mutex::new(BreakerState::new(now))),
            listeners: Arc::new(RwLock::new(Vec::new())),
            clock: Arc::new(clock),
        })
    }

    /// Attach a name used in log fields
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a listener invoked on every state transition
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&StateTransition) -> Result<(), BoxedError> + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Every error returned by the operation counts as a failure. Use
    /// [`execute_with`](Self::execute_with) to exclude some errors from the
    /// failure count.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_with(operation, |_| true).await
    }

    /// Execute an operation, counting only errors for which `is_failure`
    /// returns `true`.
    ///
    /// Errors that are not counted still release a half-open probe slot.
    /// Dropping the returned future mid-flight does the same.
    #[instrument(skip(self, operation, is_failure), fields(breaker = %self.name))]
    pub async fn execute_with<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
        P: FnOnce(&E) -> bool,
    {
        let admission = match self.try_admit() {
            Ok(admission) => admission,
            Err(rejection) => {
                debug!(
                    state = %rejection.state,
                    retry_after_ms = rejection.retry_after.as_millis() as u64,
                    "circuit_rejected_call"
                );
                return Err(ResilienceError::CircuitOpen(rejection));
            }
        };

        let ticket = CallTicket::new(self, admission);
        match operation().await {
            Ok(value) => {
                ticket.settle(CallOutcome::Success);
                Ok(value)
            }
            Err(error) => {
                let outcome =
                    if is_failure(&error) { CallOutcome::Failure } else { CallOutcome::Ignored };
                ticket.settle(outcome);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute a synchronous operation with circuit breaker protection
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let admission = self.try_admit()?;
        let ticket = CallTicket::new(self, admission);
        match operation() {
            Ok(value) => {
                ticket.settle(CallOutcome::Success);
                Ok(value)
            }
            Err(error) => {
                ticket.settle(CallOutcome::Failure);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Record a success observed outside of `execute`
    pub fn record_success(&self) {
        let now = self.clock.now();
        let pending = self.inner.lock().on_success(&self.config, false, now);
        if let Some(transition) = pending {
            self.notify(transition);
        }
    }

    /// Record a failure observed outside of `execute`
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let pending = self.inner.lock().on_failure(&self.config, now);
        if let Some(transition) = pending {
            self.notify(transition);
        }
    }

    /// Get the stored state of the circuit breaker
    ///
    /// An OPEN breaker whose reset timeout has elapsed still reports OPEN
    /// here; it moves to HALF_OPEN when the next call arrives.
    pub fn get_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Alias for [`get_state`](Self::get_state)
    pub fn state(&self) -> CircuitState {
        self.get_state()
    }

    /// Get circuit breaker metrics
    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now();
        let inner = self.inner.lock();

        let failure_count = match (inner.state, self.config.failure_window) {
            (CircuitState::Closed, Some(window)) => inner
                .failures
                .iter()
                .filter(|at| now.saturating_duration_since(**at) <= window)
                .count() as u64,
            _ => inner.failure_count,
        };

        CircuitBreakerMetrics {
            state: inner.state,
            failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_in_flight,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure,
            opened_at: inner.opened_at,
            state_change_time: inner.state_changed_at,
        }
    }

    /// Alias for [`get_metrics`](Self::get_metrics)
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.get_metrics()
    }

    /// Force the breaker to CLOSED and clear all counters
    ///
    /// Administrative override; normal recovery goes through HALF_OPEN.
    pub fn reset(&self) {
        let now = self.clock.now();
        let pending = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            let transition =
                inner.transition(CircuitState::Closed, TransitionReason::ManualReset, now);
            inner.last_failure = None;
            (previous != CircuitState::Closed).then_some(transition)
        };

        info!(breaker = %self.name, "circuit_manual_reset");
        if let Some(transition) = pending {
            self.notify(transition);
        }
    }

    fn try_admit(&self) -> Result<Admission, CircuitOpenError> {
        let now = self.clock.now();
        let mut pending = None;

        let admission = {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open {
                let opened_at = inner.opened_at.unwrap_or(inner.state_changed_at);
                if now.saturating_duration_since(opened_at) >= self.config.reset_timeout {
                    pending = Some(inner.transition(
                        CircuitState::HalfOpen,
                        TransitionReason::ResetTimeoutElapsed,
                        now,
                    ));
                }
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.total_calls += 1;
                    Ok(Admission { generation: inner.generation, probe: false })
                }
                CircuitState::HalfOpen
                    if inner.half_open_in_flight < self.config.half_open_max_calls =>
                {
                    inner.half_open_in_flight += 1;
                    inner.total_calls += 1;
                    Ok(Admission { generation: inner.generation, probe: true })
                }
                _ => {
                    inner.rejected_calls += 1;
                    Err(self.rejection(&inner, now))
                }
            }
        };

        if let Some(transition) = pending {
            self.notify(transition);
        }
        admission
    }

    fn rejection(&self, inner: &BreakerState, now: Instant) -> CircuitOpenError {
        let retry_after = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.reset_timeout.saturating_sub(now.saturating_duration_since(opened_at))
            }
            _ => Duration::ZERO,
        };

        CircuitOpenError {
            state: inner.state,
            failure_count: inner.failure_count,
            retry_after,
            retry_at: self.clock.system_time() + retry_after,
        }
    }

    fn settle(&self, admission: Admission, outcome: CallOutcome) {
        let now = self.clock.now();
        let pending = {
            let mut inner = self.inner.lock();

            if admission.generation != inner.generation {
                // Admitted under an earlier state; only the timestamp is kept.
                if outcome == CallOutcome::Failure {
                    inner.last_failure = Some(now);
                }
                None
            } else {
                match outcome {
                    CallOutcome::Success => inner.on_success(&self.config, admission.probe, now),
                    CallOutcome::Failure => inner.on_failure(&self.config, now),
                    CallOutcome::Ignored => {
                        if admission.probe {
                            inner.half_open_in_flight =
                                inner.half_open_in_flight.saturating_sub(1);
                        }
                        None
                    }
                }
            }
        };

        if let Some(transition) = pending {
            self.notify(transition);
        }
    }

    fn notify(&self, pending: PendingTransition) {
        let transition = StateTransition {
            from: pending.from,
            to: pending.to,
            reason: pending.reason,
            at: self.clock.system_time(),
        };

        match transition.to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %transition.from,
                reason = %transition.reason,
                "circuit_opened"
            ),
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, reason = %transition.reason, "circuit_half_open");
            }
            CircuitState::Closed => info!(
                breaker = %self.name,
                from = %transition.from,
                reason = %transition.reason,
                "circuit_closed"
            ),
        }

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&transition))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(breaker = %self.name, error = %err, "state_change_listener_failed");
                }
                Err(_) => {
                    error!(breaker = %self.name, "state_change_listener_panicked");
                }
            }
        }
    }
}
