//! Backpressure control for in-flight work
//!
//! [`BackpressureController`] bounds the number of operations in flight and,
//! optionally, the number of callers waiting for a slot. Slots are handed out
//! as [`BackpressureToken`]s that release their slot exactly once when
//! dropped, whichever way the guarded operation ends: success, error, panic
//! unwinding, or the caller's future being dropped.
//!
//! Waiters are served in FIFO order by the underlying tokio [`Semaphore`]. A
//! waiter that is cancelled or times out leaves the queue without taking a
//! slot.
//!
//! [`close`](BackpressureController::close) retires the current slot pool:
//! queued waiters fail with [`BackpressureError::Closed`], new entries are
//! refused, and tokens still held by running operations no longer count
//! toward the load. [`reopen`](BackpressureController::reopen) installs a
//! fresh pool.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::{BackpressureError, ConfigError, ConfigResult, ResilienceError};

/// Configuration for backpressure behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    /// Maximum number of operations in flight
    pub max_in_flight: usize,
    /// Maximum number of callers waiting for a slot; `0` rejects immediately
    pub queue_capacity: usize,
    /// Optional limit on how long a caller may wait in the queue
    pub queue_timeout: Option<Duration>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { max_in_flight: 100, queue_capacity: 0, queue_timeout: None }
    }
}

impl BackpressureConfig {
    /// Create a new configuration builder
    pub fn builder() -> BackpressureConfigBuilder {
        BackpressureConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid("max_in_flight must be greater than 0"));
        }
        if self.max_in_flight > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid("max_in_flight exceeds the semaphore permit limit"));
        }
        Ok(())
    }
}

/// Builder for BackpressureConfig
#[derive(Debug, Default)]
pub struct BackpressureConfigBuilder {
    config: BackpressureConfig,
}

impl BackpressureConfigBuilder {
    pub fn new() -> Self {
        Self { config: BackpressureConfig::default() }
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ConfigResult<BackpressureConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Snapshot of the controller's load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureLoad {
    pub in_flight: usize,
    pub queued: usize,
    pub max_in_flight: usize,
    pub queue_capacity: usize,
    pub closed: bool,
    /// Entries granted since creation
    pub entered_total: u64,
    /// Entries refused (rejected, timed out, cancelled, or closed)
    pub rejected_total: u64,
}

impl BackpressureLoad {
    /// Current utilization as a fraction (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.in_flight as f64 / self.max_in_flight as f64
    }

    /// Check if every slot is taken
    pub fn is_at_capacity(&self) -> bool {
        self.in_flight >= self.max_in_flight
    }
}

/// One slot pool. Replaced wholesale by `close` and `reopen`.
#[derive(Debug)]
struct Pool {
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl Pool {
    fn open(max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        })
    }

    fn closed() -> Arc<Self> {
        let semaphore = Semaphore::new(0);
        semaphore.close();
        Arc::new(Self {
            semaphore: Arc::new(semaphore),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        })
    }
}

/// Scoped slot in a [`BackpressureController`]
///
/// The slot is released when the token is dropped.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the token is dropped"]
pub struct BackpressureToken {
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl BackpressureToken {
    fn new(pool: Arc<Pool>, permit: OwnedSemaphorePermit) -> Self {
        pool.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { pool, _permit: permit }
    }
}

impl Drop for BackpressureToken {
    fn drop(&mut self) {
        self.pool.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reserved place in the wait queue, released on drop.
struct QueueSlot {
    pool: Arc<Pool>,
}

impl QueueSlot {
    fn reserve(pool: &Arc<Pool>, capacity: usize) -> Option<Self> {
        pool.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < capacity).then_some(queued + 1)
            })
            .ok()
            .map(|_| Self { pool: Arc::clone(pool) })
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.pool.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounds in-flight work with an optional FIFO wait queue
///
/// # Examples
///
/// ```rust
/// use pubguard_common::resilience::{BackpressureConfig, BackpressureController};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let controller =
///     BackpressureController::new(BackpressureConfig::builder().max_in_flight(1).build()?);
///
/// let token = controller.try_enter()?;
/// assert!(controller.try_enter().is_err());
/// drop(token);
/// assert!(controller.try_enter().is_ok());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BackpressureController {
    config: BackpressureConfig,
    pool: Arc<RwLock<Arc<Pool>>>,
    entered_total: Arc<AtomicU64>,
    rejected_total: Arc<AtomicU64>,
}

impl BackpressureController {
    /// Create a controller; the configuration is validated by its builder
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            pool: Arc::new(RwLock::new(Pool::open(config.max_in_flight.max(1)))),
            config,
            entered_total: Arc::new(AtomicU64::new(0)),
            rejected_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> BackpressureConfig {
        self.config
    }

    fn current_pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool.read())
    }

    fn refuse(&self, error: BackpressureError) -> BackpressureError {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        debug!(reason = %error, "backpressure_refused_entry");
        error
    }

    fn rejected(&self, pool: &Pool) -> BackpressureError {
        BackpressureError::Rejected {
            in_flight: pool.in_flight.load(Ordering::Acquire),
            max_in_flight: self.config.max_in_flight,
            queued: pool.queued.load(Ordering::Acquire),
            queue_capacity: self.config.queue_capacity,
        }
    }

    fn grant(&self, pool: Arc<Pool>, permit: OwnedSemaphorePermit) -> BackpressureToken {
        self.entered_total.fetch_add(1, Ordering::Relaxed);
        BackpressureToken::new(pool, permit)
    }

    /// Take a slot without waiting
    pub fn try_enter(&self) -> Result<BackpressureToken, BackpressureError> {
        let pool = self.current_pool();
        match Arc::clone(&pool.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.grant(pool, permit)),
            Err(TryAcquireError::Closed) => Err(self.refuse(BackpressureError::Closed)),
            Err(TryAcquireError::NoPermits) => {
                let rejection = self.rejected(&pool);
                Err(self.refuse(rejection))
            }
        }
    }

    /// Take a slot, waiting in the FIFO queue when one is configured
    ///
    /// Fails immediately when at capacity with the queue full or disabled.
    /// Cancellation and queue timeouts remove the waiter without taking a
    /// slot.
    pub async fn enter(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BackpressureToken, BackpressureError> {
        let pool = self.current_pool();

        match Arc::clone(&pool.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(self.grant(pool, permit)),
            Err(TryAcquireError::Closed) => return Err(self.refuse(BackpressureError::Closed)),
            Err(TryAcquireError::NoPermits) => {}
        }

        let Some(_queue_slot) = QueueSlot::reserve(&pool, self.config.queue_capacity) else {
            let rejection = self.rejected(&pool);
            return Err(self.refuse(rejection));
        };

        let semaphore = Arc::clone(&pool.semaphore);
        let wait = async {
            let acquire = semaphore.acquire_owned();
            match self.config.queue_timeout {
                Some(limit) => match tokio::time::timeout(limit, acquire).await {
                    Ok(permit) => permit.map_err(|_| BackpressureError::Closed),
                    Err(_) => Err(BackpressureError::QueueTimeout { waited: limit }),
                },
                None => acquire.await.map_err(|_| BackpressureError::Closed),
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BackpressureError::Cancelled),
            permit = wait => permit,
        };

        match outcome {
            Ok(permit) => Ok(self.grant(pool, permit)),
            Err(error) => Err(self.refuse(error)),
        }
    }

    /// Run `operation` while holding a slot
    #[instrument(skip(self, cancel, operation))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _token = self.enter(cancel).await?;
        operation().await.map_err(|source| ResilienceError::OperationFailed { source })
    }

    /// Current load of the active slot pool
    pub fn current_load(&self) -> BackpressureLoad {
        let pool = self.current_pool();
        BackpressureLoad {
            in_flight: pool.in_flight.load(Ordering::Acquire),
            queued: pool.queued.load(Ordering::Acquire),
            max_in_flight: self.config.max_in_flight,
            queue_capacity: self.config.queue_capacity,
            closed: pool.semaphore.is_closed(),
            entered_total: self.entered_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.current_pool().semaphore.is_closed()
    }

    /// Retire the current slot pool and refuse new entries
    pub fn close(&self) {
        let retired = {
            let mut pool = self.pool.write();
            std::mem::replace(&mut *pool, Pool::closed())
        };
        retired.semaphore.close();

        let outstanding = retired.in_flight.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!(outstanding, "backpressure_closed_with_slots_outstanding");
        } else {
            info!("backpressure_closed");
        }
    }

    /// Install a fresh slot pool if the controller is closed
    pub fn reopen(&self) {
        let mut pool = self.pool.write();
        if pool.semaphore.is_closed() {
            *pool = Pool::open(self.config.max_in_flight.max(1));
            info!(max_in_flight = self.config.max_in_flight, "backpressure_reopened");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn controller(max: usize, queue: usize) -> BackpressureController {
        BackpressureController::new(
            BackpressureConfig::builder()
                .max_in_flight(max)
                .queue_capacity(queue)
                .build()
                .expect("valid config"),
        )
    }

    async fn wait_for_queued(controller: &BackpressureController, queued: usize) {
        while controller.current_load().queued < queued {
            tokio::task::yield_now().await;
        }
    }

    #[derive(Debug)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl std::error::Error for TestError {}

    /// Validates capacity rejection without queuing.
    ///
    /// Assertions:
    /// - Confirms the fourth entry is rejected with the current load.
    /// - Confirms releasing one slot immediately admits a new entry.
    #[tokio::test]
    async fn test_rejects_at_capacity_without_queue() {
        let controller = controller(3, 0);
        let cancel = CancellationToken::new();

        let first = controller.enter(&cancel).await.expect("slot 1");
        let _second = controller.enter(&cancel).await.expect("slot 2");
        let _third = controller.try_enter().expect("slot 3");

        match controller.enter(&cancel).await {
            Err(BackpressureError::Rejected { in_flight, max_in_flight, .. }) => {
                assert_eq!(in_flight, 3);
                assert_eq!(max_in_flight, 3);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        drop(first);
        let _fourth = controller.try_enter().expect("slot freed");
        assert_eq!(controller.current_load().in_flight, 3);
        assert_eq!(controller.current_load().rejected_total, 1);
    }

    /// Validates FIFO release order for queued waiters.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_waiters_are_served_in_order() {
        let controller = controller(1, 2);
        let held = controller.try_enter().expect("slot");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for label in ["first", "second"] {
            let controller_clone = controller.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let token = controller_clone.enter(&CancellationToken::new()).await.expect("queued");
                order.lock().push(label);
                drop(token);
            }));
            let expected = waiters.len();
            wait_for_queued(&controller, expected).await;
        }

        assert!(matches!(
            controller.enter(&CancellationToken::new()).await,
            Err(BackpressureError::Rejected { queued: 2, .. })
        ));

        drop(held);
        for waiter in waiters {
            waiter.await.expect("waiter");
        }
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(controller.current_load().in_flight, 0);
    }

    /// Validates that a cancelled waiter leaves the queue without a slot.
    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak() {
        let controller = controller(1, 1);
        let held = controller.try_enter().expect("slot");

        let cancel = CancellationToken::new();
        let waiter = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.enter(&cancel).await })
        };
        wait_for_queued(&controller, 1).await;

        cancel.cancel();
        let result = waiter.await.expect("waiter task");
        assert!(matches!(result, Err(BackpressureError::Cancelled)));

        let load = controller.current_load();
        assert_eq!(load.queued, 0);
        assert_eq!(load.in_flight, 1);

        drop(held);
        assert_eq!(controller.current_load().in_flight, 0);
        let _slot = controller.try_enter().expect("slot available again");
    }

    /// Validates the queue timeout.
    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let controller = BackpressureController::new(
            BackpressureConfig::builder()
                .max_in_flight(1)
                .queue_capacity(1)
                .queue_timeout(Duration::from_millis(250))
                .build()
                .expect("valid config"),
        );
        let _held = controller.try_enter().expect("slot");

        let result = controller.enter(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(BackpressureError::QueueTimeout { waited }) if waited == Duration::from_millis(250)
        ));
        assert_eq!(controller.current_load().queued, 0);
    }

    /// Validates that `execute` releases the slot on the error path.
    #[tokio::test]
    async fn test_execute_releases_slot_on_error() {
        let controller = controller(1, 0);
        let cancel = CancellationToken::new();
        let ran = AtomicBool::new(false);

        let result = controller
            .execute(&cancel, || async {
                ran.store(true, Ordering::SeqCst);
                Err::<(), _>(TestError)
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(controller.current_load().in_flight, 0);
    }

    /// Validates close and reopen.
    ///
    /// Assertions:
    /// - Confirms queued waiters fail with `Closed`.
    /// - Confirms load drops to zero while a retired token is still held.
    /// - Confirms dropping the retired token after reopen does not disturb the
    ///   new pool.
    #[tokio::test]
    async fn test_close_releases_slots_and_reopen_restores_capacity() {
        let controller = controller(1, 1);
        let retired = controller.try_enter().expect("slot");

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.enter(&CancellationToken::new()).await })
        };
        wait_for_queued(&controller, 1).await;

        controller.close();
        assert!(matches!(waiter.await.expect("waiter"), Err(BackpressureError::Closed)));
        assert!(matches!(controller.try_enter(), Err(BackpressureError::Closed)));

        let load = controller.current_load();
        assert!(load.closed);
        assert_eq!(load.in_flight, 0);

        controller.reopen();
        let fresh = controller.try_enter().expect("fresh pool");
        drop(retired);
        assert_eq!(controller.current_load().in_flight, 1);
        drop(fresh);
        assert_eq!(controller.current_load().in_flight, 0);
    }
}
