//! Async testing utilities
//!
//! Provides async-specific test helpers and assertions.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::future::Future;
use std::time::Duration;

/// Assert that a condition eventually becomes true within a timeout (async
/// version)
///
/// # Examples
///
/// ```no_run
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[tokio::test(flavor = "multi_thread")]
/// async fn test_eventually() {
///     let flag = Arc::new(AtomicBool::new(false));
///     let flag_clone = flag.clone();
///
///     tokio::spawn(async move {
///         tokio::time::sleep(Duration::from_millis(100)).await;
///         flag_clone.store(true, Ordering::SeqCst);
///     });
///
///     pubguard_common::assert_eventually_async!(Duration::from_secs(1), async {
///         flag.load(Ordering::SeqCst)
///     });
/// }
/// ```
#[macro_export]
macro_rules! assert_eventually_async {
    ($timeout:expr, $fut:expr) => {{
        let timeout_duration = $timeout;
        let result = tokio::time::timeout(timeout_duration, async {
            loop {
                if $fut.await {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;

        assert!(result.is_ok(), "Condition did not become true within {:?}", timeout_duration);
    }};
}

/// Run `fut` with a timeout, returning `Err` if it does not finish in time
pub async fn timeout_ok<F, T>(duration: Duration, fut: F) -> Result<T, tokio::time::error::Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await
}

/// Poll `condition` every `interval` until it returns `true` or `timeout`
/// elapses
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }

    condition().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_ok_times_out() {
        let result = timeout_ok(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_until_succeeds() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::SeqCst);
        });

        let result = poll_until(Duration::from_secs(1), Duration::from_millis(10), || {
            let flag = flag.clone();
            async move { flag.load(Ordering::SeqCst) }
        })
        .await;

        assert!(result);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eventually_macro() {
        let flag = Arc::new(AtomicBool::new(true));
        crate::assert_eventually_async!(Duration::from_millis(100), async {
            flag.load(Ordering::SeqCst)
        });
    }
}
