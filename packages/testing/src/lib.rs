#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the coordination packages.

use std::future::Future;
use std::sync::{Once, mpsc};
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Wall-clock limit for a single test.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a test with a timeout to prevent infinite hangs.
///
/// If the test takes longer than 10 seconds of wall-clock time, it is failed instead of blocking
/// the whole test run. Coordination bugs tend to show up as tasks waiting forever, so every
/// async test goes through this.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly. This allows mutation
/// testing to properly detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already given up on us.
        drop(tx.send(result));
    });

    match rx.recv_timeout(WATCHDOG_TIMEOUT) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {WATCHDOG_TIMEOUT:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Runs an async test on a fresh single-threaded tokio runtime whose clock starts paused.
///
/// With the clock paused, timers fire as soon as every task is waiting, so tests involving
/// timeouts and idle periods run instantly and deterministically. The whole test runs under
/// [`with_watchdog()`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use testing::run_local;
///
/// run_local(|| async {
///     let start = tokio::time::Instant::now();
///     tokio::time::sleep(Duration::from_secs(3600)).await;
///     assert!(start.elapsed() >= Duration::from_secs(3600));
/// });
/// ```
pub fn run_local<F, Fut>(test_fn: F) -> Fut::Output
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future,
    Fut::Output: Send + 'static,
{
    with_watchdog(move || {
        init_tracing();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .expect("failed to build test runtime");

        runtime.block_on(test_fn())
    })
}

/// Runs an async test on a fresh multi-threaded tokio runtime with a real clock.
///
/// Use this to check that coordination holds up when tasks truly run in parallel.
pub fn run_multi_thread<F, Fut>(worker_threads: usize, test_fn: F) -> Fut::Output
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future,
    Fut::Output: Send + 'static,
{
    with_watchdog(move || {
        init_tracing();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()
            .expect("failed to build test runtime");

        runtime.block_on(test_fn())
    })
}

/// Installs a tracing subscriber that writes through the test harness, filtered by `RUST_LOG`.
///
/// Safe to call any number of times; only the first call has an effect.
pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        drop(
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init(),
        );
    });
}
