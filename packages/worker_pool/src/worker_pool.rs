//! Worker pool management and lifecycle.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::num::NonZero;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    Error, Handoff, Job, OnDone, Pool, PoolType, Result, Task, WaitError, Worker,
    WorkerPoolBuilder, wrap_task,
};

/// A pool of reusable workers that bounds how many tasks execute concurrently.
///
/// Each submitted task is executed by one worker. Idle workers are kept in a [`Pool`] in the order
/// given by the [`PoolType`] and are reused for later tasks. New workers are spawned on demand
/// until the capacity is reached, after which callers either wait for a worker to be released or
/// are turned away with [`Error::Exhausted`], depending on the configured `max_blocks`.
///
/// If a GC interval is configured, a background task periodically stops and discards workers that
/// have been idle for longer than the interval.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use worker_pool::WorkerPool;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = WorkerPool::builder()
///     .capacity(4)
///     .max_blocks(16)
///     .build()
///     .unwrap();
///
/// let answer = pool
///     .submit(async { 6 * 7 }, Some(Duration::from_secs(1)), false)
///     .await
///     .unwrap();
///
/// assert_eq!(answer, 42);
///
/// pool.stop();
/// # }
/// ```
///
/// # Lifetime
///
/// Dropping the pool stops it: idle workers are stopped immediately and busy workers are stopped
/// when they finish their current task.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

/// State shared between the pool handle, its workers and its eviction loop.
struct Shared {
    /// `None` means unbounded.
    capacity: Option<NonZero<usize>>,

    max_blocks: usize,

    roster: Mutex<Roster>,

    /// Number of workers that have been started and not yet stopped.
    live_workers: Arc<AtomicUsize>,

    running: AtomicBool,

    next_worker_id: AtomicU64,

    /// Dropping or firing this ends the eviction loop.
    gc_stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// Idle workers plus the callers waiting for one. Guarded together so that a release can never
/// slip between a failed detach and the registration of a waiter.
struct Roster {
    idle: Pool<Worker>,
    handoff: Handoff<Worker>,
}

impl WorkerPool {
    /// Creates a builder for configuring the pool.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Gets replaced with itself by different name, bad mutation.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    pub(crate) fn start(
        pool_type: PoolType,
        capacity: Option<NonZero<usize>>,
        max_blocks: usize,
        gc_interval: Option<Duration>,
        pre_spawn: bool,
    ) -> Self {
        let shared = Arc::new(Shared {
            capacity,
            max_blocks,
            roster: Mutex::new(Roster {
                idle: Pool::new(pool_type, capacity),
                handoff: Handoff::new(),
            }),
            live_workers: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(true),
            next_worker_id: AtomicU64::new(0),
            gc_stop: Mutex::new(None),
        });

        if let Some(interval) = gc_interval {
            let (stop_sender, stop_receiver) = oneshot::channel();
            *shared.gc_stop.lock() = Some(stop_sender);
            tokio::spawn(collect_idle_workers(
                Arc::downgrade(&shared),
                interval,
                stop_receiver,
            ));
        }

        if pre_spawn {
            shared.spawn_idle_workers();
        }

        debug!(
            ?pool_type,
            capacity = capacity.map(NonZero::get),
            max_blocks,
            ?gc_interval,
            pre_spawn,
            "worker pool started"
        );

        Self { shared }
    }

    /// Runs a future on a worker and returns its output.
    ///
    /// `timeout` bounds how long to wait for a worker to become available; `None` waits
    /// indefinitely. It does not bound the execution of the task itself. A `synchronous` task
    /// runs inline on the worker's loop, otherwise it runs as a child task of the worker.
    ///
    /// # Errors
    ///
    /// See [`submit_task()`][Self::submit_task].
    pub async fn submit<F>(
        &self,
        task: F,
        timeout: Option<Duration>,
        synchronous: bool,
    ) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.submit_task(Job::new(task, synchronous), timeout).await
    }

    /// Runs a task on a worker and returns its output.
    ///
    /// # Errors
    ///
    /// * [`Error::Closed`] if the pool has been stopped.
    /// * [`Error::Exhausted`] if no worker is available and the caller may not wait for one.
    /// * [`Error::Timeout`] if no worker became available within `timeout`.
    /// * [`Error::TaskFailed`] if the task panicked. The worker remains in service.
    /// * [`Error::Misuse`] if called outside a tokio runtime while a worker needs to be spawned.
    pub async fn submit_task<T>(&self, task: T, timeout: Option<Duration>) -> Result<T::Output>
    where
        T: Task,
    {
        if !self.is_running() {
            return Err(Error::Closed);
        }

        let worker = self.shared.acquire(timeout).await?;

        let (sender, receiver) = oneshot::channel();
        if worker.send(wrap_task(task, sender)).is_err() {
            return Err(Error::Closed);
        }

        match receiver.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(Error::TaskFailed { message }),
            Err(_abandoned) => Err(Error::Closed),
        }
    }

    /// Stops the pool.
    ///
    /// Further submissions fail with [`Error::Closed`], the eviction loop exits, idle workers are
    /// stopped and callers waiting for a worker are released with [`Error::Closed`]. Workers that
    /// are busy are stopped once their current task completes.
    pub fn stop(&self) {
        // The flag only changes under the roster lock.
        let idle = {
            let mut roster = self.shared.roster.lock();

            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }

            roster.handoff.close();
            roster.idle.drain()
        };

        if let Some(gc_stop) = self.shared.gc_stop.lock().take() {
            drop(gc_stop.send(()));
        }

        for worker in &idle {
            worker.stop();
        }

        debug!(stopped = idle.len(), "worker pool stopped");
    }

    /// Whether the pool still accepts tasks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The maximum number of workers, or `None` if unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity.map(NonZero::get)
    }

    /// The number of workers that are started and not yet stopped, idle or busy.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    /// The number of workers currently idle in the pool.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.shared.roster.lock().idle.count()
    }

    /// The number of callers currently waiting for a worker.
    #[must_use]
    pub fn waiting_acquirers(&self) -> usize {
        self.shared.roster.lock().handoff.waiting()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("capacity", &self.capacity())
            .field("max_blocks", &self.shared.max_blocks)
            .field("running", &self.is_running())
            .field("running_workers", &self.running_workers())
            .field("idle_workers", &self.idle_workers())
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Worker> {
        let waiter = {
            let mut roster = self.roster.lock();

            if !self.running.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            if let Some(worker) = roster.idle.detach() {
                return Ok(worker);
            }

            if roster.idle.is_empty() && self.reserve_worker_slot() {
                drop(roster);
                return self.start_worker();
            }

            let waiting = roster.handoff.waiting();
            if self.max_blocks == 0 || waiting >= self.max_blocks {
                debug!(
                    capacity = self.capacity.map(NonZero::get),
                    max_blocks = self.max_blocks,
                    waiting,
                    "worker pool exhausted"
                );

                return Err(Error::Exhausted {
                    capacity: self.capacity.map_or(usize::MAX, NonZero::get),
                    max_blocks: self.max_blocks,
                });
            }

            let shared = Arc::downgrade(self);
            roster.handoff.wait(move |worker| match shared.upgrade() {
                Some(shared) => shared.release(worker),
                None => worker.stop(),
            })
        };

        trace!(?timeout, "waiting for a worker to be released");

        match waiter.recv(timeout).await {
            Ok(worker) => Ok(worker),
            Err(WaitError::Timeout(waited)) => {
                debug!(?waited, "timed out waiting for a worker");
                Err(Error::Timeout { waited })
            }
            Err(WaitError::Closed) => Err(Error::Closed),
        }
    }

    /// Returns a worker that finished its task, either to a waiting caller or to the idle pool.
    fn release(&self, worker: Worker) {
        let mut roster = self.roster.lock();

        if !self.running.load(Ordering::Acquire) {
            drop(roster);
            worker.stop();
            return;
        }

        let Err(worker) = roster.handoff.offer(worker) else {
            return;
        };

        if let Err(error) = roster.idle.release(worker.clone()) {
            drop(roster);
            warn!(%error, worker_id = worker.id(), "no room to return worker to the pool");
            worker.stop();
        }
    }

    /// Counts a new worker against the capacity, if there is room for one.
    fn reserve_worker_slot(&self) -> bool {
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match self.capacity {
                Some(capacity) if live >= capacity.get() => None,
                _ => live.checked_add(1),
            })
            .is_ok()
    }

    fn start_worker(self: &Arc<Self>) -> Result<Worker> {
        if tokio::runtime::Handle::try_current().is_err() {
            self.live_workers.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Misuse {
                problem: "workers can only be spawned inside a tokio runtime".to_string(),
            });
        }

        let shared = Arc::downgrade(self);
        let on_done: OnDone = Arc::new(move |worker: Worker| match shared.upgrade() {
            Some(shared) => shared.release(worker),
            None => worker.stop(),
        });

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);

        Ok(Worker::spawn(id, Arc::clone(&self.live_workers), on_done))
    }

    fn spawn_idle_workers(self: &Arc<Self>) {
        while self.reserve_worker_slot() {
            let Ok(worker) = self.start_worker() else {
                break;
            };

            if let Err(error) = self.roster.lock().idle.insert(worker.clone()) {
                warn!(%error, "pre-spawned worker does not fit in the pool");
                worker.stop();
                break;
            }
        }
    }

    fn collect_before(&self, cutoff: Instant) -> usize {
        self.roster.lock().idle.collect_before(cutoff)
    }
}

/// Periodically evicts workers that have been idle for longer than `interval`.
async fn collect_idle_workers(
    shared: Weak<Shared>,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        // Either a stop signal or the loss of the sender ends the loop.
        if tokio::time::timeout(interval, &mut stop).await.is_ok() {
            break;
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let Some(cutoff) = Instant::now().checked_sub(interval) else {
            continue;
        };

        let evicted = shared.collect_before(cutoff);

        if evicted > 0 {
            debug!(evicted, "evicted idle workers");
        }
    }

    trace!("worker eviction loop exiting");
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;
    use tokio::sync::Notify;

    use super::*;

    assert_impl_all!(WorkerPool: Send, Sync);

    fn pool(capacity: usize, max_blocks: usize) -> WorkerPool {
        WorkerPool::builder()
            .capacity(capacity)
            .max_blocks(max_blocks)
            .no_gc()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn submit_returns_task_output() {
        let pool = pool(2, 0);

        assert_eq!(pool.submit(async { 1 + 1 }, None, true).await.unwrap(), 2);
        assert_eq!(pool.submit(async { "x" }, None, false).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn workers_are_spawned_lazily_and_reused() {
        let pool = pool(4, 0);
        assert_eq!(pool.running_workers(), 0);

        for _ in 0..10 {
            pool.submit(async {}, None, true).await.unwrap();
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.running_workers(), 1);
        assert_eq!(pool.idle_workers(), 1);
    }

    #[tokio::test]
    async fn exhausted_when_blocking_is_disabled() {
        let pool = Arc::new(pool(1, 0));
        let gate = Arc::new(Notify::new());

        let pool_clone = Arc::clone(&pool);
        let gate_clone = Arc::clone(&gate);
        let busy = tokio::spawn(async move {
            pool_clone
                .submit(async move { gate_clone.notified().await }, None, true)
                .await
        });

        while pool.running_workers() == 0 {
            tokio::task::yield_now().await;
        }

        let error = pool.submit(async {}, None, true).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Exhausted {
                capacity: 1,
                max_blocks: 0
            }
        ));

        gate.notify_one();
        busy.await.unwrap().unwrap();
    }

    async fn broken_task() {
        panic!("broken task");
    }

    #[tokio::test]
    async fn task_panic_is_reported_and_worker_survives() {
        let pool = pool(1, 0);

        let error = pool.submit(broken_task(), None, true).await.unwrap_err();
        assert!(matches!(error, Error::TaskFailed { ref message } if message == "broken task"));

        tokio::task::yield_now().await;

        assert_eq!(pool.running_workers(), 1);
        assert_eq!(pool.submit(async { 3 }, None, true).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stop_rejects_new_tasks_and_stops_idle_workers() {
        let pool = pool(2, 0);
        pool.submit(async {}, None, true).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(pool.idle_workers(), 1);

        pool.stop();

        assert!(!pool.is_running());
        assert_eq!(pool.idle_workers(), 0);
        assert_eq!(pool.running_workers(), 0);
        assert!(matches!(
            pool.submit(async {}, None, true).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn worker_released_after_stop_is_stopped() {
        let pool = pool(1, 0);
        let worker = pool.shared.acquire(None).await.unwrap();

        pool.stop();
        pool.shared.release(worker.clone());

        assert!(!worker.is_running());
        assert_eq!(pool.idle_workers(), 0);
        assert_eq!(pool.running_workers(), 0);
    }

    #[tokio::test]
    async fn acquire_after_stop_spawns_no_worker() {
        let pool = pool(2, 4);

        pool.stop();

        assert!(matches!(
            pool.shared.acquire(None).await,
            Err(Error::Closed)
        ));
        assert_eq!(pool.running_workers(), 0);
    }

    #[tokio::test]
    async fn acquire_after_stop_does_not_wait_for_busy_workers() {
        let pool = pool(1, 4);
        let busy = pool.shared.acquire(None).await.unwrap();

        pool.stop();

        assert!(matches!(
            pool.shared.acquire(None).await,
            Err(Error::Closed)
        ));
        assert_eq!(pool.waiting_acquirers(), 0);

        pool.shared.release(busy.clone());
        assert!(!busy.is_running());
        assert_eq!(pool.running_workers(), 0);
    }

    #[tokio::test]
    async fn release_racing_stop_never_strands_a_worker() {
        for _ in 0..200 {
            let pool = Arc::new(pool(1, 0));
            let worker = pool.shared.acquire(None).await.unwrap();
            let start = Arc::new(std::sync::Barrier::new(2));

            let releaser = std::thread::spawn({
                let shared = Arc::clone(&pool.shared);
                let worker = worker.clone();
                let start = Arc::clone(&start);

                move || {
                    start.wait();
                    shared.release(worker);
                }
            });

            let stopper = std::thread::spawn({
                let pool = Arc::clone(&pool);
                let start = Arc::clone(&start);

                move || {
                    start.wait();
                    pool.stop();
                }
            });

            releaser.join().unwrap();
            stopper.join().unwrap();

            assert!(!worker.is_running());
            assert_eq!(pool.idle_workers(), 0);
            assert_eq!(pool.running_workers(), 0);
        }
    }

    #[tokio::test]
    async fn pre_spawn_fills_the_pool() {
        let pool = WorkerPool::builder()
            .capacity(3)
            .pre_spawn(true)
            .no_gc()
            .build()
            .unwrap();

        assert_eq!(pool.running_workers(), 3);
        assert_eq!(pool.idle_workers(), 3);
    }
}
