use std::num::NonZero;
use std::time::Duration;

use crate::{Error, PoolType, Result, WorkerPool};

const DEFAULT_CAPACITY: usize = 64;
const DEFAULT_MAX_BLOCKS: usize = 64;
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(1);

/// The shortest GC interval we will run the eviction loop with.
const MIN_GC_INTERVAL: Duration = Duration::from_millis(1);

/// Builder for configuring a [`WorkerPool`].
///
/// The defaults are: queue ordering, capacity 64, up to 64 blocked callers, idle workers evicted
/// after 1 second and no pre-spawned workers.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use worker_pool::{PoolType, WorkerPool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = WorkerPool::builder()
///     .pool_type(PoolType::Stack)
///     .capacity(8)
///     .max_blocks(0)
///     .gc_interval(Duration::from_secs(30))
///     .pre_spawn(true)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.idle_workers(), 8);
/// # }
/// ```
#[derive(Debug)]
#[must_use]
pub struct WorkerPoolBuilder {
    pool_type: PoolType,

    /// `None` means unbounded.
    capacity: Option<usize>,

    max_blocks: usize,

    /// `None` disables eviction of idle workers.
    gc_interval: Option<Duration>,

    pre_spawn: bool,
}

impl WorkerPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            pool_type: PoolType::default(),
            capacity: Some(DEFAULT_CAPACITY),
            max_blocks: DEFAULT_MAX_BLOCKS,
            gc_interval: Some(DEFAULT_GC_INTERVAL),
            pre_spawn: false,
        }
    }

    /// Sets the order in which idle workers are reused.
    ///
    /// A [`PoolType::Stack`] pool keeps reusing the most recently active workers, which lets the
    /// others go idle long enough to be evicted. A [`PoolType::Queue`] pool spreads tasks evenly.
    pub fn pool_type(mut self, pool_type: PoolType) -> Self {
        self.pool_type = pool_type;
        self
    }

    /// Sets the maximum number of workers. Must be greater than zero.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Removes the limit on the number of workers.
    pub fn unbounded(mut self) -> Self {
        self.capacity = None;
        self
    }

    /// Sets how many callers may wait for a worker at the same time when all workers are busy.
    ///
    /// Zero disables waiting: callers that find no available worker fail immediately with
    /// [`Error::Exhausted`].
    pub fn max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    /// Sets both how often idle workers are looked for and how long a worker must have been idle
    /// to be evicted. A zero interval is raised to 1 millisecond.
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = Some(interval.max(MIN_GC_INTERVAL));
        self
    }

    /// Disables the eviction of idle workers.
    pub fn no_gc(mut self) -> Self {
        self.gc_interval = None;
        self
    }

    /// Whether to spawn the full capacity of workers when the pool is built.
    pub fn pre_spawn(mut self, pre_spawn: bool) -> Self {
        self.pre_spawn = pre_spawn;
        self
    }

    /// Validates the configuration and starts the pool.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if the capacity is zero, or if pre-spawning was requested for an
    ///   unbounded pool.
    /// * [`Error::Misuse`] if the pool needs to start background work (eviction or pre-spawned
    ///   workers) but is not being built inside a tokio runtime.
    pub fn build(self) -> Result<WorkerPool> {
        let capacity = match self.capacity {
            Some(capacity) => Some(NonZero::new(capacity).ok_or_else(|| Error::InvalidConfig {
                problem: "capacity must be greater than zero".to_string(),
            })?),
            None => None,
        };

        if self.pre_spawn && capacity.is_none() {
            return Err(Error::InvalidConfig {
                problem: "cannot pre-spawn workers for an unbounded pool".to_string(),
            });
        }

        let needs_runtime = self.pre_spawn || self.gc_interval.is_some();

        if needs_runtime && tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Misuse {
                problem: "a worker pool with eviction or pre-spawned workers must be built inside \
                          a tokio runtime"
                    .to_string(),
            });
        }

        Ok(WorkerPool::start(
            self.pool_type,
            capacity,
            self.max_blocks,
            self.gc_interval,
            self.pre_spawn,
        ))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        let result = WorkerPool::builder().capacity(0).no_gc().build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn unbounded_pre_spawn_is_rejected() {
        let result = WorkerPool::builder()
            .unbounded()
            .pre_spawn(true)
            .no_gc()
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn gc_outside_runtime_is_misuse() {
        let result = WorkerPool::builder().build();
        assert!(matches!(result, Err(Error::Misuse { .. })));
    }

    #[test]
    fn lazy_pool_without_gc_builds_anywhere() {
        let pool = WorkerPool::builder().capacity(2).no_gc().build().unwrap();

        assert_eq!(pool.capacity(), Some(2));
        assert_eq!(pool.running_workers(), 0);
    }

    #[test]
    fn zero_gc_interval_is_clamped() {
        let builder = WorkerPool::builder().gc_interval(Duration::ZERO);
        assert_eq!(builder.gc_interval, Some(MIN_GC_INTERVAL));
    }

    #[test]
    fn unbounded_pool_reports_no_capacity() {
        let pool = WorkerPool::builder().unbounded().no_gc().build().unwrap();
        assert_eq!(pool.capacity(), None);
    }
}
