use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when pooling values or running tasks on a [`WorkerPool`][1].
///
/// [1]: crate::WorkerPool
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The worker pool configuration was rejected when building the pool.
    #[error("invalid worker pool configuration: {problem}")]
    InvalidConfig {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// An operation was attempted outside the context it requires.
    #[error("misuse: {problem}")]
    Misuse {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// A value was inserted into a pool that is already at capacity.
    #[error("pool capacity exceeded: {capacity}")]
    Capacity {
        /// The capacity of the pool that rejected the value.
        capacity: usize,
    },

    /// The referenced value is not in the pool or list it was removed from.
    #[error("the referenced value is not resident in this collection")]
    NotResident,

    /// No worker was available and the caller was not allowed to wait for one.
    #[error("worker pool exhausted (capacity {capacity}, max blocked callers {max_blocks})")]
    Exhausted {
        /// The capacity of the worker pool.
        capacity: usize,

        /// How many callers may wait for a worker at the same time.
        max_blocks: usize,
    },

    /// Waiting for a worker took longer than the caller allowed.
    #[error("waiting for an available worker timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The worker pool has been stopped and accepts no more tasks.
    #[error("worker pool closed, cannot submit task")]
    Closed,

    /// The task panicked while running on a worker.
    #[error("task failed: {message}")]
    TaskFailed {
        /// The panic message of the task, if it could be extracted.
        message: String,
    },
}

/// A specialized `Result` type for worker pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
