//! Task wrappers for executing caller-provided futures on workers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

/// A unit of work that can be submitted to a [`WorkerPool`][1].
///
/// [1]: crate::WorkerPool
pub trait Task: Send + 'static {
    /// The value produced by the task.
    type Output: Send + 'static;

    /// Whether the task runs inline on the worker's own loop.
    ///
    /// Asynchronous tasks are spawned as a child task that the worker awaits, so they get their
    /// own scheduling slot but the worker stays occupied until they finish either way.
    fn synchronous(&self) -> bool {
        true
    }

    /// Converts the task into the future that performs the work.
    fn run(self) -> BoxFuture<'static, Self::Output>;
}

/// A [`Task`] built from a future, as submitted via [`WorkerPool::submit()`][1].
///
/// [1]: crate::WorkerPool::submit
#[derive(Debug)]
pub struct Job<F> {
    future: F,
    synchronous: bool,
}

impl<F> Job<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    /// Wraps a future into a task.
    #[must_use]
    pub fn new(future: F, synchronous: bool) -> Self {
        Self {
            future,
            synchronous,
        }
    }
}

impl<F> Task for Job<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    type Output = F::Output;

    fn synchronous(&self) -> bool {
        self.synchronous
    }

    fn run(self) -> BoxFuture<'static, Self::Output> {
        self.future.boxed()
    }
}

/// The outcome of a task; the error carries the panic message of a failed task.
pub(crate) type TaskResult<R> = Result<R, String>;

/// What travels through a worker mailbox: the task plus the delivery of its outcome.
pub(crate) type Envelope = BoxFuture<'static, ()>;

pub(crate) fn wrap_task<T>(task: T, sender: oneshot::Sender<TaskResult<T::Output>>) -> Envelope
where
    T: Task,
{
    let synchronous = task.synchronous();
    let work = task.run();

    async move {
        let result = if synchronous {
            AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .map_err(|payload| format_panic_payload(&*payload))
        } else {
            tokio::spawn(work).await.map_err(|error| {
                if error.is_panic() {
                    format_panic_payload(&*error.into_panic())
                } else {
                    "task was cancelled before it completed".to_string()
                }
            })
        };

        if let Err(message) = &result {
            tracing::warn!(panic_message = %message, "task panicked on worker");
        }

        // The submitter may have stopped waiting, in which case nobody needs the outcome.
        drop(sender.send(result));
    }
    .boxed()
}

/// Formats a panic payload for reporting.
fn format_panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
