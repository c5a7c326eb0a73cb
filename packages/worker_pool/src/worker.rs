//! Long-lived workers that execute tasks from their mailbox.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{Envelope, Idle, Locate, NodeHandle, PoolItem};

/// Invoked with the worker each time it finishes a task.
pub(crate) type OnDone = Arc<dyn Fn(Worker) + Send + Sync>;

/// Handle to a worker task bound to a FIFO mailbox.
///
/// Cloning the handle does not create a new worker. The worker keeps running until it is
/// stopped, at which point its mailbox is closed and its loop exits after the current task.
#[derive(Clone)]
pub(crate) struct Worker {
    state: Arc<WorkerState>,
}

struct WorkerState {
    id: u64,

    /// Taken when the worker is stopped, which closes the mailbox.
    mailbox: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,

    running: AtomicBool,

    active_at: Mutex<Instant>,

    /// The pool node currently holding this worker, if it is idle in a pool.
    node: Mutex<Option<NodeHandle>>,

    /// Shared count of running workers of the owning worker pool.
    live_workers: Arc<AtomicUsize>,
}

impl Worker {
    /// Starts a worker loop on the current tokio runtime.
    ///
    /// The caller must already have counted the worker in `live_workers`.
    pub(crate) fn spawn(id: u64, live_workers: Arc<AtomicUsize>, on_done: OnDone) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let worker = Self {
            state: Arc::new(WorkerState {
                id,
                mailbox: Mutex::new(Some(sender)),
                running: AtomicBool::new(true),
                active_at: Mutex::new(Instant::now()),
                node: Mutex::new(None),
                live_workers,
            }),
        };

        tokio::spawn(worker_loop(worker.clone(), receiver, on_done));
        debug!(worker_id = id, "worker started");

        worker
    }

    pub(crate) fn id(&self) -> u64 {
        self.state.id
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Places a task in the worker's mailbox.
    ///
    /// # Errors
    ///
    /// Returns the task back if the worker has been stopped.
    pub(crate) fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        match &*self.state.mailbox.lock() {
            Some(mailbox) => mailbox.send(envelope).map_err(|rejected| rejected.0),
            None => Err(envelope),
        }
    }

    /// Stops the worker. Idempotent.
    pub(crate) fn stop(&self) {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return;
        }

        drop(self.state.mailbox.lock().take());
        self.state.live_workers.fetch_sub(1, Ordering::AcqRel);

        debug!(worker_id = self.state.id, "worker stopped");
    }

    fn touch(&self) {
        *self.state.active_at.lock() = Instant::now();
    }
}

async fn worker_loop(
    worker: Worker,
    mut mailbox: mpsc::UnboundedReceiver<Envelope>,
    on_done: OnDone,
) {
    while let Some(envelope) = mailbox.recv().await {
        envelope.await;
        worker.touch();

        if !worker.is_running() {
            break;
        }

        trace!(worker_id = worker.id(), "worker finished task");
        on_done(worker.clone());
    }

    trace!(worker_id = worker.id(), "worker loop exiting");
}

impl Idle for Worker {
    fn active_at(&self) -> Instant {
        *self.state.active_at.lock()
    }

    fn stop(&self) {
        Worker::stop(self);
    }
}

impl PoolItem for Worker {
    fn idle(&self) -> Option<&dyn Idle> {
        Some(self)
    }

    fn attach(&self, node: Option<NodeHandle>) {
        *self.state.node.lock() = node;
    }
}

impl Locate for Worker {
    fn node(&self) -> Option<NodeHandle> {
        *self.state.node.lock()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.state.id)
            .field("running", &self.is_running())
            .field("node", &self.node())
            .finish_non_exhaustive()
    }
}
