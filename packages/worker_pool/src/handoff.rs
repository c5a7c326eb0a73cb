//! Direct handoff of values from releasers to suspended acquirers.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

/// A rendezvous point where a released value is handed straight to a caller that is waiting for
/// one, bypassing any storage.
///
/// Waiters are served in the order they started waiting. A waiter that gave up (timed out or was
/// dropped) no longer counts as waiting and is skipped when a value is offered.
pub(crate) struct Handoff<T> {
    waiters: VecDeque<oneshot::Sender<T>>,
}

impl<T> Handoff<T> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// The number of callers currently waiting for a value.
    pub(crate) fn waiting(&mut self) -> usize {
        self.waiters.retain(|sender| !sender.is_closed());
        self.waiters.len()
    }

    /// Registers a new waiter.
    ///
    /// If the waiter is dropped while a value is already on its way to it, the value is passed to
    /// `on_orphan` instead of being lost.
    pub(crate) fn wait(&mut self, on_orphan: impl FnOnce(T) + Send + 'static) -> Waiter<T> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push_back(sender);

        Waiter {
            receiver,
            on_orphan: Some(Box::new(on_orphan)),
        }
    }

    /// Hands the value to the longest-waiting caller.
    ///
    /// # Errors
    ///
    /// Returns the value back if nobody is waiting for it.
    pub(crate) fn offer(&mut self, value: T) -> Result<(), T> {
        let mut value = value;

        while let Some(sender) = self.waiters.pop_front() {
            match sender.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }

        Err(value)
    }

    /// Disconnects all waiters, who will observe [`WaitError::Closed`].
    pub(crate) fn close(&mut self) {
        self.waiters.clear();
    }
}

impl<T> fmt::Debug for Handoff<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum WaitError {
    Timeout(Duration),
    Closed,
}

/// One caller waiting for a value from a [`Handoff`].
pub(crate) struct Waiter<T> {
    receiver: oneshot::Receiver<T>,
    on_orphan: Option<Box<dyn FnOnce(T) + Send>>,
}

impl<T> Waiter<T> {
    /// Waits for a value, for at most `timeout` if one is given.
    pub(crate) async fn recv(mut self, timeout: Option<Duration>) -> Result<T, WaitError> {
        let Some(limit) = timeout else {
            return (&mut self.receiver)
                .await
                .map_err(|_disconnected| WaitError::Closed);
        };

        match tokio::time::timeout(limit, &mut self.receiver).await {
            Ok(received) => received.map_err(|_disconnected| WaitError::Closed),
            Err(_elapsed) => {
                // A value may have been handed over in the same instant the timer fired. Closing
                // first guarantees nothing else can arrive after we check.
                self.receiver.close();
                self.receiver
                    .try_recv()
                    .map_err(|_empty| WaitError::Timeout(limit))
            }
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.receiver.close();

        if let Ok(value) = self.receiver.try_recv() {
            if let Some(on_orphan) = self.on_orphan.take() {
                on_orphan(value);
            }
        }
    }
}

impl<T> fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").finish_non_exhaustive()
    }
}
