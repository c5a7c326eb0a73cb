//! Cyclic counting barriers identified by a key and a party count.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{BarrierError, BreakReason, Registry};

/// One generation of a counting barrier.
///
/// Callers arrive one by one. When the number of callers waiting reaches the number of parties,
/// all of them are released together and the generation is spent. If any waiter gives up first,
/// the generation breaks and every other waiter is released with [`BarrierError::Broken`].
///
/// Instances are created and recycled by [`Barriers`]; a spent or broken instance is never reused.
pub struct CounterBarrier {
    key: String,
    parties: usize,
    state: Mutex<State>,

    /// Publishes the phase to suspended waiters. Only changed while holding `state`.
    phase: watch::Sender<Phase>,
}

#[derive(Debug)]
struct State {
    phase: Phase,

    /// Callers that arrived and have not yet left.
    waiters: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Open,
    Tripped,
    Broken(BreakReason),
}

impl CounterBarrier {
    fn new(key: &str, parties: usize) -> Self {
        Self {
            key: key.to_owned(),
            parties,
            state: Mutex::new(State {
                phase: Phase::Open,
                waiters: 0,
            }),
            phase: watch::Sender::new(Phase::Open),
        }
    }

    /// The logical key of the barrier.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The number of callers that must arrive to release them all.
    #[must_use]
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// The number of callers that arrived and have not yet left.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Whether the generation broke before all parties arrived.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Broken(_))
    }

    /// Whether all parties arrived and were released.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.state.lock().phase == Phase::Tripped
    }

    /// Whether a new caller must start a new generation instead of joining this one.
    fn is_spent(&self) -> bool {
        let state = self.state.lock();
        state.phase != Phase::Open || state.waiters >= self.parties
    }

    /// Joins the generation, tripping it if this is the last party to arrive.
    ///
    /// Returns `None` if the generation already tripped or broke and can no longer be joined.
    fn arrive(&self) -> Option<Arrival<'_>> {
        let mut state = self.state.lock();

        if state.phase != Phase::Open {
            return None;
        }

        state.waiters = state
            .waiters
            .checked_add(1)
            .expect("waiters never exceed parties, which is a usize");

        let phase = self.phase.subscribe();

        if state.waiters >= self.parties {
            state.phase = Phase::Tripped;
            self.phase.send_replace(Phase::Tripped);

            debug!(key = %self.key, parties = self.parties, "barrier tripped");
        }

        Some(Arrival {
            barrier: self,
            phase,
            left: false,
        })
    }

    fn broken(&self, reason: BreakReason) -> BarrierError {
        BarrierError::Broken {
            key: self.key.clone(),
            parties: self.parties,
            reason,
        }
    }
}

impl fmt::Debug for CounterBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("CounterBarrier")
            .field("key", &self.key)
            .field("parties", &self.parties)
            .field("phase", &state.phase)
            .field("waiters", &state.waiters)
            .finish_non_exhaustive()
    }
}

/// A caller that joined a generation and has not yet left it.
///
/// Leaving while the generation is still open breaks it, which includes dropping the arrival
/// before it finished waiting.
struct Arrival<'a> {
    barrier: &'a CounterBarrier,
    phase: watch::Receiver<Phase>,
    left: bool,
}

impl Arrival<'_> {
    /// Waits until the generation trips or breaks, or until `timeout` elapses.
    async fn wait(mut self, timeout: Option<Duration>) -> Result<(), BarrierError> {
        let barrier = self.barrier;

        trace!(key = %barrier.key, parties = barrier.parties, ?timeout, "waiting on barrier");

        let released = match timeout {
            None => Some(self.phase.wait_for(is_released).await.map(|phase| *phase)),
            Some(limit) => tokio::time::timeout(limit, self.phase.wait_for(is_released))
                .await
                .ok()
                .map(|released| released.map(|phase| *phase)),
        };

        let Some(released) = released else {
            // Timed out, although the generation may have tripped in the same instant.
            return match self.leave(BreakReason::TimedOut) {
                Phase::Tripped => Ok(()),
                Phase::Broken(BreakReason::Abandoned) => {
                    Err(barrier.broken(BreakReason::Abandoned))
                }
                Phase::Open | Phase::Broken(_) => Err(BarrierError::Timeout {
                    key: barrier.key.clone(),
                    waited: timeout.unwrap_or_default(),
                }),
            };
        };

        self.leave(BreakReason::Abandoned);

        match released {
            Ok(Phase::Tripped) => Ok(()),
            Ok(Phase::Broken(reason)) => Err(barrier.broken(reason)),
            // The sender lives as long as the barrier, so the phase cannot go missing.
            Ok(Phase::Open) | Err(_) => Err(barrier.broken(BreakReason::Abandoned)),
        }
    }

    /// Leaves the generation, breaking it for `reason` if it is still open.
    ///
    /// Returns the phase the generation is in once this caller has left.
    fn leave(&mut self, reason: BreakReason) -> Phase {
        if self.left {
            return *self.phase.borrow();
        }

        self.left = true;

        let barrier = self.barrier;
        let mut state = barrier.state.lock();

        state.waiters = state.waiters.saturating_sub(1);

        if state.phase == Phase::Open {
            state.phase = Phase::Broken(reason);
            barrier.phase.send_replace(state.phase);

            debug!(
                key = %barrier.key,
                parties = barrier.parties,
                ?reason,
                "barrier broken"
            );
        }

        state.phase
    }
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        self.leave(BreakReason::Abandoned);
    }
}

fn is_released(phase: &Phase) -> bool {
    *phase != Phase::Open
}

static GLOBAL_BARRIERS: LazyLock<Barriers> = LazyLock::new(Barriers::new);

/// A set of cyclic counting barriers, looked up by key and party count.
///
/// The first caller for a `(key, parties)` pair starts a generation; when `parties` callers have
/// arrived they are all released. The next caller starts a fresh generation. A generation that
/// breaks because a waiter timed out releases its other waiters with an error and is then
/// discarded, so later callers are not affected.
///
/// Barriers with the same key but a different number of parties are independent.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use rendezvous::Barriers;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let barriers = Arc::new(Barriers::new());
///
/// let tasks = (0..3)
///     .map(|_| {
///         let barriers = Arc::clone(&barriers);
///         tokio::spawn(async move { barriers.await_on_counter("start", 3, None).await })
///     })
///     .collect::<Vec<_>>();
///
/// for task in tasks {
///     task.await.unwrap().unwrap();
/// }
///
/// assert!(barriers.is_empty());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Barriers {
    registry: Registry<(String, usize), CounterBarrier>,
}

impl Barriers {
    /// Creates an empty set of barriers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    /// The process-wide set of barriers used by [`await_on_counter()`].
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Returning a fresh instance is only observable across calls.
    pub fn global() -> &'static Self {
        &GLOBAL_BARRIERS
    }

    /// Waits until `parties` callers have arrived on the barrier for `key`.
    ///
    /// `timeout` bounds the wait; `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// * [`BarrierError::Misuse`] if called outside a tokio runtime or with fewer than 2 parties.
    /// * [`BarrierError::Timeout`] if this caller gave up waiting. This breaks the generation.
    /// * [`BarrierError::Broken`] if another waiter of the same generation gave up first.
    pub async fn await_on_counter(
        &self,
        key: &str,
        parties: usize,
        timeout: Option<Duration>,
    ) -> Result<(), BarrierError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BarrierError::Misuse {
                problem: "barriers can only be used inside a tokio runtime".to_string(),
            });
        }

        if parties <= 1 {
            return Err(BarrierError::Misuse {
                problem: format!("parties must be greater than 1, got {parties}"),
            });
        }

        let registry_key = (key.to_owned(), parties);

        loop {
            let (barrier, lease) = self.registry.acquire(
                &registry_key,
                || CounterBarrier::new(key, parties),
                |current| {
                    let spent = current.is_spent();

                    if spent {
                        trace!(key, parties, "starting a new barrier generation");
                    }

                    spent
                },
            );

            // Another caller may have completed the generation since we looked it up.
            let Some(arrival) = barrier.arrive() else {
                continue;
            };

            let result = arrival.wait(timeout).await;

            if barrier.is_broken() && barrier.waiters() == 0 {
                lease.retire(&barrier);
            }

            return result;
        }
    }

    /// The generation that the next caller for `key` and `parties` would join, if one exists.
    #[must_use]
    pub fn current(&self, key: &str, parties: usize) -> Option<Arc<CounterBarrier>> {
        self.registry.latest(&(key.to_owned(), parties))
    }

    /// The number of `(key, parties)` pairs that currently have callers passing through them.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no barrier currently has callers passing through it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

/// Waits on the process-wide barrier for `key` until `parties` callers have arrived.
///
/// See [`Barriers::await_on_counter()`].
///
/// # Errors
///
/// See [`Barriers::await_on_counter()`].
pub async fn await_on_counter(
    key: &str,
    parties: usize,
    timeout: Option<Duration>,
) -> Result<(), BarrierError> {
    Barriers::global()
        .await_on_counter(key, parties, timeout)
        .await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use futures::executor::block_on;
    use static_assertions::assert_impl_all;
    use tokio::task::yield_now;

    use super::*;

    assert_impl_all!(Barriers: Send, Sync);
    assert_impl_all!(CounterBarrier: Send, Sync);

    async fn wait_for_waiters(barriers: &Barriers, key: &str, parties: usize, count: usize) {
        loop {
            if barriers
                .current(key, parties)
                .is_some_and(|barrier| barrier.waiters() >= count)
            {
                return;
            }

            yield_now().await;
        }
    }

    #[test]
    fn outside_runtime_is_misuse() {
        let barriers = Barriers::new();

        let result = block_on(barriers.await_on_counter("k", 2, None));
        assert!(matches!(result, Err(BarrierError::Misuse { .. })));
    }

    #[tokio::test]
    async fn single_party_is_misuse() {
        let barriers = Barriers::new();

        for parties in [0, 1] {
            let result = barriers.await_on_counter("k", parties, None).await;
            assert!(matches!(result, Err(BarrierError::Misuse { .. })));
        }

        assert!(barriers.is_empty());
    }

    #[tokio::test]
    async fn last_arrival_releases_everyone() {
        let barriers = Arc::new(Barriers::new());

        let first = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 2, None).await }
        });

        wait_for_waiters(&barriers, "k", 2, 1).await;
        assert!(!first.is_finished());

        barriers.await_on_counter("k", 2, None).await.unwrap();
        first.await.unwrap().unwrap();

        assert!(barriers.is_empty());
    }

    #[tokio::test]
    async fn party_counts_are_independent() {
        let barriers = Arc::new(Barriers::new());

        let pending = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 3, None).await }
        });

        wait_for_waiters(&barriers, "k", 3, 1).await;

        // A pair on the same key with 2 parties is a different barrier.
        let other = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 2, None).await }
        });
        barriers.await_on_counter("k", 2, None).await.unwrap();
        other.await.unwrap().unwrap();

        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers.current("k", 3).unwrap().waiters(), 1);

        pending.abort();
        drop(pending.await);
        assert!(barriers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_breaks_generation_for_others() {
        let barriers = Arc::new(Barriers::new());

        let patient = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 3, None).await }
        });

        wait_for_waiters(&barriers, "k", 3, 1).await;

        let error = barriers
            .await_on_counter("k", 3, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(error, BarrierError::Timeout { .. }));

        let error = patient.await.unwrap().unwrap_err();
        assert!(matches!(
            error,
            BarrierError::Broken {
                parties: 3,
                reason: BreakReason::TimedOut,
                ..
            }
        ));

        assert!(barriers.is_empty());
    }

    #[tokio::test]
    async fn abandoned_waiter_breaks_generation() {
        let barriers = Arc::new(Barriers::new());

        let abandoned = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 3, None).await }
        });
        let patient = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 3, None).await }
        });

        wait_for_waiters(&barriers, "k", 3, 2).await;

        abandoned.abort();
        drop(abandoned.await);

        let error = patient.await.unwrap().unwrap_err();
        assert!(matches!(
            error,
            BarrierError::Broken {
                reason: BreakReason::Abandoned,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn tripped_generation_cannot_be_joined() {
        let barrier = Arc::new(CounterBarrier::new("k", 2));
        assert!(!barrier.is_spent());

        let first = tokio::spawn({
            let barrier = Arc::clone(&barrier);
            async move {
                let arrival = barrier.arrive().unwrap();
                arrival.wait(None).await
            }
        });

        while barrier.waiters() == 0 {
            yield_now().await;
        }

        barrier.arrive().unwrap().wait(None).await.unwrap();
        first.await.unwrap().unwrap();

        assert!(barrier.is_tripped());
        assert!(barrier.is_spent());
        assert_eq!(barrier.waiters(), 0);
        assert!(barrier.arrive().is_none());
    }

    #[tokio::test]
    async fn next_caller_after_trip_starts_new_generation() {
        let barriers = Arc::new(Barriers::new());

        let first = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 2, None).await }
        });
        wait_for_waiters(&barriers, "k", 2, 1).await;

        let tripped = barriers.current("k", 2).unwrap();
        barriers.await_on_counter("k", 2, None).await.unwrap();
        assert!(tripped.is_tripped());

        let third = tokio::spawn({
            let barriers = Arc::clone(&barriers);
            async move { barriers.await_on_counter("k", 2, None).await }
        });

        let fresh = loop {
            match barriers.current("k", 2) {
                Some(current) if !Arc::ptr_eq(&current, &tripped) && current.waiters() == 1 => {
                    break current;
                }
                _ => yield_now().await,
            }
        };

        assert!(!fresh.is_tripped());
        assert!(!third.is_finished());

        first.await.unwrap().unwrap();

        barriers.await_on_counter("k", 2, None).await.unwrap();
        third.await.unwrap().unwrap();
        assert!(barriers.is_empty());
    }
}
