//! Coalescing of concurrent calls for the same key into a single execution.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use foldhash::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::FlightError;

/// What every caller of one in-flight episode receives: the shared value or the shared error.
type Outcome<T, E> = Result<T, Arc<E>>;

/// Callers suspended on an in-flight call, in arrival order.
type Listeners<T, E> = Vec<oneshot::Sender<Outcome<T, E>>>;

/// Process-wide instances, one per `SingleFlight<T, E>` type.
static GLOBAL_FLIGHTS: LazyLock<Mutex<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>> =
    LazyLock::new(|| Mutex::new(HashMap::default()));

/// Ensures that concurrent calls for the same key execute their processor only once.
///
/// The first caller for a key runs the processor itself. Callers arriving while it is running do
/// not run the processor but wait for its outcome. When the processor completes, every waiting
/// caller receives a clone of the same value, or the same shared error wrapped in
/// [`FlightError::Coalesced`]. The next call for the key after that starts a new execution.
///
/// # Example
///
/// ```rust
/// use std::convert::Infallible;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use rendezvous::SingleFlight;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let flight = Arc::new(SingleFlight::<u32, Infallible>::new());
/// let executions = Arc::new(AtomicU32::new(0));
///
/// let calls = (0..5)
///     .map(|_| {
///         let flight = Arc::clone(&flight);
///         let executions = Arc::clone(&executions);
///
///         tokio::spawn(async move {
///             flight
///                 .run(
///                     "config",
///                     || async move {
///                         tokio::task::yield_now().await;
///                         Ok(executions.fetch_add(1, Ordering::SeqCst) + 1)
///                     },
///                     None,
///                 )
///                 .await
///         })
///     })
///     .collect::<Vec<_>>();
///
/// for call in calls {
///     assert_eq!(call.await.unwrap().unwrap(), 1);
/// }
///
/// assert_eq!(executions.load(Ordering::SeqCst), 1);
/// # }
/// ```
pub struct SingleFlight<T, E> {
    /// Keys with a call in flight, each with the callers waiting for its outcome.
    calls: Mutex<HashMap<String, Listeners<T, E>>>,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone,
{
    /// Creates a gate with no calls in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the outcome of `processor` for `key`, running it only if no call for `key` is
    /// already in flight.
    ///
    /// `timeout` bounds how long to wait for a call that another caller is running; `None` waits
    /// indefinitely. It does not apply when this caller runs the processor itself.
    ///
    /// # Errors
    ///
    /// * [`FlightError::Failed`] if this caller ran the processor and it failed.
    /// * [`FlightError::Coalesced`] if another caller ran the processor and it failed. The error is
    ///   the same allocation that the running caller received.
    /// * [`FlightError::Timeout`] if the in-flight call did not complete within `timeout`.
    /// * [`FlightError::Abandoned`] if the caller running the processor stopped without an outcome.
    pub async fn run<F, Fut>(
        &self,
        key: &str,
        processor: F,
        timeout: Option<Duration>,
    ) -> Result<T, FlightError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let listener = {
            let mut calls = self.calls.lock();

            if let Some(listeners) = calls.get_mut(key) {
                let (sender, receiver) = oneshot::channel();
                listeners.push(sender);
                Some(receiver)
            } else {
                calls.insert(key.to_owned(), Vec::new());
                None
            }
        };

        match listener {
            Some(receiver) => {
                trace!(key, "joining in-flight call");
                Self::wait(key, receiver, timeout).await
            }
            None => self.lead(key, processor).await,
        }
    }

    async fn lead<F, Fut>(&self, key: &str, processor: F) -> Result<T, FlightError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        debug!(key, "starting call");

        let episode = Episode {
            calls: &self.calls,
            key,
            done: false,
        };

        let outcome: Outcome<T, E> = processor().await.map_err(Arc::new);

        let listeners = episode.finish();

        debug!(
            key,
            coalesced = listeners.len(),
            succeeded = outcome.is_ok(),
            "call finished"
        );

        for listener in listeners {
            // A listener that gave up has dropped its receiver, which is fine.
            drop(listener.send(outcome.clone()));
        }

        outcome.map_err(FlightError::Failed)
    }

    async fn wait(
        key: &str,
        receiver: oneshot::Receiver<Outcome<T, E>>,
        timeout: Option<Duration>,
    ) -> Result<T, FlightError<E>> {
        let received = match timeout {
            None => receiver.await,
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    debug!(key, waited = ?limit, "timed out waiting for in-flight call");
                    return Err(FlightError::Timeout { waited: limit });
                }
            },
        };

        match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(FlightError::Coalesced(error)),
            Err(_abandoned) => Err(FlightError::Abandoned),
        }
    }

    /// The number of keys with a call in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether a call for `key` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.calls.lock().contains_key(key)
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
{
    /// The process-wide gate for this result type, used by [`single_flight_yield()`].
    ///
    /// Gates for different `T` or `E` are independent, so the same key can be used for calls with
    /// different result types without them being coalesced.
    #[must_use]
    pub fn global() -> &'static Self {
        let mut flights = GLOBAL_FLIGHTS.lock();

        let flight = *flights
            .entry(TypeId::of::<Self>())
            .or_insert_with(|| {
                let leaked: &'static Self = Box::leak(Box::new(Self::new()));
                leaked
            });

        flight
            .downcast_ref::<Self>()
            .expect("global gates are keyed by their own type id")
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for SingleFlight<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.calls.lock().len())
            .finish()
    }
}

/// Marks a key as in flight while its processor runs.
///
/// If dropped before [`finish()`][Self::finish], for example because the running caller was
/// cancelled, the marker is removed and the waiting callers observe [`FlightError::Abandoned`].
struct Episode<'a, T, E> {
    calls: &'a Mutex<HashMap<String, Listeners<T, E>>>,
    key: &'a str,
    done: bool,
}

impl<T, E> Episode<'_, T, E> {
    /// Removes the in-flight marker and returns the callers that joined before it was removed.
    ///
    /// No caller can join after this point, so the returned set is final.
    fn finish(mut self) -> Listeners<T, E> {
        self.done = true;
        self.calls.lock().remove(self.key).unwrap_or_default()
    }
}

impl<T, E> Drop for Episode<'_, T, E> {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let abandoned = self.calls.lock().remove(self.key);

        debug!(
            key = self.key,
            waiting = abandoned.as_ref().map_or(0, Vec::len),
            "call abandoned"
        );
    }
}

/// Runs `processor` for `key` through the process-wide gate for its result type.
///
/// See [`SingleFlight::run()`].
///
/// # Errors
///
/// See [`SingleFlight::run()`].
pub async fn single_flight_yield<T, E, F, Fut>(
    key: &str,
    processor: F,
    timeout: Option<Duration>,
) -> Result<T, FlightError<E>>
where
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    SingleFlight::<T, E>::global()
        .run(key, processor, timeout)
        .await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};

    use static_assertions::assert_impl_all;
    use tokio::sync::Notify;
    use tokio::task::{JoinHandle, yield_now};

    use super::*;

    assert_impl_all!(SingleFlight<String, std::io::Error>: Send, Sync);

    #[derive(Debug)]
    struct Failure(u32);

    /// Starts a call that only completes once `gate` is notified.
    fn gated_call(
        flight: &Arc<SingleFlight<u32, Failure>>,
        gate: &Arc<Notify>,
        outcome: Result<u32, u32>,
    ) -> JoinHandle<Result<u32, FlightError<Failure>>> {
        let flight = Arc::clone(flight);
        let gate = Arc::clone(gate);

        tokio::spawn(async move {
            flight
                .run(
                    "k",
                    || async move {
                        gate.notified().await;
                        outcome.map_err(Failure)
                    },
                    None,
                )
                .await
        })
    }

    async fn wait_until_in_flight(flight: &SingleFlight<u32, Failure>) {
        while !flight.is_in_flight("k") {
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn waiters_share_the_result() {
        let flight = Arc::new(SingleFlight::new());
        let gate = Arc::new(Notify::new());

        let leader = gated_call(&flight, &gate, Ok(7));
        wait_until_in_flight(&flight).await;

        let followers = (0..3)
            .map(|_| gated_call(&flight, &gate, Ok(99)))
            .collect::<Vec<_>>();

        for _ in 0..10 {
            yield_now().await;
        }

        gate.notify_one();

        assert_eq!(leader.await.unwrap().unwrap(), 7);
        for follower in followers {
            assert_eq!(follower.await.unwrap().unwrap(), 7);
        }

        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_is_shared_not_copied() {
        let flight = Arc::new(SingleFlight::new());
        let gate = Arc::new(Notify::new());

        let leader = gated_call(&flight, &gate, Err(13));
        wait_until_in_flight(&flight).await;
        let follower = gated_call(&flight, &gate, Ok(1));

        for _ in 0..10 {
            yield_now().await;
        }

        gate.notify_one();

        let FlightError::Failed(original) = leader.await.unwrap().unwrap_err() else {
            panic!("the running caller must receive its own error");
        };
        let FlightError::Coalesced(shared) = follower.await.unwrap().unwrap_err() else {
            panic!("a waiting caller must receive a coalesced error");
        };

        assert_eq!(original.0, 13);
        assert!(Arc::ptr_eq(&original, &shared));
    }

    #[tokio::test]
    async fn next_call_after_completion_runs_again() {
        let flight = SingleFlight::<u32, Infallible>::new();
        let executions = AtomicU32::new(0);

        for expected in 1..=3 {
            let value = flight
                .run(
                    "k",
                    || async { Ok(executions.fetch_add(1, Ordering::SeqCst) + 1) },
                    None,
                )
                .await
                .unwrap();

            assert_eq!(value, expected);
            assert!(!flight.is_in_flight("k"));
        }
    }

    #[tokio::test]
    async fn keys_do_not_coalesce() {
        let flight = SingleFlight::<&'static str, Infallible>::new();

        let a = flight.run("a", || async { Ok("a") }, None);
        let b = flight.run("b", || async { Ok("b") }, None);

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out() {
        let flight = Arc::new(SingleFlight::new());
        let gate = Arc::new(Notify::new());

        let leader = gated_call(&flight, &gate, Ok(1));
        wait_until_in_flight(&flight).await;

        let error = flight
            .run("k", || async { Ok(2) }, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            FlightError::Timeout { waited } if waited == Duration::from_secs(1)
        ));

        // The timed-out waiter does not disturb the call in flight.
        gate.notify_one();
        assert_eq!(leader.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_leader_abandons_waiters() {
        let flight = Arc::new(SingleFlight::new());
        let gate = Arc::new(Notify::new());

        let leader = gated_call(&flight, &gate, Ok(1));
        wait_until_in_flight(&flight).await;
        let follower = gated_call(&flight, &gate, Ok(2));

        for _ in 0..10 {
            yield_now().await;
        }

        leader.abort();
        drop(leader.await);

        assert!(matches!(
            follower.await.unwrap(),
            Err(FlightError::Abandoned)
        ));
        assert!(!flight.is_in_flight("k"));
    }

    #[test]
    fn global_gates_are_per_type() {
        let numbers = SingleFlight::<u32, Infallible>::global();
        let same_numbers = SingleFlight::<u32, Infallible>::global();
        let strings = SingleFlight::<String, Infallible>::global();

        assert!(std::ptr::eq(numbers, same_numbers));
        assert!(!std::ptr::addr_eq(
            std::ptr::from_ref(numbers),
            std::ptr::from_ref(strings)
        ));
    }
}
