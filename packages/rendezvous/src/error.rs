use std::sync::Arc;
use std::time::Duration;

/// Why a barrier generation broke before all parties arrived.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BreakReason {
    /// A waiter gave up after its timeout elapsed.
    TimedOut,

    /// A waiter stopped waiting without timing out, for example because its future was dropped.
    Abandoned,
}

/// Errors returned when waiting on a [`CounterBarrier`][crate::CounterBarrier].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BarrierError {
    /// The barrier was used incorrectly.
    #[error("barrier misuse: {problem}")]
    Misuse {
        /// What was wrong with the call.
        problem: String,
    },

    /// The generation this caller joined broke before all parties arrived.
    #[error("barrier '{key}' for {parties} parties is broken: {reason:?}")]
    Broken {
        /// The logical key of the barrier.
        key: String,

        /// The number of parties the generation was waiting for.
        parties: usize,

        /// What broke the generation.
        reason: BreakReason,
    },

    /// This caller gave up waiting, which broke the generation for everyone else.
    #[error("timed out after {waited:?} waiting on barrier '{key}'")]
    Timeout {
        /// The logical key of the barrier.
        key: String,

        /// How long the caller waited.
        waited: Duration,
    },
}

/// Errors returned by a [`SingleFlight`][crate::SingleFlight] call.
///
/// The processor's error is shared, not cloned: the caller that ran the processor and every caller
/// that waited on it observe the same allocation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FlightError<E> {
    /// This caller ran the processor and it failed.
    #[error("{0}")]
    Failed(Arc<E>),

    /// Another caller ran the processor for the same key and it failed.
    #[error("an error occurred while waiting for the shared result: {0}")]
    Coalesced(Arc<E>),

    /// No result arrived within the timeout.
    #[error("exceeded maximum waiting time of {waited:?} for the shared result")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The caller running the processor stopped before producing a result, for example because
    /// its future was dropped or the processor panicked.
    #[error("the shared call was abandoned before producing a result")]
    Abandoned,
}

impl<E> FlightError<E> {
    /// The processor's error, whether this caller ran the processor or waited on it.
    #[must_use]
    pub fn processor_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::Failed(error) | Self::Coalesced(error) => Some(error),
            Self::Timeout { .. } | Self::Abandoned => None,
        }
    }
}
