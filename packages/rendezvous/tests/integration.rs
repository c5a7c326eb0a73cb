//! Integration tests for barriers and single-flight calls through the process-wide entry points.
//!
//! Tests run concurrently within the same process, so each one uses its own keys.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use rendezvous::{
    BarrierError, Barriers, BreakReason, FlightError, SingleFlight, await_on_counter,
    single_flight_yield,
};
use testing::{run_local, run_multi_thread};
use tokio::time::{Instant, sleep};

#[test]
fn parties_are_released_together() {
    run_local(|| async {
        let start = Instant::now();

        let arrivals = (0..3_u64)
            .map(|i| {
                tokio::spawn(async move {
                    sleep(Duration::from_millis(10 * i)).await;
                    await_on_counter("released-together", 3, None).await.unwrap();
                    start.elapsed()
                })
            })
            .collect::<Vec<_>>();

        let mut released_at = Vec::new();
        for arrival in arrivals {
            released_at.push(arrival.await.unwrap());
        }

        // Nobody gets through before the last party arrives.
        assert!(released_at[0] >= Duration::from_millis(20));
        assert!(released_at.iter().all(|at| *at == released_at[0]));

        assert!(
            Barriers::global()
                .current("released-together", 3)
                .is_none()
        );
    });
}

#[test]
fn fourth_caller_starts_a_new_generation() {
    run_local(|| async {
        let first_generation = (0..3)
            .map(|_| tokio::spawn(await_on_counter("generations", 3, None)))
            .collect::<Vec<_>>();

        for caller in first_generation {
            caller.await.unwrap().unwrap();
        }

        // Alone in the new generation, the fourth caller can only time out.
        let error = await_on_counter("generations", 3, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(error, BarrierError::Timeout { .. }));

        // A broken generation does not affect the next one either.
        let second_generation = (0..3)
            .map(|_| tokio::spawn(await_on_counter("generations", 3, None)))
            .collect::<Vec<_>>();

        for caller in second_generation {
            caller.await.unwrap().unwrap();
        }
    });
}

#[test]
fn timed_out_party_breaks_the_generation() {
    run_local(|| async {
        let patient = (0..2)
            .map(|_| tokio::spawn(await_on_counter("breaks", 4, None)))
            .collect::<Vec<_>>();

        sleep(Duration::from_millis(1)).await;

        let impatient = await_on_counter("breaks", 4, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(
            impatient,
            BarrierError::Timeout { waited, .. } if waited == Duration::from_millis(50)
        ));

        for caller in patient {
            let error = caller.await.unwrap().unwrap_err();
            assert!(matches!(
                error,
                BarrierError::Broken {
                    ref key,
                    parties: 4,
                    reason: BreakReason::TimedOut,
                } if key == "breaks"
            ));
        }

        assert!(Barriers::global().current("breaks", 4).is_none());
    });
}

#[test]
fn barrier_holds_under_parallelism() {
    const PARTIES: usize = 4;
    const ROUNDS: usize = 25;

    run_multi_thread(4, || async {
        let barriers = Arc::new(Barriers::new());
        let passed = Arc::new(AtomicUsize::new(0));

        let callers = (0..PARTIES * ROUNDS)
            .map(|_| {
                let barriers = Arc::clone(&barriers);
                let passed = Arc::clone(&passed);

                tokio::spawn(async move {
                    barriers.await_on_counter("parallel", PARTIES, None).await.unwrap();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        for caller in callers {
            caller.await.unwrap();
        }

        assert_eq!(passed.load(Ordering::SeqCst), PARTIES * ROUNDS);
        assert!(barriers.is_empty());
    });
}

#[derive(Debug)]
struct Unavailable;

#[test]
fn concurrent_calls_execute_once() {
    run_local(|| async {
        let counter = Arc::new(AtomicU32::new(0));

        let calls = (0..5)
            .map(|_| {
                let counter = Arc::clone(&counter);

                tokio::spawn(async move {
                    single_flight_yield(
                        "execute-once",
                        || async move {
                            sleep(Duration::from_millis(100)).await;
                            Ok::<_, Unavailable>(counter.fetch_add(1, Ordering::SeqCst) + 1)
                        },
                        None,
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), 1);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!SingleFlight::<u32, Unavailable>::global().is_in_flight("execute-once"));
    });
}

#[test]
fn waiters_observe_the_same_failure() {
    run_local(|| async {
        let executions = Arc::new(AtomicU32::new(0));

        let calls = (0..5)
            .map(|_| {
                let executions = Arc::clone(&executions);

                tokio::spawn(async move {
                    single_flight_yield(
                        "shared-failure",
                        || async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(100)).await;
                            Err::<u64, _>(Unavailable)
                        },
                        None,
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();

        let mut original = None;
        let mut coalesced = Vec::new();

        for call in calls {
            match call.await.unwrap().unwrap_err() {
                FlightError::Failed(error) => {
                    assert!(original.replace(error).is_none(), "only one caller runs the processor");
                }
                FlightError::Coalesced(error) => coalesced.push(error),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        let original = original.expect("one caller must run the processor");
        assert_eq!(coalesced.len(), 4);
        assert!(coalesced.iter().all(|error| Arc::ptr_eq(error, &original)));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn result_types_do_not_coalesce() {
    run_local(|| async {
        let number = single_flight_yield("typed", || async { Ok::<u8, Unavailable>(1) }, None);
        let text = single_flight_yield(
            "typed",
            || async { Ok::<String, Unavailable>("one".to_string()) },
            None,
        );

        let (number, text) = tokio::join!(number, text);

        assert_eq!(number.unwrap(), 1);
        assert_eq!(text.unwrap(), "one");
    });
}
