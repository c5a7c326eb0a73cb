//! Example from the README.
//!
//! Run with `RUST_LOG=rendezvous=debug` to see barrier generations and shared calls.

use std::convert::Infallible;
use std::time::Duration;

use rendezvous::{BarrierError, await_on_counter, single_flight_yield};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Three tasks start their work only once all of them are ready.
    let runners = (1..=3_u64)
        .map(|id| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20 * id)).await;
                println!("runner {id} is ready");

                await_on_counter("race", 3, None).await.unwrap();
                println!("runner {id} is off");
            })
        })
        .collect::<Vec<_>>();

    for runner in runners {
        runner.await.unwrap();
    }

    // A lone runner gives up after a while.
    match await_on_counter("race", 3, Some(Duration::from_millis(50))).await {
        Err(BarrierError::Timeout { waited, .. }) => println!("gave up after {waited:?}"),
        other => println!("unexpected outcome: {other:?}"),
    }

    // Five lookups of the same key share one slow fetch.
    let lookups = (0..5)
        .map(|i| {
            tokio::spawn(async move {
                let value = single_flight_yield(
                    "settings",
                    || async {
                        println!("fetching settings");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, Infallible>("dark-mode=on".to_string())
                    },
                    None,
                )
                .await
                .unwrap();

                println!("lookup {i} got {value}");
            })
        })
        .collect::<Vec<_>>();

    for lookup in lookups {
        lookup.await.unwrap();
    }
}
