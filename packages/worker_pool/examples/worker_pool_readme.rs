//! Example from the README.
//!
//! Run with `RUST_LOG=worker_pool=debug` to see workers being started, reused and evicted.

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use worker_pool::{Error, PoolType, WorkerPool};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let pool = WorkerPool::builder()
        .pool_type(PoolType::Stack)
        .capacity(2)
        .max_blocks(0)
        .gc_interval(Duration::from_millis(200))
        .build()
        .unwrap();

    let answer = pool.submit(async { 6 * 7 }, None, true).await.unwrap();
    println!("the answer is {answer}");

    let slow = pool.submit(
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "slow"
        },
        None,
        false,
    );
    let fast = pool.submit(async { "fast" }, None, false);
    let (slow, fast) = tokio::join!(slow, fast);
    println!("{} then {}", fast.unwrap(), slow.unwrap());

    println!(
        "{} workers running, {} idle",
        pool.running_workers(),
        pool.idle_workers()
    );

    // Idle workers are evicted after a full GC interval without work.
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("{} workers running after idling", pool.running_workers());

    pool.stop();

    match pool.submit(async {}, None, true).await {
        Err(Error::Closed) => println!("pool is closed"),
        other => println!("unexpected outcome: {other:?}"),
    }
}
