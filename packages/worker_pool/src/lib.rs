#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Worker pool that bounds how many tasks run at once and reclaims workers that sit idle.
//!
//! Tasks are futures executed by long-lived workers, each of which is a tokio task reading from
//! its own mailbox. Idle workers wait in a [`Pool`] that hands them out either first-in-first-out
//! or last-in-first-out, and a background loop evicts workers that have been idle for too long.
//!
//! # Quick start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use worker_pool::{Error, WorkerPool};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = WorkerPool::builder()
//!     .capacity(2)
//!     .max_blocks(0)
//!     .gc_interval(Duration::from_secs(60))
//!     .build()
//!     .unwrap();
//!
//! let value = pool.submit(async { 42 }, None, true).await.unwrap();
//! assert_eq!(value, 42);
//!
//! pool.stop();
//! assert!(matches!(pool.submit(async {}, None, true).await, Err(Error::Closed)));
//! # }
//! ```
//!
//! # Acquiring a worker
//!
//! A submission takes an idle worker if there is one. Otherwise, if fewer workers are running than
//! the capacity allows, it spawns a new one. Otherwise it waits for a busy worker to be released,
//! provided fewer than `max_blocks` callers are already waiting; if not, it fails with
//! [`Error::Exhausted`] immediately. A worker finishing a task is handed straight to the
//! longest-waiting caller, bypassing the pool.
//!
//! # Building blocks
//!
//! The pool is assembled from pieces that are usable on their own:
//!
//! * [`PooledList`] - a doubly-linked list with stable [`NodeHandle`]s for O(1) removal.
//! * [`IdleHeap`] - a min-heap of keys ordered by when they were last active.
//! * [`Pool`] - a capacity-bounded, queue- or stack-ordered collection that evicts idle
//!   [`PoolItem`]s in ascending idle order.
//!
//! # Panics
//!
//! A panicking task does not take its worker down. The panic is captured and reported to the
//! submitter as [`Error::TaskFailed`].

mod builder;
mod error;
mod handoff;
mod heap;
mod list;
mod pool;
mod task;
mod worker;
mod worker_pool;

pub use builder::*;
pub use error::*;
pub(crate) use handoff::*;
pub use heap::*;
pub use list::*;
pub use pool::*;
pub use task::*;
pub(crate) use worker::*;
pub use worker_pool::*;
