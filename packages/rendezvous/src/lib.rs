#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Keyed coordination points for async tasks.
//!
//! * [`Barriers`] and [`await_on_counter()`] hold callers back until a given number of them have
//!   arrived under the same key, then release them together. The barrier resets itself for the
//!   next group.
//! * [`SingleFlight`] and [`single_flight_yield()`] let concurrent callers for the same key share
//!   a single execution of an expensive operation.
//!
//! Both are available as explicit instances and as process-wide globals. Keys only occupy memory
//! while callers are using them.
//!
//! # Barrier
//!
//! ```rust
//! use rendezvous::await_on_counter;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let left = tokio::spawn(async { await_on_counter("handshake", 2, None).await });
//! let right = tokio::spawn(async { await_on_counter("handshake", 2, None).await });
//!
//! left.await.unwrap().unwrap();
//! right.await.unwrap().unwrap();
//! # }
//! ```
//!
//! # Single flight
//!
//! ```rust
//! use std::convert::Infallible;
//!
//! use rendezvous::single_flight_yield;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let token = single_flight_yield(
//!     "token",
//!     || async { Ok::<_, Infallible>("secret".to_string()) },
//!     None,
//! )
//! .await
//! .unwrap();
//!
//! assert_eq!(token, "secret");
//! # }
//! ```
//!
//! # Runtime
//!
//! All waiting is done with tokio timers, so the operations must run inside a tokio runtime.
//! Timeouts are given as `Option<Duration>`, where `None` means waiting indefinitely.

mod barrier;
mod error;
mod registry;
mod single_flight;

pub use barrier::*;
pub use error::*;
pub use registry::*;
pub use single_flight::*;
