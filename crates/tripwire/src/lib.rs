// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Circuit breaking for unreliable asynchronous operations.
//!
//! This crate wraps a fallible async operation (typically a remote call) in
//! a [`Breaker`] that protects callers from cascading failure:
//!
//! - **Rolling health statistics**: outcomes are tallied in a bucketed
//!   sliding window with O(1) error-rate queries.
//! - **Short-circuiting**: when the overall error rate, or the rate of a
//!   specific named fault, crosses its threshold, calls fail fast with
//!   [`Error::Rejected`] instead of piling onto a struggling dependency.
//! - **Bounded concurrency**: an optional limit on in-flight calls with a
//!   strictly FIFO admission queue.
//! - **Per-call timeouts**: each admitted call races a timeout; late
//!   results are discarded.
//! - **Recovery probing**: after a configurable reset time a single probe
//!   call is admitted; success closes the circuit and clears the error
//!   history.
//! - **Reporting**: on an independent cadence the breaker emits immutable
//!   [`IntervalSnapshot`]s, which [`Observer`] can batch across breakers
//!   and [`StatsCollector`] can fold into rolling summaries.
//!
//! # Runtime Agnostic Design
//!
//! The breaker never talks to an async runtime directly: all time reads and
//! timers go through [`tick::Clock`], and its periodic tasks are spawned
//! through [`anyspawn::Spawner`]. Tests drive time deterministically with
//! `tick::ClockControl`.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use anyspawn::Spawner;
//! use tick::Clock;
//! use tripwire::{Breaker, Fault};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = Clock::new_tokio();
//! let spawner = Spawner::new_tokio();
//!
//! let breaker = Breaker::builder(&clock, &spawner)
//!     .name("upstream")
//!     .timeout(Duration::from_millis(500))
//!     .error_threshold(0.2)
//!     .concurrency_limit(16)
//!     .named_fault_threshold("ServiceUnavailable", 0.0)
//!     .classify_with(|response: &Result<String, String>, _| match response {
//!         Ok(body) if body.contains("503") => Some(Fault::new("ServiceUnavailable")),
//!         Ok(_) => None,
//!         Err(message) => Some(Fault::new("TransportError").with_message(message.clone())),
//!     })
//!     .protect(|request: String| async move { fetch(request).await })?;
//!
//! match breaker.execute("GET /".to_string()).await {
//!     Ok(response) => println!("ok: {response:?}"),
//!     Err(error) => println!("failed fast: {error}"),
//! }
//! # Ok(())
//! # }
//! # async fn fetch(request: String) -> Result<String, String> { Ok(request) }
//! ```
//!
//! See the [`breaker`] module documentation for the state machine,
//! admission, and reporting semantics.

pub mod breaker;
#[doc(inline)]
pub use breaker::{
    Breaker, BreakerBuilder, CallArgs, ClassifyArgs, IntervalReceiver, NotSet, OPEN_CIRCUIT_FAULT, Set, TIMEOUT_FAULT,
};

mod counts;
pub use counts::Counts;

mod error;
pub use error::{ConfigError, Error, Fault, FaultName};

mod interval;
pub use interval::IntervalSnapshot;

mod observer;
pub use observer::{Batch, Observer};

mod state;
pub use state::State;

mod stats;
pub use stats::{CountsSummary, HealthSummary, LatencySummary, StatsCollector, StatsOptions, Summary};

pub(crate) mod utils;
