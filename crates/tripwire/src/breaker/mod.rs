// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The circuit breaker engine.
//!
//! A [`Breaker`] wraps an unreliable asynchronous operation and protects
//! callers from cascading failure. It tracks outcomes in a rolling health
//! window, short-circuits calls when the measured error rate crosses a
//! threshold, bounds the number of concurrent in-flight calls with a FIFO
//! queue, enforces a per-call timeout, and probes recovery with a single
//! trial call after a configurable reset time.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use anyspawn::Spawner;
//! use tick::Clock;
//! use tripwire::{Breaker, Fault};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = Clock::new_frozen();
//! let spawner = Spawner::new_tokio();
//!
//! let breaker = Breaker::builder(&clock, &spawner)
//!     .name("echo")
//!     .timeout(Duration::from_millis(500))
//!     .error_threshold(0.5)
//!     .classify_with(|output: &Result<String, String>, _| {
//!         output
//!             .as_ref()
//!             .err()
//!             .map(|message| Fault::new("EchoError").with_message(message.clone()))
//!     })
//!     .protect(|request: String| async move { Ok(request) })?;
//!
//! let response = breaker.execute("hello".to_string()).await?;
//! assert_eq!(response, Ok("hello".to_string()));
//! # Ok(())
//! # }
//! ```
//!
//! # States
//!
//! The circuit state is *derived*: it is recomputed from the rolling window,
//! the last-fault timestamp, and the configuration on every query, never
//! stored.
//!
//! ```text
//! ┌────────┐   error rate reaches a threshold    ┌──────────┐
//! │ Closed │ ───────────────────────────────────▶│   Open   │
//! └────────┘                                     └──────────┘
//!      ▲                                               │
//!      │ probe            ┌────────────┐               │ reset time
//!      │ succeeds         │ Half-Open  │◀──────────────┘ elapses
//!      └──────────────────└────────────┘
//! ```
//!
//! - **Closed**: calls are admitted; outcomes feed the window.
//! - **Open**: calls are rejected without invoking the operation. Each
//!   rejection is recorded as a fault, which keeps the measured error rate
//!   up: the circuit is sticky until the reset time elapses. Rejections do
//!   not push the reset clock forward.
//! - **Half-Open**: one probe call is admitted. Success clears the entire
//!   window and closes the circuit; failure reopens it for another reset
//!   period.
//!
//! # Admission and concurrency
//!
//! When a concurrency limit is set and all slots are taken, calls queue in
//! FIFO order. A finishing call hands its slot directly to the oldest
//! waiter, so the active-call count never exceeds the limit. The dequeued
//! call re-enters admission against the *current* state and can still be
//! rejected if the circuit opened in the meantime.
//!
//! # Timeouts
//!
//! An admitted call races its operation against the configured timeout.
//! Whichever side finishes first decides the outcome, exactly once: when
//! the timeout wins, the engine stops waiting and the operation's result is
//! discarded.
//!
//! # Reporting
//!
//! Two periodic processes run per breaker, started lazily on the first call
//! (or eagerly via [`Breaker::start`]) and stopped by [`Breaker::stop`] or
//! drop: the window roll (cadence = bucket size) and the interval rollover
//! (cadence = interval size), which pushes an [`IntervalSnapshot`] to every
//! [`subscriber`][Breaker::subscribe].
//!
//! # Defaults
//!
//! | Parameter | Default | Configured by |
//! |-----------|---------|---------------|
//! | Timeout | 3 s | [`timeout`][BreakerBuilder::timeout] |
//! | Reset time | 1 s | [`reset_time`][BreakerBuilder::reset_time] |
//! | Volume threshold | 10 calls | [`volume_threshold`][BreakerBuilder::volume_threshold] |
//! | Error threshold | 0.05 | [`error_threshold`][BreakerBuilder::error_threshold] |
//! | Named thresholds | none | [`named_fault_threshold`][BreakerBuilder::named_fault_threshold] |
//! | Concurrency limit | unbounded | [`concurrency_limit`][BreakerBuilder::concurrency_limit] |
//! | Window shape | 10 × 1 s | [`window_bucket_size`][BreakerBuilder::window_bucket_size], [`window_bucket_count`][BreakerBuilder::window_bucket_count] |
//! | Interval size | 1 s | [`interval_size`][BreakerBuilder::interval_size] |

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyspawn::Spawner;
use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use futures_util::future::{self, Either};
use tick::{Clock, PeriodicTimer};

mod args;
#[doc(inline)]
pub use args::{CallArgs, ClassifyArgs};

mod builder;
#[doc(inline)]
pub use builder::{BreakerBuilder, NotSet, Set};

mod callbacks;
use callbacks::{ClassifyFault, OnCall, ProtectedOp};

mod constants;
pub use constants::{OPEN_CIRCUIT_FAULT, TIMEOUT_FAULT};
use constants::ERR_POISONED_LOCK;

mod engine;
use engine::{EngineState, ExecutionMode, Options, SlotClaim};

use crate::counts::Counts;
use crate::error::{Error, FaultName};
use crate::interval::IntervalSnapshot;
use crate::state::State;

/// Receives the [`IntervalSnapshot`]s a breaker emits on its reporting
/// cadence.
pub type IntervalReceiver = mpsc::UnboundedReceiver<IntervalSnapshot>;

/// Wraps an unreliable asynchronous operation with circuit breaking,
/// bounded concurrency, and per-call timeouts.
///
/// A breaker exclusively owns its runtime state. It is created once per
/// protected operation via [`Breaker::builder`] and lives until dropped;
/// share it behind an [`Arc`] to call it from several tasks.
///
/// See the [module documentation][self] for semantics and examples.
#[derive(Debug)]
pub struct Breaker<In, Out> {
    pub(crate) shared: Arc<BreakerShared<In, Out>>,
    pub(crate) tasks: Mutex<TaskHandles>,
}

/// Shared pieces of a breaker. Wrapped in an `Arc` so the execute futures
/// and the periodic tasks can outlive individual calls.
#[derive(Debug)]
pub(crate) struct BreakerShared<In, Out> {
    pub(crate) core: Arc<BreakerCore>,
    pub(crate) op: ProtectedOp<In, Out>,
    pub(crate) classify: ClassifyFault<Out>,
    pub(crate) on_call: Option<OnCall<Out>>,
}

/// The non-generic heart of a breaker: configuration, clock, spawner, and
/// the mutex-guarded engine state. The periodic tasks and the slot guard
/// only ever touch this part.
#[derive(Debug)]
pub(crate) struct BreakerCore {
    pub(crate) options: Options,
    pub(crate) clock: Clock,
    pub(crate) spawner: Spawner,
    pub(crate) engine: Mutex<EngineState>,
}

/// Stop handles for the two periodic tasks. Dropping a sender stops its
/// task.
#[derive(Debug, Default)]
pub(crate) struct TaskHandles {
    running: bool,
    window_stop: Option<oneshot::Sender<()>>,
    interval_stop: Option<oneshot::Sender<()>>,
}

impl<In, Out> Breaker<In, Out> {
    /// Creates a builder for a breaker driven by the given clock and
    /// spawner.
    ///
    /// The clock is the source of every time read and timer; the spawner
    /// runs the two periodic roll tasks.
    #[must_use]
    pub fn builder(clock: &Clock, spawner: &Spawner) -> BreakerBuilder<In, Out, NotSet> {
        BreakerBuilder::new(clock, spawner)
    }

    /// Calls the protected operation through the breaker.
    ///
    /// The returned future resolves with the operation's output, or rejects
    /// with [`Error::Rejected`] (circuit open), [`Error::Timeout`], or
    /// [`Error::Fault`] (classified failure). When the concurrency limit is
    /// reached the call waits in FIFO order for a slot; admission happens
    /// against the circuit state current at that moment.
    pub async fn execute(&self, input: In) -> Result<Out, Error> {
        self.start();

        let core = Arc::clone(&self.shared.core);

        // Claim a slot now or join the queue; the decision and all counter
        // updates happen inside one critical section.
        let waiter = {
            let mut engine = core.engine.lock().expect(ERR_POISONED_LOCK);
            if engine.at_capacity(&core.options) {
                Some(engine.enqueue())
            } else {
                None
            }
        };

        let claim = match waiter {
            Some(receiver) => {
                if receiver.await.is_err() {
                    // The queue entry was dropped without a hand-off; there
                    // is no breaker left to run the call.
                    return Err(Error::Rejected);
                }
                SlotClaim::Transferred
            }
            None => SlotClaim::Fresh,
        };

        let mode = {
            let now = core.clock.instant();
            let mut engine = core.engine.lock().expect(ERR_POISONED_LOCK);
            match engine.admit(now, claim, &core.options) {
                Ok(mode) => mode,
                Err(error) => {
                    tracing::debug!(breaker = %core.options.name, "call rejected, circuit is open");
                    return Err(error);
                }
            }
        };

        if mode == ExecutionMode::Probe {
            tracing::debug!(breaker = %core.options.name, "admitting half-open probe");
        }

        let guard = SlotGuard::new(Arc::clone(&core), mode);
        let start = core.clock.system_time();
        let stopwatch = core.clock.stopwatch();

        let operation = self.shared.op.call(input);
        let output = if core.options.timeout.is_zero() {
            operation.await
        } else {
            // Race the operation against the timeout. The operation side is
            // polled first, so a result that is ready on the deadline tick
            // still wins.
            let deadline = core.clock.delay(core.options.timeout);
            match future::select(operation, deadline).await {
                Either::Left((output, _deadline)) => output,
                Either::Right(((), operation)) => {
                    drop(operation);
                    tracing::debug!(
                        breaker = %core.options.name,
                        timeout = ?core.options.timeout,
                        "call timed out"
                    );
                    return Err(guard.timed_out(core.options.timeout));
                }
            }
        };

        let latency = stopwatch.elapsed();
        let end = core.clock.system_time();

        if core.options.emit_callback_events
            && let Some(on_call) = &self.shared.on_call
        {
            on_call.call(&output, CallArgs { start, end });
        }

        match self.shared.classify.call(&output, ClassifyArgs { latency }) {
            Some(fault) => Err(guard.faulted(fault)),
            None => {
                guard.succeeded(latency);
                Ok(output)
            }
        }
    }

    /// Starts the periodic window roll and interval reporting, if they are
    /// not already running. Called implicitly on the first
    /// [`execute`][Self::execute]; call it directly to begin reporting
    /// before any call is made.
    ///
    /// Must be called from within the async runtime backing the spawner.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect(ERR_POISONED_LOCK);
        if tasks.running {
            return;
        }
        tasks.running = true;

        let options = &self.shared.core.options;
        if !options.window_bucket_size.is_zero() {
            let (sender, receiver) = oneshot::channel();
            tasks.window_stop = Some(sender);
            let core = Arc::clone(&self.shared.core);
            drop(self.shared.core.spawner.spawn(roll_window_task(core, receiver)));
        }
        if !options.interval_size.is_zero() {
            let (sender, receiver) = oneshot::channel();
            tasks.interval_stop = Some(sender);
            let core = Arc::clone(&self.shared.core);
            drop(self.shared.core.spawner.spawn(roll_interval_task(core, receiver)));
        }
    }

    /// Stops the periodic window roll and interval reporting. A later call
    /// or [`start`][Self::start] starts them again.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().expect(ERR_POISONED_LOCK);
        tasks.running = false;
        tasks.window_stop = None;
        tasks.interval_stop = None;
    }

    /// Subscribes to the interval snapshots this breaker emits.
    pub fn subscribe(&self) -> IntervalReceiver {
        self.shared.core.engine.lock().expect(ERR_POISONED_LOCK).subscribe()
    }

    /// Returns the breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.core.options.name
    }

    /// Derives the current circuit state.
    #[must_use]
    pub fn state(&self) -> State {
        let core = &self.shared.core;
        let now = core.clock.instant();
        core.engine
            .lock()
            .expect(ERR_POISONED_LOCK)
            .derive_state(now, &core.options)
    }

    /// Returns the number of calls currently in flight.
    #[must_use]
    pub fn active(&self) -> u32 {
        self.shared.core.engine.lock().expect(ERR_POISONED_LOCK).active()
    }

    /// Returns the number of calls queued behind the concurrency limit.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.core.engine.lock().expect(ERR_POISONED_LOCK).queued()
    }

    /// Returns the overall error rate over the health window.
    #[must_use]
    pub fn error_rate(&self) -> f32 {
        self.shared.core.engine.lock().expect(ERR_POISONED_LOCK).window().error_rate()
    }

    /// Returns a copy of the aggregate counts over the health window.
    #[must_use]
    pub fn window_counts(&self) -> Counts {
        self.shared
            .core
            .engine
            .lock()
            .expect(ERR_POISONED_LOCK)
            .window()
            .totals()
            .clone()
    }

    /// Returns a copy of the reporting interval accumulated so far.
    #[must_use]
    pub fn current_interval(&self) -> IntervalSnapshot {
        let core = &self.shared.core;
        let now_system = core.clock.system_time();
        let now = core.clock.instant();
        core.engine
            .lock()
            .expect(ERR_POISONED_LOCK)
            .current_interval(now_system, now, &core.options)
    }
}

impl<In, Out> Drop for Breaker<In, Out> {
    fn drop(&mut self) {
        // Same as stop(), but tolerant of a poisoned lock: never panic in
        // drop.
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.running = false;
            tasks.window_stop = None;
            tasks.interval_stop = None;
        }
    }
}

/// Ties the lifetime of an admitted call to its concurrency slot.
///
/// Every admitted call releases its slot exactly once: through one of the
/// outcome methods, or through `Drop` when the caller abandons the call
/// mid-flight. The drop path also clears the probe flag so an abandoned
/// probe cannot wedge recovery.
struct SlotGuard {
    core: Arc<BreakerCore>,
    mode: ExecutionMode,
    finished: bool,
}

impl SlotGuard {
    fn new(core: Arc<BreakerCore>, mode: ExecutionMode) -> Self {
        Self {
            core,
            mode,
            finished: false,
        }
    }

    fn succeeded(mut self, latency: Duration) {
        {
            let mut engine = self.core.engine.lock().expect(ERR_POISONED_LOCK);
            if engine.record_success(latency, self.mode) {
                tracing::debug!(breaker = %self.core.options.name, "probe succeeded, circuit closed");
            }
            engine.release_slot();
        }
        self.finished = true;
    }

    fn faulted(mut self, fault: crate::Fault) -> Error {
        let now = self.core.clock.instant();
        {
            let mut engine = self.core.engine.lock().expect(ERR_POISONED_LOCK);
            engine.record_fault(&fault.name, now, self.mode);
            engine.release_slot();
        }
        self.finished = true;
        Error::Fault(fault)
    }

    fn timed_out(mut self, timeout: Duration) -> Error {
        let now = self.core.clock.instant();
        {
            let mut engine = self.core.engine.lock().expect(ERR_POISONED_LOCK);
            engine.record_fault(&FaultName::Borrowed(TIMEOUT_FAULT), now, self.mode);
            engine.release_slot();
        }
        self.finished = true;
        Error::Timeout(timeout)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The caller dropped the call mid-flight. No outcome is recorded,
        // but the slot must move on and an abandoned probe must not block
        // future probes.
        if let Ok(mut engine) = self.core.engine.lock() {
            if self.mode == ExecutionMode::Probe {
                engine.clear_probe();
            }
            engine.release_slot();
        }
    }
}

/// Rolls the health window on its bucket cadence until stopped.
async fn roll_window_task(core: Arc<BreakerCore>, mut stop: oneshot::Receiver<()>) {
    let mut ticks = PeriodicTimer::new(&core.clock, core.options.window_bucket_size);
    loop {
        match future::select(ticks.next(), &mut stop).await {
            Either::Left((Some(()), _)) => {
                core.engine.lock().expect(ERR_POISONED_LOCK).roll_window();
            }
            Either::Left((None, _)) | Either::Right(_) => return,
        }
    }
}

/// Emits and resets the reporting interval on its cadence until stopped.
async fn roll_interval_task(core: Arc<BreakerCore>, mut stop: oneshot::Receiver<()>) {
    let mut ticks = PeriodicTimer::new(&core.clock, core.options.interval_size);
    loop {
        match future::select(ticks.next(), &mut stop).await {
            Either::Left((Some(()), _)) => {
                let now_system = core.clock.system_time();
                let now = core.clock.instant();
                core.engine
                    .lock()
                    .expect(ERR_POISONED_LOCK)
                    .roll_interval(now_system, now, &core.options);
            }
            Either::Left((None, _)) | Either::Right(_) => return,
        }
    }
}
