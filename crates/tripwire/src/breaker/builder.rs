// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyspawn::Spawner;
use futures_util::future::BoxFuture;
use tick::Clock;

use super::callbacks::{ClassifyFault, OnCall, ProtectedOp};
use super::constants::{
    DEFAULT_ERROR_THRESHOLD, DEFAULT_INTERVAL_SIZE, DEFAULT_RESET_TIME, DEFAULT_TIMEOUT, DEFAULT_VOLUME_THRESHOLD,
    DEFAULT_WINDOW_BUCKET_COUNT, DEFAULT_WINDOW_BUCKET_SIZE,
};
use super::engine::{EngineState, Options};
use super::{Breaker, BreakerCore, BreakerShared, CallArgs, ClassifyArgs};
use crate::error::{ConfigError, Fault, FaultName};

/// Marker type indicating a required builder property has been provided.
#[derive(Debug)]
pub struct Set;

/// Marker type indicating a required builder property has not been provided.
#[derive(Debug)]
pub struct NotSet;

/// Builder for [`Breaker`] instances.
///
/// Created by [`Breaker::builder`]. The builder uses the type-state pattern
/// to enforce at compile time that an outcome classifier is supplied via
/// [`classify_with`][Self::classify_with] before
/// [`protect`][Self::protect] can be called. Numeric options are validated
/// when the breaker is built.
///
/// # Type State
///
/// - `S`: tracks whether [`classify_with`][Self::classify_with] has been set
#[derive(Debug)]
pub struct BreakerBuilder<In, Out, S = Set> {
    clock: Clock,
    spawner: Spawner,
    name: Cow<'static, str>,
    timeout: Duration,
    reset_time: Duration,
    volume_threshold: u32,
    concurrency_limit: u32,
    window_bucket_size: Duration,
    window_bucket_count: usize,
    interval_size: Duration,
    error_threshold: f32,
    named_fault_thresholds: HashMap<FaultName, f32>,
    emit_interval_events: bool,
    emit_callback_events: bool,
    classify: Option<ClassifyFault<Out>>,
    on_call: Option<OnCall<Out>>,
    _state: PhantomData<fn(In, S) -> Out>,
}

impl<In, Out> BreakerBuilder<In, Out, NotSet> {
    #[must_use]
    pub(crate) fn new(clock: &Clock, spawner: &Spawner) -> Self {
        Self {
            clock: clock.clone(),
            spawner: spawner.clone(),
            name: Cow::Borrowed("breaker"),
            timeout: DEFAULT_TIMEOUT,
            reset_time: DEFAULT_RESET_TIME,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            concurrency_limit: 0,
            window_bucket_size: DEFAULT_WINDOW_BUCKET_SIZE,
            window_bucket_count: DEFAULT_WINDOW_BUCKET_COUNT,
            interval_size: DEFAULT_INTERVAL_SIZE,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            named_fault_thresholds: HashMap::new(),
            emit_interval_events: true,
            emit_callback_events: false,
            classify: None,
            on_call: None,
            _state: PhantomData,
        }
    }
}

impl<In, Out, S> BreakerBuilder<In, Out, S> {
    /// Sets the name of the breaker, used in logs and by observers to group
    /// interval snapshots.
    ///
    /// **Default**: `"breaker"`
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the per-call timeout. When the operation does not complete in
    /// time, the call fails with [`Error::Timeout`][crate::Error::Timeout]
    /// and the engine stops waiting for it.
    ///
    /// **Default**: 3 seconds. Set to zero to disable timeouts.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long the circuit stays open before a single probe call is
    /// allowed through to test recovery.
    ///
    /// **Default**: 1 second. Set to zero to never probe: once open, the
    /// circuit only closes again if the window rolls the faults away.
    #[must_use]
    pub fn reset_time(mut self, reset_time: Duration) -> Self {
        self.reset_time = reset_time;
        self
    }

    /// Sets the minimum number of calls that must be present in the health
    /// window before error rates are evaluated. Below this volume the
    /// circuit always reads closed.
    ///
    /// **Default**: 10 calls. Set to zero to judge health from the first
    /// call.
    #[must_use]
    pub fn volume_threshold(mut self, volume_threshold: u32) -> Self {
        self.volume_threshold = volume_threshold;
        self
    }

    /// Sets the maximum number of concurrently running calls. Further calls
    /// are queued and admitted in FIFO order as slots free up.
    ///
    /// **Default**: 0 (unbounded, no queueing).
    #[must_use]
    pub fn concurrency_limit(mut self, concurrency_limit: u32) -> Self {
        self.concurrency_limit = concurrency_limit;
        self
    }

    /// Sets the duration of one health window bucket. The window rolls on
    /// this cadence.
    ///
    /// **Default**: 1 second. Set to zero to disable rolling; outcomes then
    /// accumulate in a single bucket forever.
    #[must_use]
    pub fn window_bucket_size(mut self, window_bucket_size: Duration) -> Self {
        self.window_bucket_size = window_bucket_size;
        self
    }

    /// Sets how many buckets the health window retains.
    ///
    /// **Default**: 10 buckets.
    #[must_use]
    pub fn window_bucket_count(mut self, window_bucket_count: usize) -> Self {
        self.window_bucket_count = window_bucket_count;
        self
    }

    /// Sets the reporting cadence. On every tick the current interval is
    /// snapshotted, pushed to subscribers, and reset.
    ///
    /// **Default**: 1 second. Set to zero to disable interval reporting.
    #[must_use]
    pub fn interval_size(mut self, interval_size: Duration) -> Self {
        self.interval_size = interval_size;
        self
    }

    /// Sets the overall error rate (`0.0..=1.0`) at which the circuit
    /// trips.
    ///
    /// **Default**: 0.05. A zero threshold trips on the first recorded
    /// fault once the volume threshold is met; a zero error rate never
    /// trips.
    #[must_use]
    pub fn error_threshold(mut self, error_threshold: f32) -> Self {
        self.error_threshold = error_threshold;
        self
    }

    /// Sets a tripping threshold for one fault name, checked independently
    /// of the overall threshold. The reserved names
    /// [`TIMEOUT_FAULT`][crate::TIMEOUT_FAULT] and
    /// [`OPEN_CIRCUIT_FAULT`][crate::OPEN_CIRCUIT_FAULT] can be targeted
    /// like any other.
    ///
    /// **Default**: no named thresholds.
    #[must_use]
    pub fn named_fault_threshold(mut self, name: impl Into<FaultName>, threshold: f32) -> Self {
        self.named_fault_thresholds.insert(name.into(), threshold);
        self
    }

    /// Enables or disables pushing interval snapshots to subscribers. The
    /// interval still resets on its cadence when disabled.
    ///
    /// **Default**: enabled.
    #[must_use]
    pub fn emit_interval_events(mut self, enabled: bool) -> Self {
        self.emit_interval_events = enabled;
        self
    }

    /// Enables or disables the per-call diagnostic callback set via
    /// [`on_call`][Self::on_call].
    ///
    /// **Default**: disabled.
    #[must_use]
    pub fn emit_callback_events(mut self, enabled: bool) -> Self {
        self.emit_callback_events = enabled;
        self
    }

    /// Sets a diagnostic callback invoked with the output and timing of
    /// every completed call. Timed-out and rejected calls never reach it.
    /// The callback only fires when enabled via
    /// [`emit_callback_events`][Self::emit_callback_events].
    ///
    /// **Default**: no callback.
    #[must_use]
    pub fn on_call(mut self, callback: impl Fn(&Out, CallArgs) + Send + Sync + 'static) -> Self {
        self.on_call = Some(OnCall::new(callback));
        self
    }

    /// Sets the outcome classifier.
    ///
    /// The classifier inspects the output of every completed call and
    /// returns `Some(fault)` when the output represents a failure, or
    /// `None` for success. The fault's name is the key used for per-name
    /// thresholds and window tallies, and the fault is returned to the
    /// caller inside [`Error::Fault`][crate::Error::Fault].
    #[must_use]
    pub fn classify_with(
        mut self,
        classify: impl Fn(&Out, ClassifyArgs) -> Option<Fault> + Send + Sync + 'static,
    ) -> BreakerBuilder<In, Out, Set> {
        self.classify = Some(ClassifyFault::new(classify));
        self.into_state()
    }

    fn into_state<T>(self) -> BreakerBuilder<In, Out, T> {
        BreakerBuilder {
            clock: self.clock,
            spawner: self.spawner,
            name: self.name,
            timeout: self.timeout,
            reset_time: self.reset_time,
            volume_threshold: self.volume_threshold,
            concurrency_limit: self.concurrency_limit,
            window_bucket_size: self.window_bucket_size,
            window_bucket_count: self.window_bucket_count,
            interval_size: self.interval_size,
            error_threshold: self.error_threshold,
            named_fault_thresholds: self.named_fault_thresholds,
            emit_interval_events: self.emit_interval_events,
            emit_callback_events: self.emit_callback_events,
            classify: self.classify,
            on_call: self.on_call,
            _state: PhantomData,
        }
    }

    fn validate(&self) -> Result<Options, ConfigError> {
        if !(0.0..=1.0).contains(&self.error_threshold) {
            return Err(ConfigError::ErrorThreshold(self.error_threshold));
        }
        for (name, value) in &self.named_fault_thresholds {
            if !(0.0..=1.0).contains(value) {
                return Err(ConfigError::NamedThreshold {
                    name: name.clone(),
                    value: *value,
                });
            }
        }
        if self.window_bucket_count == 0 {
            return Err(ConfigError::WindowBucketCount);
        }

        Ok(Options {
            name: self.name.clone(),
            timeout: self.timeout,
            reset_time: self.reset_time,
            volume_threshold: self.volume_threshold,
            concurrency_limit: self.concurrency_limit,
            window_bucket_size: self.window_bucket_size,
            window_bucket_count: self.window_bucket_count,
            interval_size: self.interval_size,
            error_threshold: self.error_threshold,
            named_fault_thresholds: self.named_fault_thresholds.clone(),
            emit_interval_events: self.emit_interval_events,
            emit_callback_events: self.emit_callback_events,
        })
    }
}

impl<In, Out> BreakerBuilder<In, Out, Set> {
    /// Validates the configuration and builds a breaker protecting the
    /// given asynchronous operation.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a threshold is outside `0.0..=1.0` or
    /// the window bucket count is zero.
    pub fn protect<Op, Fut>(self, operation: Op) -> Result<Breaker<In, Out>, ConfigError>
    where
        In: 'static,
        Out: 'static,
        Op: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Out> + Send + 'static,
    {
        let options = self.validate()?;

        let start = self.clock.system_time();
        let core = Arc::new(BreakerCore {
            engine: Mutex::new(EngineState::new(&options, start)),
            options,
            clock: self.clock,
            spawner: self.spawner,
        });

        let classify = self.classify.expect("classifier is set in this type state");
        let op = ProtectedOp::new(move |input| -> BoxFuture<'static, Out> { Box::pin(operation(input)) });

        Ok(Breaker {
            shared: Arc::new(BreakerShared {
                core,
                op,
                classify,
                on_call: self.on_call,
            }),
            tasks: Mutex::new(super::TaskHandles::default()),
        })
    }
}
