// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};

use futures_channel::{mpsc, oneshot};

use super::constants::OPEN_CIRCUIT_FAULT;
use crate::counts::WindowCounters;
use crate::error::{Error, FaultName};
use crate::interval::{IntervalAccumulator, IntervalSnapshot};
use crate::state::State;

/// Resolved breaker configuration.
#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub name: Cow<'static, str>,
    pub timeout: Duration,
    pub reset_time: Duration,
    pub volume_threshold: u32,
    pub concurrency_limit: u32,
    pub window_bucket_size: Duration,
    pub window_bucket_count: usize,
    pub interval_size: Duration,
    pub error_threshold: f32,
    pub named_fault_thresholds: HashMap<FaultName, f32>,
    pub emit_interval_events: bool,
    pub emit_callback_events: bool,
}

/// How an admitted call participates in recovery probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionMode {
    Normal,
    /// The single call admitted while half-open to test recovery.
    Probe,
}

/// Whether an admission already holds a concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotClaim {
    /// A fresh call; admission claims a new slot.
    Fresh,
    /// A dequeued call that inherited the slot released by a finished call.
    Transferred,
}

/// The breaker's mutable runtime state.
///
/// All mutation happens inside short critical sections of the owning mutex;
/// no lock is ever held across an await point. Time is read outside the lock
/// and passed in.
#[derive(Debug)]
pub(crate) struct EngineState {
    active: u32,
    queue: VecDeque<oneshot::Sender<()>>,
    last_fault_at: Option<Instant>,
    probing: bool,
    window: WindowCounters,
    interval: IntervalAccumulator,
    subscribers: Vec<mpsc::UnboundedSender<IntervalSnapshot>>,
}

impl EngineState {
    pub fn new(options: &Options, start: SystemTime) -> Self {
        Self {
            active: 0,
            queue: VecDeque::new(),
            last_fault_at: None,
            probing: false,
            window: WindowCounters::new(options.window_bucket_count),
            interval: IntervalAccumulator::new(start),
            subscribers: Vec::new(),
        }
    }

    /// Derives the circuit state from the window counters, the last-fault
    /// timestamp, and the configuration.
    ///
    /// This is a pure read: nothing is cached, and every query (including
    /// the one on the admission path of every call) recomputes the answer
    /// from current data.
    pub fn derive_state(&self, now: Instant, options: &Options) -> State {
        // Below the volume threshold there is not enough data to judge
        // health, so the circuit stays closed.
        if options.volume_threshold > 0 && self.window.totals().total < options.volume_threshold {
            return State::Closed;
        }

        let probe_ready = !self.probing
            && !options.reset_time.is_zero()
            && self
                .last_fault_at
                .is_some_and(|at| now.saturating_duration_since(at) > options.reset_time);

        let rate = self.window.error_rate();
        if rate > 0.0 && rate >= options.error_threshold {
            return if probe_ready { State::HalfOpen } else { State::Open };
        }

        for (name, threshold) in &options.named_fault_thresholds {
            let rate = self.window.named_error_rate(name);
            if rate > 0.0 && rate >= *threshold {
                return if probe_ready { State::HalfOpen } else { State::Open };
            }
        }

        State::Closed
    }

    /// Admission decision for a call that is ready to run.
    ///
    /// On rejection the outcome is recorded immediately and a transferred
    /// slot is passed on, so the queue keeps moving.
    pub fn admit(&mut self, now: Instant, claim: SlotClaim, options: &Options) -> Result<ExecutionMode, Error> {
        self.interval.record_attempt();

        match self.derive_state(now, options) {
            State::Open => {
                self.record_rejection();
                if claim == SlotClaim::Transferred {
                    self.release_slot();
                }
                Err(Error::Rejected)
            }
            State::HalfOpen => {
                self.probing = true;
                if claim == SlotClaim::Fresh {
                    self.active += 1;
                }
                Ok(ExecutionMode::Probe)
            }
            State::Closed => {
                if claim == SlotClaim::Fresh {
                    self.active += 1;
                }
                Ok(ExecutionMode::Normal)
            }
        }
    }

    /// Records a short-circuited call.
    ///
    /// The rejection feeds the same window that keeps the circuit open, so
    /// repeated short-circuits hold the measured error rate up. The
    /// last-fault timestamp is deliberately left alone: the reset clock
    /// keeps running while rejections pile up, so the probe stays reachable.
    fn record_rejection(&mut self) {
        let name = FaultName::Borrowed(OPEN_CIRCUIT_FAULT);
        self.window.add_fault(&name);
        self.interval.record_fault(&name);
    }

    /// Records a successful completion. Returns `true` when the call was
    /// the half-open probe, in which case the entire error history is
    /// cleared: the window counters, not just the fault timestamp.
    pub fn record_success(&mut self, latency: Duration, mode: ExecutionMode) -> bool {
        self.window.add_success();
        self.interval.record_success(latency);

        if mode == ExecutionMode::Probe {
            self.window.reset();
            self.last_fault_at = None;
            self.probing = false;
            return true;
        }
        false
    }

    /// Records a failed completion or timeout under the given fault name.
    pub fn record_fault(&mut self, name: &FaultName, now: Instant, mode: ExecutionMode) {
        self.window.add_fault(name);
        self.interval.record_fault(name);
        self.last_fault_at = Some(now);
        if mode == ExecutionMode::Probe {
            self.probing = false;
        }
    }

    /// Frees one concurrency slot.
    ///
    /// If calls are queued, the slot is handed to the oldest waiter instead
    /// of being returned to the pool; the active count is unchanged and the
    /// dequeued call re-enters admission when it is next polled. Waiters
    /// whose callers have gone away are skipped.
    pub fn release_slot(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        self.active = self.active.saturating_sub(1);
    }

    /// Appends a waiter to the FIFO admission queue.
    pub fn enqueue(&mut self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.queue.push_back(sender);
        receiver
    }

    /// Clears the probe flag without recording an outcome. Used when the
    /// probe call's caller goes away mid-flight, so recovery probing is not
    /// wedged forever.
    pub fn clear_probe(&mut self) {
        self.probing = false;
    }

    pub fn at_capacity(&self, options: &Options) -> bool {
        options.concurrency_limit > 0 && self.active >= options.concurrency_limit
    }

    pub fn active(&self) -> u32 {
        self.active
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn window(&self) -> &WindowCounters {
        &self.window
    }

    pub fn roll_window(&mut self) {
        self.window.roll();
    }

    /// Snapshots and resets the reporting interval, pushing the snapshot to
    /// every live subscriber.
    pub fn roll_interval(&mut self, now_system: SystemTime, now: Instant, options: &Options) {
        let state = self.derive_state(now, options);
        let snapshot = self.interval.roll(now_system, state, self.active, self.queue.len());
        if options.emit_interval_events {
            self.subscribers.retain(|sender| sender.unbounded_send(snapshot.clone()).is_ok());
        }
    }

    /// A copy of the reporting interval accumulated so far.
    pub fn current_interval(&self, now_system: SystemTime, now: Instant, options: &Options) -> IntervalSnapshot {
        let state = self.derive_state(now, options);
        self.interval.snapshot(now_system, state, self.active, self.queue.len())
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<IntervalSnapshot> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.push(sender);
        receiver
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::breaker::constants::TIMEOUT_FAULT;

    fn test_options() -> Options {
        Options {
            name: "test".into(),
            timeout: Duration::from_secs(3),
            reset_time: Duration::from_secs(1),
            volume_threshold: 0,
            concurrency_limit: 0,
            window_bucket_size: Duration::from_secs(1),
            window_bucket_count: 10,
            interval_size: Duration::from_secs(1),
            error_threshold: 0.5,
            named_fault_thresholds: HashMap::new(),
            emit_interval_events: true,
            emit_callback_events: false,
        }
    }

    fn engine(options: &Options) -> EngineState {
        EngineState::new(options, SystemTime::UNIX_EPOCH)
    }

    fn fault(name: &'static str) -> FaultName {
        FaultName::Borrowed(name)
    }

    #[test]
    fn empty_engine_is_closed() {
        let options = test_options();
        let engine = engine(&options);
        assert_eq!(engine.derive_state(Instant::now(), &options), State::Closed);
    }

    #[test]
    fn volume_threshold_keeps_circuit_closed() {
        let mut options = test_options();
        options.volume_threshold = 3;
        let mut engine = engine(&options);
        let now = Instant::now();

        engine.record_fault(&fault("DbError"), now, ExecutionMode::Normal);
        engine.record_fault(&fault("DbError"), now, ExecutionMode::Normal);

        // two faults at 100% error rate, but below the volume threshold
        assert_eq!(engine.derive_state(now, &options), State::Closed);

        engine.record_fault(&fault("DbError"), now, ExecutionMode::Normal);
        assert_eq!(engine.derive_state(now, &options), State::Open);
    }

    #[rstest]
    #[case(0.0, State::Open)] // zero threshold trips on the first fault
    #[case(0.5, State::Open)] // at the threshold
    #[case(0.6, State::Closed)] // above the measured rate
    fn overall_threshold_boundaries(#[case] threshold: f32, #[case] expected: State) {
        let mut options = test_options();
        options.error_threshold = threshold;
        let mut engine = engine(&options);
        let now = Instant::now();

        engine.record_success(Duration::ZERO, ExecutionMode::Normal);
        engine.record_fault(&fault("DbError"), now, ExecutionMode::Normal);

        // error rate is exactly 0.5
        assert_eq!(engine.derive_state(now, &options), expected);
    }

    #[test]
    fn zero_error_rate_never_trips_even_at_zero_threshold() {
        let mut options = test_options();
        options.error_threshold = 0.0;
        let mut engine = engine(&options);

        engine.record_success(Duration::ZERO, ExecutionMode::Normal);
        assert_eq!(engine.derive_state(Instant::now(), &options), State::Closed);
    }

    #[test]
    fn named_threshold_trips_independently_of_overall() {
        let mut options = test_options();
        options.error_threshold = 0.9;
        options.named_fault_thresholds.insert("ServiceUnavailable".into(), 0.0);
        let mut engine = engine(&options);
        let now = Instant::now();

        for _ in 0..9 {
            engine.record_success(Duration::ZERO, ExecutionMode::Normal);
        }
        engine.record_fault(&fault("ServiceUnavailable"), now, ExecutionMode::Normal);

        // overall rate 0.1 is far below 0.9, but the named threshold is hit
        assert_eq!(engine.derive_state(now, &options), State::Open);
    }

    #[test]
    fn named_threshold_ignores_other_fault_names() {
        let mut options = test_options();
        options.error_threshold = 0.9;
        options.named_fault_thresholds.insert("ServiceUnavailable".into(), 0.0);
        let mut engine = engine(&options);
        let now = Instant::now();

        engine.record_success(Duration::ZERO, ExecutionMode::Normal);
        engine.record_fault(&fault("DbError"), now, ExecutionMode::Normal);

        assert_eq!(engine.derive_state(now, &options), State::Closed);
    }

    #[test]
    fn reset_time_elapse_makes_half_open() {
        let options = test_options();
        let mut engine = engine(&options);
        let start = Instant::now();

        engine.record_fault(&fault("DbError"), start, ExecutionMode::Normal);
        assert_eq!(engine.derive_state(start, &options), State::Open);

        // exactly at the reset time the circuit is still open
        let at_reset = start + options.reset_time;
        assert_eq!(engine.derive_state(at_reset, &options), State::Open);

        let past_reset = start + options.reset_time + Duration::from_millis(1);
        assert_eq!(engine.derive_state(past_reset, &options), State::HalfOpen);
    }

    #[test]
    fn zero_reset_time_never_probes() {
        let mut options = test_options();
        options.reset_time = Duration::ZERO;
        let mut engine = engine(&options);
        let start = Instant::now();

        engine.record_fault(&fault("DbError"), start, ExecutionMode::Normal);

        let much_later = start + Duration::from_secs(3600);
        assert_eq!(engine.derive_state(much_later, &options), State::Open);
    }

    #[test]
    fn probe_in_flight_blocks_second_probe() {
        let options = test_options();
        let mut engine = engine(&options);
        let start = Instant::now();
        let later = start + Duration::from_secs(2);

        engine.record_fault(&fault("DbError"), start, ExecutionMode::Normal);
        assert_eq!(engine.derive_state(later, &options), State::HalfOpen);

        let mode = engine.admit(later, SlotClaim::Fresh, &options).expect("probe admitted");
        assert_eq!(mode, ExecutionMode::Probe);

        // while the probe is in flight the circuit reads open again
        assert_eq!(engine.derive_state(later, &options), State::Open);
    }

    #[test]
    fn rejection_is_recorded_but_does_not_refresh_reset_clock() {
        let options = test_options();
        let mut engine = engine(&options);
        let start = Instant::now();

        engine.record_fault(&fault("DbError"), start, ExecutionMode::Normal);

        // two rejections while open
        let just_after = start + Duration::from_millis(10);
        for _ in 0..2 {
            let result = engine.admit(just_after, SlotClaim::Fresh, &options);
            assert_eq!(result, Err(Error::Rejected));
        }

        let totals = engine.window().totals();
        assert_eq!(totals.total, 3);
        assert_eq!(totals.faults.get(OPEN_CIRCUIT_FAULT).copied(), Some(2));
        assert_eq!(engine.active(), 0);

        // the rejections did not push the reset clock forward
        let past_reset = start + options.reset_time + Duration::from_millis(1);
        assert_eq!(engine.derive_state(past_reset, &options), State::HalfOpen);
    }

    #[test]
    fn probe_success_clears_all_history() {
        let options = test_options();
        let mut engine = engine(&options);
        let start = Instant::now();
        let later = start + Duration::from_secs(2);

        engine.record_fault(&fault("DbError"), start, ExecutionMode::Normal);
        let mode = engine.admit(later, SlotClaim::Fresh, &options).expect("probe admitted");

        let recovered = engine.record_success(Duration::from_millis(5), mode);
        assert!(recovered);

        // the whole window is gone, not just the fault timestamp
        assert_eq!(engine.window().totals().total, 0);
        assert_eq!(engine.derive_state(later, &options), State::Closed);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_reset_clock() {
        let options = test_options();
        let mut engine = engine(&options);
        let start = Instant::now();
        let probe_at = start + Duration::from_secs(2);

        engine.record_fault(&fault("DbError"), start, ExecutionMode::Normal);
        let mode = engine.admit(probe_at, SlotClaim::Fresh, &options).expect("probe admitted");
        engine.record_fault(&fault(TIMEOUT_FAULT), probe_at, mode);

        // open again, and only half-open after a fresh reset period
        assert_eq!(engine.derive_state(probe_at, &options), State::Open);
        let next_probe_at = probe_at + options.reset_time + Duration::from_millis(1);
        assert_eq!(engine.derive_state(next_probe_at, &options), State::HalfOpen);
    }

    #[test]
    fn release_slot_hands_off_in_fifo_order() {
        let options = test_options();
        let mut engine = engine(&options);
        engine.active = 1;

        let mut first = engine.enqueue();
        let mut second = engine.enqueue();
        assert_eq!(engine.queued(), 2);

        engine.release_slot();
        // the slot moved to the first waiter; nothing was freed
        assert_eq!(engine.active(), 1);
        assert_eq!(first.try_recv(), Ok(Some(())));
        assert_eq!(second.try_recv(), Ok(None));

        engine.release_slot();
        assert_eq!(second.try_recv(), Ok(Some(())));
        assert_eq!(engine.queued(), 0);

        engine.release_slot();
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn release_slot_skips_abandoned_waiters() {
        let options = test_options();
        let mut engine = engine(&options);
        engine.active = 1;

        let abandoned = engine.enqueue();
        let mut live = engine.enqueue();
        drop(abandoned);

        engine.release_slot();

        assert_eq!(live.try_recv(), Ok(Some(())));
        assert_eq!(engine.active(), 1);
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn rejected_transferred_slot_is_released_onward() {
        let mut options = test_options();
        options.concurrency_limit = 1;
        let mut engine = engine(&options);
        let now = Instant::now();

        // trip the circuit and fill the slot bookkeeping by hand
        engine.record_fault(&fault("DbError"), now, ExecutionMode::Normal);
        engine.active = 1;
        let mut next = engine.enqueue();

        // a dequeued call arrives holding the transferred slot and is
        // rejected; the slot must travel onward to the next waiter
        let result = engine.admit(now, SlotClaim::Transferred, &options);
        assert_eq!(result, Err(Error::Rejected));
        assert_eq!(next.try_recv(), Ok(Some(())));
        assert_eq!(engine.active(), 1);
    }

    #[test]
    fn roll_interval_resets_and_notifies_subscribers() {
        let options = test_options();
        let mut engine = engine(&options);
        let now = Instant::now();
        let mut snapshots = engine.subscribe();

        engine
            .admit(now, SlotClaim::Fresh, &options)
            .expect("call admitted");
        engine.record_success(Duration::from_millis(4), ExecutionMode::Normal);
        engine.release_slot();

        engine.roll_interval(SystemTime::UNIX_EPOCH + Duration::from_secs(1), now, &options);

        let snapshot = snapshots.try_next().expect("snapshot pending").expect("channel open");
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.state, State::Closed);
        assert_eq!(snapshot.latencies, vec![Duration::from_millis(4)]);

        // the next interval starts empty
        let current = engine.current_interval(SystemTime::UNIX_EPOCH + Duration::from_secs(2), now, &options);
        assert_eq!(current.total, 0);
    }

    #[test]
    fn roll_interval_without_emission_still_resets() {
        let mut options = test_options();
        options.emit_interval_events = false;
        let mut engine = engine(&options);
        let now = Instant::now();
        let mut snapshots = engine.subscribe();

        engine
            .admit(now, SlotClaim::Fresh, &options)
            .expect("call admitted");
        engine.roll_interval(SystemTime::UNIX_EPOCH, now, &options);

        assert!(snapshots.try_next().is_err(), "no snapshot should be emitted");
        let current = engine.current_interval(SystemTime::UNIX_EPOCH, now, &options);
        assert_eq!(current.total, 0);
    }
}
