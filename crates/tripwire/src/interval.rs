// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::counts::Counts;
use crate::error::FaultName;
use crate::state::State;

/// Accumulates call outcomes and success latencies for the current reporting
/// interval.
///
/// The accumulator has its own lifecycle, independent of the health window:
/// it is reset on every interval tick and never participates in circuit
/// decisions.
#[derive(Debug)]
pub(crate) struct IntervalAccumulator {
    start: SystemTime,
    counts: Counts,
    latencies: Vec<Duration>,
}

impl IntervalAccumulator {
    pub fn new(start: SystemTime) -> Self {
        Self {
            start,
            counts: Counts::default(),
            latencies: Vec::new(),
        }
    }

    /// Counts a call that reached admission, whatever its outcome.
    pub fn record_attempt(&mut self) {
        self.counts.total = self.counts.total.saturating_add(1);
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.counts.success = self.counts.success.saturating_add(1);
        self.latencies.push(latency);
    }

    pub fn record_fault(&mut self, name: &FaultName) {
        self.counts.total_faults = self.counts.total_faults.saturating_add(1);
        *self.counts.faults.entry(name.clone()).or_insert(0) += 1;
    }

    /// An immutable copy of the interval so far, with the live engine
    /// readings attached.
    pub fn snapshot(&self, end: SystemTime, state: State, active: u32, queued: usize) -> IntervalSnapshot {
        IntervalSnapshot {
            start: self.start,
            end,
            state,
            active,
            queued,
            total: self.counts.total,
            success: self.counts.success,
            total_faults: self.counts.total_faults,
            faults: self.counts.faults.clone(),
            latencies: self.latencies.clone(),
        }
    }

    /// Snapshots the interval and starts a fresh one beginning at `now`.
    pub fn roll(&mut self, now: SystemTime, state: State, active: u32, queued: usize) -> IntervalSnapshot {
        let snapshot = self.snapshot(now, state, active, queued);
        *self = Self::new(now);
        snapshot
    }
}

/// A flat reporting snapshot emitted on every interval tick.
///
/// Snapshots are immutable copies: consumers never observe the live
/// accumulator, and holding on to a snapshot does not pin breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSnapshot {
    /// When this interval began.
    pub start: SystemTime,
    /// When this interval was snapshotted.
    pub end: SystemTime,
    /// Circuit state derived at snapshot time.
    pub state: State,
    /// Calls in flight at snapshot time.
    pub active: u32,
    /// Calls queued behind the concurrency limit at snapshot time.
    pub queued: usize,
    /// Calls that reached admission during the interval.
    pub total: u32,
    /// Calls that completed without a fault.
    pub success: u32,
    /// Calls that ended in any fault, timeouts and rejections included.
    pub total_faults: u32,
    /// Fault tallies keyed by fault name.
    pub faults: HashMap<FaultName, u32>,
    /// Latencies of successful calls, in completion order.
    pub latencies: Vec<Duration>,
}
