// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};
use std::mem;

use crate::error::FaultName;

/// Outcome tallies for one window bucket or reporting interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    /// Calls observed.
    pub total: u32,
    /// Calls that completed without a fault.
    pub success: u32,
    /// Calls that ended in any fault, timeouts and rejections included.
    pub total_faults: u32,
    /// Fault tallies keyed by fault name.
    pub faults: HashMap<FaultName, u32>,
}

impl Counts {
    fn record_fault(&mut self, name: &FaultName) {
        self.total_faults = self.total_faults.saturating_add(1);
        *self.faults.entry(name.clone()).or_insert(0) += 1;
    }
}

/// A bounded sliding window of fixed-duration buckets with an incrementally
/// maintained running aggregate.
///
/// Outcomes land in the currently open bucket; [`roll`][Self::roll] closes
/// it and opens a fresh one, evicting the oldest bucket once the retention
/// limit is reached. The running sum always equals the exact sum of the open
/// bucket and every retained bucket, so rate queries are O(1) regardless of
/// window shape.
#[derive(Debug)]
pub(crate) struct WindowCounters {
    open: Counts,
    closed: VecDeque<Counts>,
    sum: Counts,
    bucket_count: usize,
}

impl WindowCounters {
    pub fn new(bucket_count: usize) -> Self {
        Self {
            open: Counts::default(),
            closed: VecDeque::with_capacity(bucket_count),
            sum: Counts::default(),
            bucket_count,
        }
    }

    pub fn add_success(&mut self) {
        self.open.total = self.open.total.saturating_add(1);
        self.open.success = self.open.success.saturating_add(1);
        self.sum.total = self.sum.total.saturating_add(1);
        self.sum.success = self.sum.success.saturating_add(1);
    }

    pub fn add_fault(&mut self, name: &FaultName) {
        self.open.total = self.open.total.saturating_add(1);
        self.open.record_fault(name);
        self.sum.total = self.sum.total.saturating_add(1);
        self.sum.record_fault(name);
    }

    /// Closes the open bucket and starts a new one, evicting the oldest
    /// bucket once more than `bucket_count` slices would be retained.
    ///
    /// Evicted values are subtracted from the running sum; fault names whose
    /// count reaches zero are removed, bounding memory to the names seen in
    /// the current window.
    pub fn roll(&mut self) {
        self.closed.push_back(mem::take(&mut self.open));

        if self.closed.len() + 1 > self.bucket_count
            && let Some(evicted) = self.closed.pop_front()
        {
            self.sum.total -= evicted.total;
            self.sum.success -= evicted.success;
            self.sum.total_faults -= evicted.total_faults;
            for (name, count) in &evicted.faults {
                if let Some(entry) = self.sum.faults.get_mut(name) {
                    *entry -= count;
                    if *entry == 0 {
                        self.sum.faults.remove(name);
                    }
                }
            }
        }
    }

    /// Clears every bucket and the running sum.
    pub fn reset(&mut self) {
        self.open = Counts::default();
        self.closed.clear();
        self.sum = Counts::default();
    }

    /// The running aggregate over the open bucket and all retained buckets.
    pub fn totals(&self) -> &Counts {
        &self.sum
    }

    /// Fraction of calls in the window that ended in any fault; `0.0` when
    /// the window is empty.
    pub fn error_rate(&self) -> f32 {
        rate(self.sum.total_faults, self.sum.total)
    }

    /// Fraction of calls in the window that ended in the named fault; `0.0`
    /// when the window is empty or the name is absent.
    pub fn named_error_rate(&self, name: &str) -> f32 {
        rate(self.sum.faults.get(name).copied().unwrap_or(0), self.sum.total)
    }
}

#[expect(clippy::cast_possible_truncation, reason = "Acceptable")]
fn rate(part: u32, total: u32) -> f32 {
    if total == 0 {
        0.0
    } else {
        (f64::from(part) / f64::from(total)) as f32
    }
}
