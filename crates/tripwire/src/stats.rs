// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Re-aggregates interval snapshots into rolling summaries.
//!
//! A [`StatsCollector`] consumes the [`IntervalSnapshot`]s a breaker emits
//! (directly or via an [`Observer`][crate::Observer]) and maintains three
//! independently bounded rolling aggregations: success latencies, cumulative
//! call counters, and a short health window with call and error rates. None
//! of this feeds back into breaker decisions; it exists for dashboards and
//! operational reporting.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::breaker::{OPEN_CIRCUIT_FAULT, TIMEOUT_FAULT};
use crate::error::FaultName;
use crate::interval::IntervalSnapshot;
use crate::state::State;

/// Window lengths for [`StatsCollector`], counted in intervals.
#[derive(Debug, Clone)]
pub struct StatsOptions {
    /// Intervals retained for latency statistics.
    pub times_length: usize,
    /// Intervals retained for the cumulative counters.
    pub counts_length: usize,
    /// Intervals retained for the health summary.
    pub health_length: usize,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            times_length: 60,
            counts_length: 120,
            health_length: 10,
        }
    }
}

/// Latency statistics over the retained intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySummary {
    /// Arithmetic mean.
    pub mean: Duration,
    /// Median (50th percentile).
    pub median: Duration,
    /// 90th percentile.
    pub p90: Duration,
    /// 99th percentile.
    pub p99: Duration,
}

/// Cumulative call counters over the retained intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountsSummary {
    /// Calls that reached admission.
    pub total: u64,
    /// Calls that completed without a fault.
    pub success: u64,
    /// Calls that ended in any fault.
    pub total_faults: u64,
    /// Fault tallies keyed by fault name.
    pub faults: HashMap<FaultName, u64>,
}

/// Health overview over the most recent intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    /// Calls that reached admission.
    pub total: u64,
    /// Calls that completed without a fault.
    pub success: u64,
    /// Calls that ended in any fault.
    pub total_faults: u64,
    /// Calls that timed out.
    pub timeouts: u64,
    /// Calls short-circuited by an open circuit.
    pub rejected: u64,
    /// Faults that are neither timeouts nor rejections.
    pub other_faults: u64,
    /// Fault tallies keyed by fault name.
    pub faults: HashMap<FaultName, u64>,
    /// Calls per second over the health window.
    pub call_rate: f64,
    /// Fraction of calls that ended in any fault.
    pub error_rate: f64,
    /// In-flight calls at the newest snapshot.
    pub active: u32,
    /// Queued calls at the newest snapshot.
    pub queued: usize,
    /// Circuit state at the newest snapshot.
    pub state: State,
}

/// The combined output of [`StatsCollector::summary`].
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Latency statistics.
    pub times: LatencySummary,
    /// Cumulative counters.
    pub counts: CountsSummary,
    /// Health overview.
    pub health: HealthSummary,
}

/// Rolling aggregation of interval snapshots.
#[derive(Debug)]
pub struct StatsCollector {
    options: StatsOptions,
    latencies: VecDeque<Vec<Duration>>,
    counters: VecDeque<IntervalSnapshot>,
    counters_sum: CountsSummary,
    healths: VecDeque<IntervalSnapshot>,
    healths_sum: CountsSummary,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(StatsOptions::default())
    }
}

impl StatsCollector {
    /// Creates a collector with the given window lengths.
    #[must_use]
    pub fn new(options: StatsOptions) -> Self {
        Self {
            options,
            latencies: VecDeque::new(),
            counters: VecDeque::new(),
            counters_sum: CountsSummary::default(),
            healths: VecDeque::new(),
            healths_sum: CountsSummary::default(),
        }
    }

    /// Feeds one interval snapshot into every aggregation.
    pub fn record(&mut self, snapshot: &IntervalSnapshot) {
        self.latencies.push_back(snapshot.latencies.clone());
        while self.latencies.len() > self.options.times_length {
            self.latencies.pop_front();
        }

        add(&mut self.counters_sum, snapshot);
        self.counters.push_back(snapshot.clone());
        while self.counters.len() > self.options.counts_length {
            if let Some(evicted) = self.counters.pop_front() {
                subtract(&mut self.counters_sum, &evicted);
            }
        }

        add(&mut self.healths_sum, snapshot);
        self.healths.push_back(snapshot.clone());
        while self.healths.len() > self.options.health_length {
            if let Some(evicted) = self.healths.pop_front() {
                subtract(&mut self.healths_sum, &evicted);
            }
        }
    }

    /// The current rolling summary, or `None` before the first snapshot.
    #[must_use]
    pub fn summary(&self) -> Option<Summary> {
        let newest = self.healths.back()?;
        let oldest = self.healths.front()?;

        let timeouts = self.healths_sum.faults.get(TIMEOUT_FAULT).copied().unwrap_or(0);
        let rejected = self.healths_sum.faults.get(OPEN_CIRCUIT_FAULT).copied().unwrap_or(0);
        let window = newest
            .end
            .duration_since(oldest.start)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();

        #[expect(clippy::cast_precision_loss, reason = "Counter magnitudes are nowhere near 2^52")]
        let health = HealthSummary {
            total: self.healths_sum.total,
            success: self.healths_sum.success,
            total_faults: self.healths_sum.total_faults,
            timeouts,
            rejected,
            other_faults: self.healths_sum.total_faults - timeouts - rejected,
            faults: self.healths_sum.faults.clone(),
            call_rate: if window > 0.0 {
                self.healths_sum.total as f64 / window
            } else {
                0.0
            },
            error_rate: if self.healths_sum.total > 0 {
                self.healths_sum.total_faults as f64 / self.healths_sum.total as f64
            } else {
                0.0
            },
            active: newest.active,
            queued: newest.queued,
            state: newest.state,
        };

        Some(Summary {
            times: self.latency_summary(),
            counts: self.counters_sum.clone(),
            health,
        })
    }

    fn latency_summary(&self) -> LatencySummary {
        let mut samples: Vec<Duration> = self.latencies.iter().flatten().copied().collect();
        samples.sort_unstable();

        if samples.is_empty() {
            return LatencySummary {
                mean: Duration::ZERO,
                median: Duration::ZERO,
                p90: Duration::ZERO,
                p99: Duration::ZERO,
            };
        }

        let sum: Duration = samples.iter().sum();
        let mean = sum / u32::try_from(samples.len()).unwrap_or(u32::MAX);

        LatencySummary {
            mean,
            median: percentile(&samples, 50),
            p90: percentile(&samples, 90),
            p99: percentile(&samples, 99),
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[Duration], pct: u32) -> Duration {
    let rank = (usize::try_from(pct).unwrap_or(100) * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn add(sum: &mut CountsSummary, snapshot: &IntervalSnapshot) {
    sum.total += u64::from(snapshot.total);
    sum.success += u64::from(snapshot.success);
    sum.total_faults += u64::from(snapshot.total_faults);
    for (name, count) in &snapshot.faults {
        *sum.faults.entry(name.clone()).or_insert(0) += u64::from(*count);
    }
}

fn subtract(sum: &mut CountsSummary, snapshot: &IntervalSnapshot) {
    sum.total -= u64::from(snapshot.total);
    sum.success -= u64::from(snapshot.success);
    sum.total_faults -= u64::from(snapshot.total_faults);
    for (name, count) in &snapshot.faults {
        if let Some(entry) = sum.faults.get_mut(name) {
            *entry -= u64::from(*count);
            if *entry == 0 {
                sum.faults.remove(name);
            }
        }
    }
}
