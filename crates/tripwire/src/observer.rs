// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Groups interval snapshots from several breakers into combined batches.
//!
//! An [`Observer`] subscribes to the interval snapshots of any number of
//! breakers and yields [`Batch`]es keyed by breaker name. A batch is
//! emitted once every watched breaker has contributed at least one
//! snapshot, or immediately when any breaker runs two snapshots ahead, so a
//! silent breaker cannot hold reporting back indefinitely.

use std::collections::HashMap;
use std::fmt;
use std::mem;

use futures_util::StreamExt;
use futures_util::stream::{BoxStream, SelectAll};

use crate::breaker::Breaker;
use crate::interval::IntervalSnapshot;

/// Interval snapshots grouped by breaker name.
///
/// Every watched name is present; names that contributed nothing to this
/// batch map to an empty list.
pub type Batch = HashMap<String, Vec<IntervalSnapshot>>;

/// Watches one or more breakers and combines their interval snapshots into
/// batches.
#[derive(Default)]
pub struct Observer {
    feeds: SelectAll<BoxStream<'static, (String, IntervalSnapshot)>>,
    pending: HashMap<String, Vec<IntervalSnapshot>>,
}

impl Observer {
    /// Creates an observer watching nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Watches a breaker, grouping its snapshots under the breaker's name.
    ///
    /// Breakers sharing a name share a group.
    pub fn watch<In, Out>(&mut self, breaker: &Breaker<In, Out>) {
        let name = breaker.name().to_string();
        self.pending.entry(name.clone()).or_default();

        let tagged = breaker.subscribe().map(move |snapshot| (name.clone(), snapshot));
        self.feeds.push(tagged.boxed());
    }

    /// Returns the number of watched snapshot feeds.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.feeds.len()
    }

    /// Waits for the next combined batch.
    ///
    /// Returns `None` once every watched breaker has gone away (or nothing
    /// was ever watched).
    pub async fn next_batch(&mut self) -> Option<Batch> {
        while let Some((name, snapshot)) = self.feeds.next().await {
            self.pending.entry(name).or_default().push(snapshot);
            if self.batch_ready() {
                return Some(self.take_batch());
            }
        }
        None
    }

    /// A batch is ready when every group has a snapshot, or any group has
    /// fallen two behind.
    fn batch_ready(&self) -> bool {
        let mut all_contributed = true;
        for snapshots in self.pending.values() {
            if snapshots.len() > 1 {
                return true;
            }
            if snapshots.is_empty() {
                all_contributed = false;
            }
        }
        all_contributed
    }

    fn take_batch(&mut self) -> Batch {
        let mut batch = Batch::new();
        for (name, snapshots) in &mut self.pending {
            batch.insert(name.clone(), mem::take(snapshots));
        }
        batch
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("watched", &self.feeds.len())
            .finish_non_exhaustive()
    }
}
