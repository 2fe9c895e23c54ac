// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Name under which a fault is tallied in the health window and in interval
/// snapshots.
pub type FaultName = Cow<'static, str>;

/// A classified failure surfaced by the outcome classifier.
///
/// Faults are identified by name; the name is the key used for per-name
/// tallies and for matching against
/// [`named_fault_threshold`][crate::BreakerBuilder::named_fault_threshold]
/// entries. The optional message is carried for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub(crate) name: FaultName,
    message: Option<Cow<'static, str>>,
}

impl Fault {
    /// Creates a fault with the given name.
    #[must_use]
    pub fn new(name: impl Into<FaultName>) -> Self {
        Self {
            name: name.into(),
            message: None,
        }
    }

    /// Attaches a diagnostic message to the fault.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns the fault name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the diagnostic message, if one was attached.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl std::error::Error for Fault {}

/// The ways a protected call can fail.
///
/// Every rejection a caller observes is also recorded into the breaker's
/// health counters, so the error returned here and the statistics driving
/// the circuit state always agree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The circuit was open when the call was admitted; the operation was
    /// never invoked.
    #[error("circuit breaker is open")]
    Rejected,

    /// The operation did not complete within the configured timeout. The
    /// engine stops waiting for it; a late result is discarded.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The operation completed and the outcome classifier reported a fault.
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl Error {
    /// Returns the name under which this error is tallied in the health
    /// window.
    #[must_use]
    pub fn fault_name(&self) -> &str {
        match self {
            Self::Rejected => crate::OPEN_CIRCUIT_FAULT,
            Self::Timeout(_) => crate::TIMEOUT_FAULT,
            Self::Fault(fault) => fault.name(),
        }
    }
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The overall error threshold is outside `0.0..=1.0`.
    #[error("error threshold must be within 0.0..=1.0, got {0}")]
    ErrorThreshold(f32),

    /// A named fault threshold is outside `0.0..=1.0`.
    #[error("threshold for fault `{name}` must be within 0.0..=1.0, got {value}")]
    NamedThreshold {
        /// The fault name the invalid threshold was registered under.
        name: FaultName,
        /// The rejected value.
        value: f32,
    },

    /// The health window must retain at least one bucket.
    #[error("window bucket count must be at least 1")]
    WindowBucketCount,
}
