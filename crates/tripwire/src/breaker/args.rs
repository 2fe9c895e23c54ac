// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

/// Arguments for the [`classify_with`][super::BreakerBuilder::classify_with]
/// callback function.
///
/// Provides context about the completed call being classified.
#[derive(Debug)]
#[non_exhaustive]
pub struct ClassifyArgs {
    pub(crate) latency: Duration,
}

impl ClassifyArgs {
    /// Returns how long the call took to complete.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.latency
    }
}

/// Arguments for the [`on_call`][super::BreakerBuilder::on_call] callback
/// function.
///
/// Provides the timing of a completed call. The callback fires for calls
/// that completed (successfully or with a classified fault); timed-out and
/// rejected calls never reach it.
#[derive(Debug)]
#[non_exhaustive]
pub struct CallArgs {
    pub(crate) start: SystemTime,
    pub(crate) end: SystemTime,
}

impl CallArgs {
    /// Returns when the call was admitted.
    #[must_use]
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Returns when the call completed.
    #[must_use]
    pub fn end(&self) -> SystemTime {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_args_accessors() {
        let args = ClassifyArgs {
            latency: Duration::from_millis(20),
        };
        assert_eq!(args.latency(), Duration::from_millis(20));
        assert!(format!("{args:?}").contains("ClassifyArgs"));
    }

    #[test]
    fn call_args_accessors() {
        let start = SystemTime::UNIX_EPOCH;
        let end = start + Duration::from_millis(7);
        let args = CallArgs { start, end };
        assert_eq!(args.start(), start);
        assert_eq!(args.end(), end);
        assert!(format!("{args:?}").contains("CallArgs"));
    }
}
