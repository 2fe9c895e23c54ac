// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Default per-call timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time the circuit stays open before a probe call is allowed.
pub(crate) const DEFAULT_RESET_TIME: Duration = Duration::from_secs(1);

/// Default minimum number of calls in the health window before the circuit
/// state is judged from error rates. The circuit stays closed below this.
pub(crate) const DEFAULT_VOLUME_THRESHOLD: u32 = 10;

/// Default overall error rate at which the circuit trips.
pub(crate) const DEFAULT_ERROR_THRESHOLD: f32 = 0.05;

/// Default duration of one health window bucket.
pub(crate) const DEFAULT_WINDOW_BUCKET_SIZE: Duration = Duration::from_secs(1);

/// Default number of buckets retained in the health window.
pub(crate) const DEFAULT_WINDOW_BUCKET_COUNT: usize = 10;

/// Default reporting interval.
pub(crate) const DEFAULT_INTERVAL_SIZE: Duration = Duration::from_secs(1);

/// Fault name under which timed-out calls are tallied.
///
/// Named fault thresholds can target this name to trip the circuit on
/// timeouts specifically.
pub const TIMEOUT_FAULT: &str = "TimeoutError";

/// Fault name under which short-circuited calls are tallied.
///
/// Rejections recorded while the circuit is open keep the measured error
/// rate high until the reset time elapses.
pub const OPEN_CIRCUIT_FAULT: &str = "OpenCircuitError";

pub(crate) const ERR_POISONED_LOCK: &str =
    "poisoned lock - cannot continue execution because counter integrity can no longer be upheld";
