//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the node runtime.
//!
//! Config is used in two ways:
//! 1. **Node creation**: `Node::new(config, storage, cache, isolate, subscribers)`
//! 2. **Engine tuning**: every app engine inherits the pump interval,
//!    pre-assignment buffer cap, and spawn backoff from here.
//!
//! ## Sentinel values
//! - `pending_cap = 0` → clamped to 1 (a session must be able to buffer at
//!   least its first frame)
//! - `bus_capacity` → clamped to 1 by the bus

use std::path::PathBuf;
use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Global configuration for the node runtime.
///
/// Defines:
/// - **Spool layout**: where app bundles are unpacked
/// - **Boot behavior**: which runlist to read at startup
/// - **Engine tuning**: safety pump cadence, write buffer cap
/// - **Event system**: bus capacity for event delivery
/// - **Spawn pacing**: backoff applied after isolation spawn failures
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory app bundles are unpacked into (`<spool>/<app-name>/…`).
    ///
    /// Deploy is destructive: the per-app subdirectory is erased before
    /// extraction. A missing subdirectory triggers redeploy on next load.
    pub spool_path: PathBuf,

    /// Runlist id read from `("runlists", <id>)` at node boot.
    pub runlist: String,

    /// Cadence of the engine safety pump.
    ///
    /// Every engine re-runs its dispatch/timer scan at least this often,
    /// independent of I/O readiness.
    pub pump_interval: Duration,

    /// Cap on frames a session may buffer before it is assigned to a slave.
    ///
    /// Overflow closes the session with `BackpressureExceeded`. Clamped to
    /// a minimum of 1.
    pub pending_cap: usize,

    /// Capacity of the event bus broadcast channel ring buffer.
    ///
    /// Slow subscribers that lag behind more than `bus_capacity` messages
    /// will skip older items. Minimum value is 1 (enforced by the bus).
    pub bus_capacity: usize,

    /// Backoff applied between spawn retries after the isolation backend
    /// fails to produce a worker.
    pub spawn_backoff: BackoffPolicy,
}

impl Config {
    /// Returns the pending-frame cap clamped to a minimum of 1.
    #[inline]
    pub fn pending_cap_clamped(&self) -> usize {
        self.pending_cap.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `spool_path = "/var/spool/appvisor"`
    /// - `runlist = "default"`
    /// - `pump_interval = 200ms`
    /// - `pending_cap = 128`
    /// - `bus_capacity = 1024`
    /// - `spawn_backoff = BackoffPolicy::default()`
    fn default() -> Self {
        Self {
            spool_path: PathBuf::from("/var/spool/appvisor"),
            runlist: "default".to_string(),
            pump_interval: Duration::from_millis(200),
            pending_cap: 128,
            bus_capacity: 1024,
            spawn_backoff: BackoffPolicy::default(),
        }
    }
}
