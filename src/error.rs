//! # Error types used by the appvisor runtime.
//!
//! Failures are grouped by the surface they come from:
//!
//! - [`StorageError`] - the backing storage collaborator.
//! - [`ArchiveError`] - app bundle extraction.
//! - [`ConfigError`] - manifest/profile/runlist resolution; fatal to the
//!   affected app only.
//! - [`IsolateError`] - the isolation collaborator (spawn/terminate).
//! - [`EnqueueError`] - admission rejections returned to the caller.
//! - [`SessionError`] - terminal failure kinds delivered on a session's
//!   upstream.
//! - [`NodeError`] - node-level app registry operations.
//!
//! All enums provide `as_label()` returning a short stable snake_case
//! string for logs and metrics.

use thiserror::Error;

/// Errors produced by the storage backend.
///
/// Reads are recoverable (callers fall back or skip); cache writes are
/// surfaced as warnings and do not abort the operation.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StorageError {
    /// The requested key does not exist in the collection.
    #[error("'{collection}/{key}' not found")]
    NotFound {
        /// Collection that was queried.
        collection: String,
        /// Missing key.
        key: String,
    },
    /// Backend I/O failed.
    #[error("storage backend error: {reason}")]
    Backend {
        /// Human-readable failure description.
        reason: String,
    },
}

impl StorageError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "storage_not_found",
            StorageError::Backend { .. } => "storage_backend",
        }
    }

    /// True if the error means the key simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Backend {
            reason: e.to_string(),
        }
    }
}

/// Errors produced while unpacking an app bundle into the spool.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The blob is not a readable archive.
    #[error("unable to read archive: {reason}")]
    Corrupt {
        /// Decoder failure description.
        reason: String,
    },
    /// Filesystem operation on the spool directory failed.
    #[error("spool i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ArchiveError::Corrupt { .. } => "archive_corrupt",
            ArchiveError::Io(_) => "archive_io",
        }
    }
}

/// Errors raised while resolving an app's manifest, profile, or runlist.
///
/// Fatal to the affected app only; the node keeps running.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The app is missing from storage or its bundle could not be deployed.
    #[error("the '{name}' app is not available")]
    AppNotAvailable {
        /// App name.
        name: String,
    },
    /// A policy value failed validation.
    #[error("invalid profile for '{name}': {reason}")]
    InvalidProfile {
        /// App name.
        name: String,
        /// Which constraint was violated.
        reason: String,
    },
    /// A stored document could not be decoded.
    #[error("malformed document '{collection}/{key}': {reason}")]
    Malformed {
        /// Collection of the offending document.
        collection: String,
        /// Key of the offending document.
        key: String,
        /// Decoder failure description.
        reason: String,
    },
}

impl ConfigError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::AppNotAvailable { .. } => "config_app_not_available",
            ConfigError::InvalidProfile { .. } => "config_invalid_profile",
            ConfigError::Malformed { .. } => "config_malformed",
        }
    }
}

/// Errors produced by the isolation backend.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IsolateError {
    /// The worker process could not be spawned.
    #[error("unable to spawn worker: {reason}")]
    SpawnFailed {
        /// Backend failure description.
        reason: String,
    },
    /// The backend has no record of the worker.
    #[error("unknown worker '{id}'")]
    UnknownWorker {
        /// Slave id the call referred to.
        id: uuid::Uuid,
    },
}

impl IsolateError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            IsolateError::SpawnFailed { .. } => "isolate_spawn_failed",
            IsolateError::UnknownWorker { .. } => "isolate_unknown_worker",
        }
    }
}

/// Admission rejections returned by `enqueue`.
///
/// A rejected session never existed as far as the engine is concerned;
/// nothing was queued and no upstream frames will follow.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The backlog is at `queue_limit` (or the limit is zero and no idle
    /// slave was available).
    #[error("session queue is full")]
    Overflow,
    /// The engine is paused or stopped and refuses new work.
    #[error("engine is not accepting sessions")]
    Stopped,
}

impl EnqueueError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            EnqueueError::Overflow => "enqueue_overflow",
            EnqueueError::Stopped => "enqueue_stopped",
        }
    }
}

/// Terminal failure kinds for an admitted session.
///
/// Delivered to the session's upstream as the closing error frame.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The slave serving this session died before completing it.
    #[error("assigned slave died before the session completed")]
    SlaveLost,
    /// The session sat in the queue past its deadline.
    #[error("session deadline exceeded while queued")]
    DeadlineExceeded,
    /// The pre-assignment write buffer overflowed its cap.
    #[error("pre-dispatch write buffer overflowed (cap {cap})")]
    BackpressureExceeded {
        /// Configured buffer cap, in frames.
        cap: usize,
    },
    /// The engine stopped while the session was still queued.
    #[error("engine stopped")]
    EngineStopped,
    /// The worker reported an application error on this session's span.
    #[error("worker error {code}: {message}")]
    App {
        /// Application-defined error code.
        code: u32,
        /// Worker-supplied message.
        message: String,
    },
}

impl SessionError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionError::SlaveLost => "session_slave_lost",
            SessionError::DeadlineExceeded => "session_deadline_exceeded",
            SessionError::BackpressureExceeded { .. } => "session_backpressure_exceeded",
            SessionError::EngineStopped => "session_engine_stopped",
            SessionError::App { .. } => "session_app_error",
        }
    }
}

/// Errors raised by node-level registry operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NodeError {
    /// Attempted to start an app that is already running.
    #[error("app '{name}' is already running")]
    AppAlreadyRunning {
        /// Duplicate app name.
        name: String,
    },
    /// Attempted to operate on an app that is not in the registry.
    #[error("app '{name}' is not running")]
    AppNotRunning {
        /// Missing app name.
        name: String,
    },
    /// The app's manifest or profile could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Runlist or app listing could not be read from storage.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl NodeError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            NodeError::AppAlreadyRunning { .. } => "node_app_already_running",
            NodeError::AppNotRunning { .. } => "node_app_not_running",
            NodeError::Config(e) => e.as_label(),
            NodeError::Storage(e) => e.as_label(),
        }
    }
}

/// Why a slave left the pool.
///
/// Attached to `SlaveDead` events and used to decide how bound sessions
/// are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveFault {
    /// No handshake within `startup_timeout` after spawn.
    SpawnTimeout,
    /// Inter-heartbeat gap exceeded `heartbeat_timeout`.
    HeartbeatLost,
    /// The isolation backend failed to produce a worker at all.
    SpawnFailed,
    /// The worker exited on its own.
    Exited,
    /// The worker was force-killed after `termination_timeout`.
    Killed,
}

impl SlaveFault {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            SlaveFault::SpawnTimeout => "slave_spawn_timeout",
            SlaveFault::HeartbeatLost => "slave_heartbeat_lost",
            SlaveFault::SpawnFailed => "slave_spawn_failed",
            SlaveFault::Exited => "slave_exited",
            SlaveFault::Killed => "slave_killed",
        }
    }
}

/// Engine drain outcome reported by `stop()`.
///
/// `DrainTimeout` is not a failure of the stop itself; it means some
/// slaves had to be force-killed after `termination_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every slave exited within the grace window.
    Drained,
    /// The grace window elapsed; remaining slaves were force-killed.
    DrainTimeout {
        /// How many slaves were killed.
        killed: usize,
    },
}
