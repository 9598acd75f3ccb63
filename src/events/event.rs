//! # Runtime events emitted by the node, engines, and slaves.
//!
//! The [`EventKind`] enum classifies event types across five categories:
//! - **Subscriber events**: fan-out plumbing (panic, overflow)
//! - **Node events**: app registry changes
//! - **Engine events**: per-app engine lifecycle
//! - **Slave events**: worker pool transitions
//! - **Session events**: admission, dispatch, and terminal states
//!
//! The [`Event`] struct carries additional metadata such as timestamps,
//! app/slave/session identifiers, error messages, and grace delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. This guarantees that events can be ordered correctly even
//! when delivered out-of-order through async channels.
//!
//! ## Event flow examples
//!
//! ### Happy-path session
//! ```text
//! Engine::enqueue()
//!   → SessionQueued
//!   → [idle slave found]
//!   → SessionAssigned
//!   → [worker chunk / choke]
//!   → SessionCompleted
//! ```
//!
//! ### Slave lifecycle
//! ```text
//! grow policy fires
//!   → SlaveSpawning
//!   → [worker handshake]
//!   → SlaveActive
//!   → [idle_timeout]
//!   → SlaveDraining
//!   → [worker exit]
//!   → SlaveDead
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    SubscriberPanicked,
    /// Subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,

    // === Node events ===
    /// App was started and added to the registry.
    AppStarted,
    /// App was paused and removed from the registry.
    AppPaused,
    /// App failed to initialize (runlist boot keeps going).
    AppStartFailed,
    /// Runlist could not be read at boot; the node starts empty.
    RunlistSkipped,

    // === Manifest events ===
    /// App bundle was unpacked into the spool directory.
    AppDeployed,
    /// Manifest could not be written to the cache (non-fatal).
    CacheWriteFailed,

    // === Engine lifecycle events ===
    /// Engine accepted its first tick and is dispatching.
    EngineStarted,
    /// Engine paused; new enqueues are refused, in-flight drains.
    EnginePaused,
    /// Paused engine resumed accepting sessions.
    EngineResumed,
    /// Engine began a full stop; queued sessions were cancelled.
    EngineStopping,
    /// Engine finished stopping; the pool is empty.
    EngineStopped,
    /// Drain grace elapsed; remaining slaves were force-killed.
    DrainTimeout,

    // === Slave events ===
    /// A spawn was dispatched to the isolation backend.
    SlaveSpawning,
    /// Worker completed its handshake and joined the idle set.
    SlaveActive,
    /// Slave was asked to stop politely and is draining.
    SlaveDraining,
    /// Slave reached its terminal state and left the pool.
    SlaveDead,

    // === Session events ===
    /// Session admitted to the backlog.
    SessionQueued,
    /// Session paired with an idle slave.
    SessionAssigned,
    /// Session closed cleanly (worker choke).
    SessionCompleted,
    /// Session closed with an error.
    SessionFailed,
    /// Session cancelled by the caller.
    SessionCancelled,
    /// Session rejected at admission.
    SessionRejected,
}

/// Runtime event with optional metadata.
///
/// Carries information about app, slave, and session transitions, errors,
/// and grace delays.
///
/// ## Fields
///
/// - `seq`: Unique sequence number for ordering (monotonically increasing)
/// - `at`: Wall-clock timestamp (may go backwards due to NTP, use for logging only)
/// - `kind`: Event classification
/// - `app`, `slave`, `session`, `error`, `reason`, `delay`: Optional metadata
#[derive(Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    /// Used to determine event ordering across async boundaries.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the app, if applicable.
    pub app: Option<String>,
    /// Slave id, if the event concerns one worker.
    pub slave: Option<Uuid>,
    /// Session id, if the event concerns one invocation.
    pub session: Option<u64>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
    /// Short machine-readable cause (snake_case label).
    pub reason: Option<&'static str>,
    /// Grace or backoff delay (if relevant).
    pub delay: Option<Duration>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp and
    /// the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            app: None,
            slave: None,
            session: None,
            error: None,
            reason: None,
            delay: None,
        }
    }

    /// Attaches an app name.
    pub fn with_app(mut self, name: impl Into<String>) -> Self {
        self.app = Some(name.into());
        self
    }

    /// Attaches a slave id.
    pub fn with_slave(mut self, id: Uuid) -> Self {
        self.slave = Some(id);
        self
    }

    /// Attaches a session id.
    pub fn with_session(mut self, id: u64) -> Self {
        self.session = Some(id);
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Attaches a stable cause label.
    pub fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Attaches a grace or backoff delay.
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// Creates a subscriber overflow event.
    ///
    /// Emitted when a subscriber's queue is full and an event is dropped.
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow)
            .with_reason(reason)
            .with_error(format!("subscriber={subscriber}"))
    }

    /// Creates a subscriber panic event.
    ///
    /// Emitted when a subscriber panics during event processing.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::now(EventKind::SubscriberPanicked)
            .with_error(format!("subscriber={subscriber}: {info}"))
    }
}
