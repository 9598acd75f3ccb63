//! # Slave: one supervised worker.
//!
//! Pure state machine; the engine loop feeds it events and deadline
//! checks, the pool owns it. All timers are wall-clock deadlines, so a
//! late tick after a stall may fire several of them in one pass.
//!
//! ## Transitions
//! ```text
//! unknown ──spawn dispatched──► spawning
//! spawning ──handshake──► active-idle        (heartbeat window opens)
//! spawning ──startup_timeout──► dead         (SpawnTimeout)
//! active-idle ──assign──► active-busy
//! active-busy ──choke/error──► active-idle   (session unbound)
//! active-* ──heartbeat──► (same)             (window reset)
//! active-* ──heartbeat_timeout──► dead       (HeartbeatLost)
//! active-* ──idle_timeout / drain──► draining
//! draining ──exit──► dead                    (reaped)
//! draining ──termination_timeout──► dead     (force-killed)
//! ```

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::manifest::Profile;
use crate::protocol::Frame;

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlaveState {
    /// Constructed; spawn not yet dispatched to the isolation backend.
    Unknown,
    /// Spawn dispatched; waiting for the handshake.
    Spawning,
    /// Handshaken and unbound.
    ActiveIdle,
    /// Serving one session.
    ActiveBusy,
    /// Politely stopped; may still be finishing a session.
    Draining,
    /// Terminal; the pool reaps it.
    Dead,
}

impl SlaveState {
    pub fn as_label(self) -> &'static str {
        match self {
            SlaveState::Unknown => "unknown",
            SlaveState::Spawning => "spawning",
            SlaveState::ActiveIdle => "active-idle",
            SlaveState::ActiveBusy => "active-busy",
            SlaveState::Draining => "draining",
            SlaveState::Dead => "dead",
        }
    }
}

/// A timer that fired for this slave; the engine acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlaveTimer {
    /// No handshake within `startup_timeout`.
    SpawnTimeout,
    /// Heartbeat window expired.
    HeartbeatLost,
    /// Idle past `idle_timeout`; drain politely.
    IdleTimeout,
    /// Draining past `termination_timeout`; force kill.
    DrainTimeout,
}

/// Per-slave counters surfaced by `info()`.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SlaveStats {
    /// Sessions completed cleanly.
    pub processed: u64,
    /// Sessions that ended in an error while bound here.
    pub failed: u64,
}

/// One supervised worker.
pub(crate) struct Slave {
    pub id: Uuid,
    state: SlaveState,
    pub spawned_at: Instant,
    /// Set by the handshake, refreshed by every heartbeat.
    last_heartbeat: Option<Instant>,
    /// When the current state was entered (idle/draining timers).
    state_since: Instant,
    /// Session bound to this slave, if any.
    session: Option<u64>,
    /// Engine → worker channel; present once the spawn completes.
    sink: Option<mpsc::Sender<Frame>>,
    pub stats: SlaveStats,
}

impl Slave {
    pub fn new(id: Uuid, now: Instant) -> Self {
        Self {
            id,
            state: SlaveState::Unknown,
            spawned_at: now,
            last_heartbeat: None,
            state_since: now,
            session: None,
            sink: None,
            stats: SlaveStats::default(),
        }
    }

    pub fn state(&self) -> SlaveState {
        self.state
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    pub fn sink(&self) -> Option<mpsc::Sender<Frame>> {
        self.sink.clone()
    }

    pub fn is_live(&self) -> bool {
        self.state != SlaveState::Dead
    }

    /// Spawn handed to the isolation backend; the startup clock runs from
    /// `spawned_at`.
    pub fn mark_spawning(&mut self, now: Instant) {
        debug_assert_eq!(self.state, SlaveState::Unknown);
        self.state = SlaveState::Spawning;
        self.spawned_at = now;
        self.state_since = now;
    }

    /// Backend produced a channel; still waiting for the handshake.
    pub fn set_sink(&mut self, sink: mpsc::Sender<Frame>) {
        self.sink = Some(sink);
    }

    /// Worker handshake: the slave joins the idle set.
    ///
    /// Returns false for a handshake in any state but `Spawning` (a
    /// protocol violation the engine logs and ignores).
    pub fn on_handshake(&mut self, now: Instant) -> bool {
        if self.state != SlaveState::Spawning {
            return false;
        }
        self.state = SlaveState::ActiveIdle;
        self.state_since = now;
        self.last_heartbeat = Some(now);
        true
    }

    /// Heartbeat: reset the liveness window.
    pub fn on_heartbeat(&mut self, now: Instant) {
        if matches!(
            self.state,
            SlaveState::ActiveIdle | SlaveState::ActiveBusy | SlaveState::Draining
        ) {
            self.last_heartbeat = Some(now);
        }
    }

    /// Binds a session; only valid on an idle slave.
    pub fn assign(&mut self, session: u64, now: Instant) {
        debug_assert_eq!(self.state, SlaveState::ActiveIdle);
        self.state = SlaveState::ActiveBusy;
        self.state_since = now;
        self.session = Some(session);
    }

    /// Unbinds the current session after choke/error/cancel; the slave
    /// returns to idle unless it is draining. Outcome counting is the
    /// engine's job.
    pub fn unbind(&mut self, now: Instant) -> Option<u64> {
        let session = self.session.take();
        if self.state == SlaveState::ActiveBusy {
            self.state = SlaveState::ActiveIdle;
            self.state_since = now;
        }
        session
    }

    /// Polite stop (idle timeout, pool shrink, engine stop).
    ///
    /// A bound session stays attached; the worker is expected to finish it
    /// before exiting.
    pub fn drain(&mut self, now: Instant) {
        if matches!(self.state, SlaveState::ActiveIdle | SlaveState::ActiveBusy) {
            self.state = SlaveState::Draining;
            self.state_since = now;
        }
    }

    /// Terminal transition; returns the session that was still bound, if
    /// any.
    pub fn die(&mut self) -> Option<u64> {
        self.state = SlaveState::Dead;
        self.sink = None;
        self.session.take()
    }

    /// Checks deadline timers against `now`. At most one timer is
    /// reported per call; the engine's action changes the state, and the
    /// next tick re-checks.
    pub fn expired_timer(&self, now: Instant, profile: &Profile) -> Option<SlaveTimer> {
        match self.state {
            SlaveState::Spawning => {
                if now.saturating_duration_since(self.spawned_at) >= profile.startup_timeout {
                    return Some(SlaveTimer::SpawnTimeout);
                }
            }
            SlaveState::ActiveIdle | SlaveState::ActiveBusy => {
                if let Some(beat) = self.last_heartbeat {
                    if now.saturating_duration_since(beat) >= profile.heartbeat_timeout {
                        return Some(SlaveTimer::HeartbeatLost);
                    }
                }
                if self.state == SlaveState::ActiveIdle
                    && now.saturating_duration_since(self.state_since) >= profile.idle_timeout
                {
                    return Some(SlaveTimer::IdleTimeout);
                }
            }
            SlaveState::Draining => {
                if now.saturating_duration_since(self.state_since) >= profile.termination_timeout {
                    return Some(SlaveTimer::DrainTimeout);
                }
            }
            SlaveState::Unknown | SlaveState::Dead => {}
        }
        None
    }

    /// Time since spawn, for `info()`.
    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.spawned_at)
    }
}
