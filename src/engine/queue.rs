//! # Bounded FIFO backlog of pending sessions.
//!
//! Holds session ids in strict push order. Admission is decided by the
//! engine (the limit interacts with idle-slave availability there); the
//! queue itself only enforces ordering and bookkeeping.
//!
//! ## Invariants
//! - Strictly FIFO by push time; no reordering, no priority.
//! - One entry per session id; a session leaves the queue exactly once
//!   (dispatch, cancel, deadline, or engine stop).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// One queued session.
struct Entry {
    session: u64,
    queued_at: Instant,
}

/// FIFO of session ids awaiting an idle slave.
pub(crate) struct SessionQueue {
    entries: VecDeque<Entry>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Appends a session at the tail.
    pub fn push(&mut self, session: u64, now: Instant) {
        self.entries.push_back(Entry {
            session,
            queued_at: now,
        });
    }

    /// Pops the oldest queued session.
    pub fn pop_oldest(&mut self) -> Option<u64> {
        self.entries.pop_front().map(|e| e.session)
    }

    /// Current backlog depth.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the oldest queued session.
    pub fn peek_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .front()
            .map(|e| now.saturating_duration_since(e.queued_at))
    }

    /// Removes one session wherever it sits (cancellation). Returns true
    /// if it was queued.
    pub fn remove(&mut self, session: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.session != session);
        self.entries.len() != before
    }

    /// Removes and returns every session matching the predicate, in FIFO
    /// order (deadline sweep).
    pub fn take_matching(&mut self, mut expired: impl FnMut(u64) -> bool) -> Vec<u64> {
        let mut taken = Vec::new();
        self.entries.retain(|e| {
            if expired(e.session) {
                taken.push(e.session);
                false
            } else {
                true
            }
        });
        taken
    }

    /// Drains the whole backlog in FIFO order (engine stop).
    pub fn drain(&mut self) -> Vec<u64> {
        self.entries.drain(..).map(|e| e.session).collect()
    }
}
