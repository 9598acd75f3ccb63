//! # Pool: the multiset of slaves for one app.
//!
//! Owns every [`Slave`] and the idle order. Growth is one slave at a time:
//! a spawn in flight blocks further spawns, so a slow isolation backend is
//! never hit with a thundering herd; the grow check re-runs after each
//! spawn completes, so catch-up to `pool_limit` is linear in events.
//!
//! Shrink is not the pool's job - idle slaves drain themselves through
//! `idle_timeout` at the slave level.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use uuid::Uuid;

use crate::manifest::Profile;
use crate::policies::BackoffPolicy;

use super::slave::{Slave, SlaveState};

/// Slaves keyed by id, plus the derived idle view.
pub(crate) struct Pool {
    slaves: HashMap<Uuid, Slave>,
    /// Idle ids, FIFO by time-became-idle. May hold stale entries; they
    /// are validated on pop.
    idle: VecDeque<Uuid>,
    /// Earliest instant the next spawn may be dispatched (set after spawn
    /// failures).
    retry_at: Option<Instant>,
    prev_retry_delay: Option<Duration>,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            slaves: HashMap::new(),
            idle: VecDeque::new(),
            retry_at: None,
            prev_retry_delay: None,
        }
    }

    /// Registers a freshly constructed slave.
    pub fn insert(&mut self, slave: Slave) {
        self.slaves.insert(slave.id, slave);
    }

    pub fn get(&self, id: Uuid) -> Option<&Slave> {
        self.slaves.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Slave> {
        self.slaves.get_mut(&id)
    }

    /// Live slaves (anything not dead).
    pub fn size(&self) -> usize {
        self.slaves.values().filter(|s| s.is_live()).count()
    }

    /// Slaves whose spawn has not handshaken yet.
    pub fn spawning(&self) -> usize {
        self.slaves
            .values()
            .filter(|s| matches!(s.state(), SlaveState::Unknown | SlaveState::Spawning))
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.slaves
            .values()
            .filter(|s| s.state() == SlaveState::ActiveIdle)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True if `acquire_idle` would succeed.
    pub fn has_idle(&self) -> bool {
        self.idle
            .iter()
            .any(|id| self.state_of(*id) == Some(SlaveState::ActiveIdle))
    }

    /// Pops the slave that has been idle the longest, skipping entries
    /// that died or got busy since they were enqueued.
    pub fn acquire_idle(&mut self) -> Option<Uuid> {
        while let Some(id) = self.idle.pop_front() {
            if self.state_of(id) == Some(SlaveState::ActiveIdle) {
                return Some(id);
            }
        }
        None
    }

    /// Returns a slave to the back of the idle order.
    pub fn release(&mut self, id: Uuid) {
        if self.state_of(id) == Some(SlaveState::ActiveIdle) {
            self.idle.push_back(id);
        }
    }

    /// Removes a dead slave entirely. Idle-order staleness is handled by
    /// `acquire_idle`.
    pub fn reap(&mut self, id: Uuid) -> Option<Slave> {
        self.slaves.remove(&id)
    }

    /// Grow decision, evaluated once per tick:
    /// pool below limit, backlog at or past the threshold, nothing already
    /// spawning, and no spawn-failure backoff pending.
    pub fn wants_grow(&self, queue_len: usize, profile: &Profile, now: Instant) -> bool {
        if self.size() >= profile.pool_limit {
            return false;
        }
        if queue_len < profile.grow_threshold {
            return false;
        }
        if self.spawning() > 0 {
            return false;
        }
        match self.retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Records a spawn failure and schedules the next attempt.
    pub fn note_spawn_failure(&mut self, now: Instant, backoff: &BackoffPolicy) -> Duration {
        let delay = backoff.next(self.prev_retry_delay);
        self.prev_retry_delay = Some(delay);
        self.retry_at = Some(now + delay);
        delay
    }

    /// A worker handshook; spawn failures are forgotten.
    pub fn note_spawn_success(&mut self) {
        self.prev_retry_delay = None;
        self.retry_at = None;
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.slaves.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slave> {
        self.slaves.values()
    }

    fn state_of(&self, id: Uuid) -> Option<SlaveState> {
        self.slaves.get(&id).map(|s| s.state())
    }
}
