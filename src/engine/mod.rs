//! # Engine: queue + pool + dispatch loop for one app.
//!
//! Each engine is a single actor task that owns its [`SessionQueue`],
//! [`Pool`], and live [`Session`]s outright - no locks, no shared mutable
//! state. Everything enters through channels:
//!
//! ```text
//!                 ┌───────────────────────────────────────────┐
//!  Engine handle ─┤ commands (enqueue/write/cancel/info/stop) │
//!                 ├───────────────────────────────────────────┤
//!  spawn helpers ─┤ slave events (spawned/frame/exited)       ├─► loop ─► tick()
//!                 ├───────────────────────────────────────────┤
//!  tokio timer  ──┤ safety pump (~200 ms)                     │
//!                 └───────────────────────────────────────────┘
//! ```
//!
//! `tick()` runs after every observable event and performs, in order:
//! deadline sweep, dispatch (pair queued sessions with idle slaves), one
//! grow-policy evaluation, slave timer scan, and outbox pumping. It is
//! idempotent; running it twice in a row is a no-op.
//!
//! ## Rules
//! - Nothing inside the loop blocks: storage and isolation spawns run in
//!   helper tasks that report back through the slave-event channel, and
//!   frames move with `try_send`.
//! - Timers are wall-clock deadlines; a tick after a stall may fire many
//!   of them in one pass.
//! - Idle slaves are assigned first-idle-first-assigned; sessions strictly
//!   FIFO.

mod pool;
mod queue;
mod session;
mod slave;

pub use slave::SlaveStats;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EnqueueError, IsolateError, SessionError, SlaveFault, StopOutcome};
use crate::events::{Bus, Event, EventKind};
use crate::isolate::{Isolate, SpawnRequest, TerminateMode, WorkerHandle};
use crate::manifest::{Manifest, Profile};
use crate::policies::BackoffPolicy;
use crate::protocol::{Frame, UpstreamFrame};

use pool::Pool;
use queue::SessionQueue;
use session::{Session, SessionState, WriteOutcome};
use slave::{Slave, SlaveState, SlaveTimer};

/// Capacity of the handle → loop command channel.
const COMMAND_CAPACITY: usize = 1024;
/// Capacity of the slave-event channel feeding the loop.
const SLAVE_EVENT_CAPACITY: usize = 1024;
/// Abort code sent to a worker when the caller cancels a session.
const CANCEL_CODE: u32 = 0;

/// Requests accepted by the engine loop.
enum Command {
    Enqueue {
        event: String,
        upstream: mpsc::UnboundedSender<UpstreamFrame>,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<SessionHandle, EnqueueError>>,
    },
    Write {
        session: u64,
        data: Vec<u8>,
    },
    Choke {
        session: u64,
    },
    Cancel {
        session: u64,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Info {
        reply: oneshot::Sender<EngineInfo>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
}

/// Notifications from spawn helpers and worker relay tasks.
enum SlaveEvent {
    Spawned {
        id: Uuid,
        result: Result<WorkerHandle, IsolateError>,
    },
    Frame {
        id: Uuid,
        frame: Frame,
    },
    Exited {
        id: Uuid,
        code: i32,
    },
}

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    /// Accepting and dispatching sessions.
    Running,
    /// Refusing new sessions; in-flight work drains.
    Paused,
    /// Stop in progress; waiting for the pool to empty.
    Stopping,
    /// Terminal.
    Stopped,
}

/// Session counters since engine start.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SessionCounters {
    /// Sessions admitted to the queue.
    pub accepted: u64,
    /// Sessions rejected at admission.
    pub rejected: u64,
    /// Sessions that closed cleanly.
    pub completed: u64,
    /// Sessions that closed with an error.
    pub failed: u64,
    /// Sessions cancelled by their caller.
    pub cancelled: u64,
}

/// Per-slave view in [`EngineInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct SlaveInfo {
    /// Slave id.
    pub id: Uuid,
    /// Current state label (`spawning`, `active-idle`, …).
    pub state: &'static str,
    /// Milliseconds since spawn.
    pub uptime_ms: u64,
    /// Session outcome counters.
    pub stats: SlaveStats,
}

/// Pool view in [`EngineInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    /// Live slaves.
    pub size: usize,
    /// Slaves currently idle.
    pub idle: usize,
    /// Slaves whose spawn has not handshaken yet.
    pub spawning: usize,
    /// Configured `pool_limit`.
    pub limit: usize,
    /// Per-slave details.
    pub slaves: Vec<SlaveInfo>,
}

/// Queue view in [`EngineInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    /// Current backlog depth.
    pub depth: usize,
    /// Configured `queue_limit`.
    pub limit: usize,
    /// Age of the oldest queued session, in milliseconds.
    pub oldest_ms: Option<u64>,
}

/// Point-in-time snapshot returned by `info()`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    /// App this engine serves.
    pub app: String,
    /// Engine state.
    pub state: EngineState,
    /// Worker pool snapshot.
    pub pool: PoolInfo,
    /// Backlog snapshot.
    pub queue: QueueInfo,
    /// Session counters since start.
    pub sessions: SessionCounters,
}

/// Caller-side handle to one admitted session.
///
/// All operations are fire-and-forget into the engine loop; results
/// (worker chunks, choke, errors) arrive on the upstream channel the
/// caller supplied at enqueue time.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: u64,
    cmd: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Session (and wire span) id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sends one payload frame. Frames written before the session is
    /// assigned are buffered, bounded by the engine's pending cap.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SessionError> {
        self.cmd
            .send(Command::Write {
                session: self.id,
                data,
            })
            .await
            .map_err(|_| SessionError::EngineStopped)
    }

    /// Signals end of the caller's input stream.
    pub async fn choke(&self) -> Result<(), SessionError> {
        self.cmd
            .send(Command::Choke { session: self.id })
            .await
            .map_err(|_| SessionError::EngineStopped)
    }

    /// Cancels the session. Always safe; idempotent.
    pub async fn cancel(&self) {
        let _ = self.cmd.send(Command::Cancel { session: self.id }).await;
    }
}

/// Handle to a running engine loop.
///
/// Cheap to clone; dropping every handle (including session handles)
/// makes the loop stop itself.
#[derive(Clone)]
pub struct Engine {
    cmd: mpsc::Sender<Command>,
}

impl Engine {
    /// Spawns the engine loop for `manifest` and returns its handle. The
    /// engine starts in the running state.
    pub(crate) fn spawn(
        manifest: Arc<Manifest>,
        config: &Config,
        isolate: Arc<dyn Isolate>,
        bus: Bus,
    ) -> Engine {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (slave_tx, slave_rx) = mpsc::channel(SLAVE_EVENT_CAPACITY);

        let engine_loop = EngineLoop {
            app: manifest.name.clone(),
            profile: manifest.profile.clone(),
            manifest,
            pending_cap: config.pending_cap_clamped(),
            pump_interval: config.pump_interval,
            spawn_backoff: config.spawn_backoff,
            isolate,
            bus,
            state: EngineState::Running,
            pool: Pool::new(),
            queue: SessionQueue::new(),
            sessions: HashMap::new(),
            counters: SessionCounters::default(),
            next_session: 1,
            stop_deadline: None,
            stop_replies: Vec::new(),
            killed_during_stop: 0,
            cmd_closed: false,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            slave_tx,
            slave_rx,
        };
        tokio::spawn(engine_loop.run());

        Engine { cmd: cmd_tx }
    }

    /// Admits a session or rejects it immediately.
    pub async fn enqueue(
        &self,
        event: impl Into<String>,
        upstream: mpsc::UnboundedSender<UpstreamFrame>,
        deadline: Option<Instant>,
    ) -> Result<SessionHandle, EnqueueError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::Enqueue {
                event: event.into(),
                upstream,
                deadline,
                reply,
            })
            .await
            .map_err(|_| EnqueueError::Stopped)?;
        rx.await.map_err(|_| EnqueueError::Stopped)?
    }

    /// Pauses admission; in-flight sessions drain. Returns false if the
    /// loop is already gone.
    pub async fn pause(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Command::Pause { reply }).await.is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    /// Resumes a paused engine.
    pub async fn resume(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Command::Resume { reply }).await.is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    /// Snapshot of pool, queue, and counters. `None` once the loop has
    /// stopped.
    pub async fn info(&self) -> Option<EngineInfo> {
        let (reply, rx) = oneshot::channel();
        self.cmd.send(Command::Info { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Stops the engine: refuses new work, cancels the backlog, drains
    /// slaves politely, and force-kills whatever outlives the grace
    /// window. Returns once the pool is empty.
    pub async fn stop(&self) -> StopOutcome {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Command::Stop { reply }).await.is_err() {
            return StopOutcome::Drained;
        }
        rx.await.unwrap_or(StopOutcome::Drained)
    }
}

/// The actor behind an [`Engine`] handle. Owns all mutable state.
struct EngineLoop {
    app: String,
    manifest: Arc<Manifest>,
    profile: Profile,
    pending_cap: usize,
    pump_interval: std::time::Duration,
    spawn_backoff: BackoffPolicy,
    isolate: Arc<dyn Isolate>,
    bus: Bus,

    state: EngineState,
    pool: Pool,
    queue: SessionQueue,
    sessions: HashMap<u64, Session>,
    counters: SessionCounters,
    next_session: u64,

    stop_deadline: Option<Instant>,
    stop_replies: Vec<oneshot::Sender<StopOutcome>>,
    killed_during_stop: usize,
    /// All handles dropped; the command branch of the select is disabled.
    cmd_closed: bool,

    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    slave_tx: mpsc::Sender<SlaveEvent>,
    slave_rx: mpsc::Receiver<SlaveEvent>,
}

impl EngineLoop {
    async fn run(mut self) {
        self.bus
            .publish(Event::now(EventKind::EngineStarted).with_app(&self.app));

        let mut pump = interval(self.pump_interval);
        pump.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state != EngineState::Stopped {
            tokio::select! {
                maybe = self.cmd_rx.recv(), if !self.cmd_closed => match maybe {
                    Some(cmd) => self.on_command(cmd).await,
                    // Every handle dropped: stop ourselves.
                    None => {
                        self.cmd_closed = true;
                        self.begin_stop(None, Instant::now()).await;
                    }
                },
                Some(ev) = self.slave_rx.recv() => self.on_slave_event(ev).await,
                _ = pump.tick() => {}
            }
            self.tick().await;
        }
    }

    // ---------------------------
    // Commands
    // ---------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                event,
                upstream,
                deadline,
                reply,
            } => {
                let _ = reply.send(self.admit(event, upstream, deadline));
            }
            Command::Write { session, data } => self.on_write(session, data),
            Command::Choke { session } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.choke();
                }
            }
            Command::Cancel { session } => self.on_cancel(session),
            Command::Pause { reply } => {
                if self.state == EngineState::Running {
                    self.state = EngineState::Paused;
                    self.bus
                        .publish(Event::now(EventKind::EnginePaused).with_app(&self.app));
                }
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                if self.state == EngineState::Paused {
                    self.state = EngineState::Running;
                    self.bus
                        .publish(Event::now(EventKind::EngineResumed).with_app(&self.app));
                }
                let _ = reply.send(());
            }
            Command::Info { reply } => {
                let _ = reply.send(self.snapshot(Instant::now()));
            }
            Command::Stop { reply } => self.begin_stop(Some(reply), Instant::now()).await,
        }
    }

    /// Admission: reject when not running; otherwise admit while the
    /// backlog is under `queue_limit` plus one slot per spawn in flight
    /// (a spawning slave is capacity already paid for), or - with a full
    /// (or zero) limit - when the queue is empty and an idle slave can
    /// take the session at once.
    fn admit(
        &mut self,
        event: String,
        upstream: mpsc::UnboundedSender<UpstreamFrame>,
        deadline: Option<Instant>,
    ) -> Result<SessionHandle, EnqueueError> {
        if self.state != EngineState::Running {
            self.counters.rejected += 1;
            self.bus.publish(
                Event::now(EventKind::SessionRejected)
                    .with_app(&self.app)
                    .with_reason(EnqueueError::Stopped.as_label()),
            );
            return Err(EnqueueError::Stopped);
        }

        let fits_backlog = self.queue.len() < self.profile.queue_limit + self.pool.spawning();
        let immediate = self.queue.is_empty() && self.pool.has_idle();
        if !fits_backlog && !immediate {
            self.counters.rejected += 1;
            self.bus.publish(
                Event::now(EventKind::SessionRejected)
                    .with_app(&self.app)
                    .with_reason(EnqueueError::Overflow.as_label()),
            );
            return Err(EnqueueError::Overflow);
        }

        let now = Instant::now();
        let id = self.next_session;
        self.next_session += 1;

        self.sessions.insert(
            id,
            Session::new(id, event, upstream, deadline, self.pending_cap, now),
        );
        self.queue.push(id, now);
        self.counters.accepted += 1;
        self.bus.publish(
            Event::now(EventKind::SessionQueued)
                .with_app(&self.app)
                .with_session(id),
        );

        Ok(SessionHandle {
            id,
            cmd: self.cmd_tx.clone(),
        })
    }

    fn on_write(&mut self, sid: u64, data: Vec<u8>) {
        let outcome = match self.sessions.get_mut(&sid) {
            Some(s) => s.write(data),
            None => return,
        };
        if outcome == WriteOutcome::Overflow {
            let cap = self.pending_cap;
            self.fail_session(sid, SessionError::BackpressureExceeded { cap }, Instant::now());
        }
    }

    fn on_cancel(&mut self, sid: u64) {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        let now = Instant::now();
        let bound = session.cancel();
        self.sessions.remove(&sid);
        self.queue.remove(sid);

        if let Some((slave_id, sink)) = bound {
            // Abort the span; the worker drops whatever it was doing.
            let _ = sink.try_send(Frame::Error {
                span: sid,
                code: CANCEL_CODE,
                message: "cancelled".to_string(),
            });
            if let Some(slave) = self.pool.get_mut(slave_id) {
                if slave.session() == Some(sid) {
                    slave.unbind(now);
                    if slave.state() == SlaveState::ActiveIdle {
                        self.pool.release(slave_id);
                    }
                }
            }
        }

        self.counters.cancelled += 1;
        self.bus.publish(
            Event::now(EventKind::SessionCancelled)
                .with_app(&self.app)
                .with_session(sid),
        );
    }

    /// Enters the stopping state: backlog is cancelled with
    /// `EngineStopped`, every slave is asked to drain, and the loop waits
    /// for the pool to empty (bounded by `termination_timeout`).
    async fn begin_stop(&mut self, reply: Option<oneshot::Sender<StopOutcome>>, now: Instant) {
        match self.state {
            EngineState::Stopped => {
                if let Some(r) = reply {
                    let _ = r.send(StopOutcome::Drained);
                }
                return;
            }
            EngineState::Stopping => {
                if let Some(r) = reply {
                    self.stop_replies.push(r);
                }
                return;
            }
            EngineState::Running | EngineState::Paused => {}
        }

        self.state = EngineState::Stopping;
        self.stop_deadline = Some(now + self.profile.termination_timeout);
        if let Some(r) = reply {
            self.stop_replies.push(r);
        }
        self.bus
            .publish(Event::now(EventKind::EngineStopping).with_app(&self.app));

        for sid in self.queue.drain() {
            self.fail_session(sid, SessionError::EngineStopped, now);
        }

        for id in self.pool.ids() {
            let Some(slave) = self.pool.get_mut(id) else {
                continue;
            };
            match slave.state() {
                SlaveState::ActiveIdle | SlaveState::ActiveBusy => {
                    slave.drain(now);
                    let _ = self.isolate.terminate(id, TerminateMode::Polite).await;
                    self.bus.publish(
                        Event::now(EventKind::SlaveDraining)
                            .with_app(&self.app)
                            .with_slave(id),
                    );
                }
                // Spawning slaves never served anyone; kill them outright.
                SlaveState::Unknown | SlaveState::Spawning => {
                    self.kill_slave(id, SlaveFault::Killed, now).await;
                }
                SlaveState::Draining | SlaveState::Dead => {}
            }
        }
    }

    // ---------------------------
    // Slave events
    // ---------------------------

    async fn on_slave_event(&mut self, ev: SlaveEvent) {
        match ev {
            SlaveEvent::Spawned { id, result } => self.on_spawned(id, result).await,
            SlaveEvent::Frame { id, frame } => self.on_frame(id, frame),
            SlaveEvent::Exited { id, code } => self.on_exited(id, code),
        }
    }

    async fn on_spawned(&mut self, id: Uuid, result: Result<WorkerHandle, IsolateError>) {
        let now = Instant::now();
        let Some(slave) = self.pool.get_mut(id) else {
            // The slave was reaped (startup timeout, stop) before the
            // backend came back; dispose of the orphan worker.
            if result.is_ok() {
                let _ = self.isolate.terminate(id, TerminateMode::Force).await;
            }
            return;
        };

        match result {
            Ok(handle) => {
                slave.set_sink(handle.sink.clone());
                spawn_relay(id, handle, self.slave_tx.clone());
            }
            Err(e) => {
                slave.die();
                self.pool.reap(id);
                let delay = self.pool.note_spawn_failure(now, &self.spawn_backoff);
                self.bus.publish(
                    Event::now(EventKind::SlaveDead)
                        .with_app(&self.app)
                        .with_slave(id)
                        .with_reason(SlaveFault::SpawnFailed.as_label())
                        .with_error(e.to_string())
                        .with_delay(delay),
                );
            }
        }
    }

    fn on_frame(&mut self, id: Uuid, frame: Frame) {
        let now = Instant::now();
        match frame {
            Frame::Handshake { .. } => {
                let Some(slave) = self.pool.get_mut(id) else {
                    return;
                };
                if slave.on_handshake(now) {
                    self.pool.note_spawn_success();
                    self.pool.release(id);
                    self.bus.publish(
                        Event::now(EventKind::SlaveActive)
                            .with_app(&self.app)
                            .with_slave(id),
                    );
                }
            }
            Frame::Heartbeat => {
                if let Some(slave) = self.pool.get_mut(id) {
                    slave.on_heartbeat(now);
                }
            }
            Frame::Chunk { span, data } => {
                if let Some(session) = self.sessions.get(&span) {
                    if session.state() == SessionState::Assigned {
                        session.relay_chunk(data);
                    }
                }
            }
            Frame::Choke { span } => self.complete_session(span, now),
            Frame::Error {
                span,
                code,
                message,
            } => {
                self.fail_session(span, SessionError::App { code, message }, now);
            }
            // Workers neither open spans toward the engine nor terminate it.
            Frame::Open { .. } | Frame::Terminate => {}
        }
    }

    fn on_exited(&mut self, id: Uuid, code: i32) {
        let now = Instant::now();
        let Some(slave) = self.pool.get_mut(id) else {
            return;
        };
        let was_draining = slave.state() == SlaveState::Draining;
        let bound = slave.die();
        self.pool.reap(id);

        if let Some(sid) = bound {
            self.fail_session(sid, SessionError::SlaveLost, now);
        }

        let mut event = Event::now(EventKind::SlaveDead)
            .with_app(&self.app)
            .with_slave(id)
            .with_reason(SlaveFault::Exited.as_label());
        if !was_draining {
            event = event.with_error(format!("unexpected exit, code {code}"));
        }
        self.bus.publish(event);
    }

    // ---------------------------
    // Tick
    // ---------------------------

    /// Runs the scheduling pass. Re-entrant-safe and idempotent; invoked
    /// after every event and from the safety pump.
    async fn tick(&mut self) {
        let now = Instant::now();
        self.sweep_deadlines(now);
        self.dispatch(now);
        self.maybe_grow(now);
        self.scan_timers(now).await;
        self.pump_sessions();
        self.check_stop(now).await;
    }

    /// Closes queued sessions whose deadline has passed; they are never
    /// assigned.
    fn sweep_deadlines(&mut self, now: Instant) {
        let sessions = &self.sessions;
        let expired = self.queue.take_matching(|sid| {
            sessions
                .get(&sid)
                .and_then(|s| s.deadline)
                .is_some_and(|d| now >= d)
        });
        for sid in expired {
            self.fail_session(sid, SessionError::DeadlineExceeded, now);
        }
    }

    /// Pairs queued sessions with idle slaves, oldest session first,
    /// first-idle slave first.
    fn dispatch(&mut self, now: Instant) {
        while !self.queue.is_empty() {
            let Some(slave_id) = self.pool.acquire_idle() else {
                break;
            };
            let sid = match self.queue.pop_oldest() {
                Some(sid) => sid,
                None => break,
            };

            let Some(sink) = self.pool.get(slave_id).and_then(|s| s.sink()) else {
                continue;
            };
            let Some(session) = self.sessions.get_mut(&sid) else {
                self.pool.release(slave_id);
                continue;
            };

            session.attach(slave_id, sink);
            if let Some(slave) = self.pool.get_mut(slave_id) {
                slave.assign(sid, now);
            }
            self.bus.publish(
                Event::now(EventKind::SessionAssigned)
                    .with_app(&self.app)
                    .with_session(sid)
                    .with_slave(slave_id),
            );
        }
    }

    /// Evaluates the grow policy exactly once per tick.
    fn maybe_grow(&mut self, now: Instant) {
        if self.state == EngineState::Stopping || self.state == EngineState::Stopped {
            return;
        }
        if !self.pool.wants_grow(self.queue.len(), &self.profile, now) {
            return;
        }

        let id = Uuid::new_v4();
        let mut slave = Slave::new(id, now);
        slave.mark_spawning(now);
        self.pool.insert(slave);
        self.bus.publish(
            Event::now(EventKind::SlaveSpawning)
                .with_app(&self.app)
                .with_slave(id),
        );

        let isolate = Arc::clone(&self.isolate);
        let request = SpawnRequest {
            app: self.app.clone(),
            slave_id: id,
            manifest_path: self.manifest.path.clone(),
            entry: self.manifest.slave.clone(),
            env: Vec::new(),
        };
        let tx = self.slave_tx.clone();
        tokio::spawn(async move {
            let result = isolate.spawn(request).await;
            let _ = tx.send(SlaveEvent::Spawned { id, result }).await;
        });
    }

    /// Advances slave state machines whose deadline timers expired.
    async fn scan_timers(&mut self, now: Instant) {
        for id in self.pool.ids() {
            let Some(timer) = self
                .pool
                .get(id)
                .and_then(|s| s.expired_timer(now, &self.profile))
            else {
                continue;
            };

            match timer {
                SlaveTimer::SpawnTimeout => {
                    self.kill_slave(id, SlaveFault::SpawnTimeout, now).await;
                }
                SlaveTimer::HeartbeatLost => {
                    self.kill_slave(id, SlaveFault::HeartbeatLost, now).await;
                }
                SlaveTimer::IdleTimeout => {
                    if let Some(slave) = self.pool.get_mut(id) {
                        slave.drain(now);
                    }
                    let _ = self.isolate.terminate(id, TerminateMode::Polite).await;
                    self.bus.publish(
                        Event::now(EventKind::SlaveDraining)
                            .with_app(&self.app)
                            .with_slave(id),
                    );
                }
                SlaveTimer::DrainTimeout => {
                    if self.state == EngineState::Stopping {
                        self.killed_during_stop += 1;
                    }
                    self.kill_slave(id, SlaveFault::Killed, now).await;
                }
            }
        }
    }

    /// Flushes assigned sessions' outboxes into their slave channels.
    fn pump_sessions(&mut self) {
        for session in self.sessions.values_mut() {
            if session.state() == SessionState::Assigned {
                session.pump();
            }
        }
    }

    /// Finishes a stop once the pool is empty, or force-kills whatever is
    /// left when the grace window closes.
    async fn check_stop(&mut self, now: Instant) {
        if self.state != EngineState::Stopping {
            return;
        }
        let Some(deadline) = self.stop_deadline else {
            return;
        };

        if !self.pool.is_empty() && now >= deadline {
            for id in self.pool.ids() {
                if self.pool.get(id).is_some_and(|s| s.is_live()) {
                    self.killed_during_stop += 1;
                    self.kill_slave(id, SlaveFault::Killed, now).await;
                }
            }
        }

        if self.pool.is_empty() {
            if self.killed_during_stop > 0 {
                self.bus.publish(
                    Event::now(EventKind::DrainTimeout)
                        .with_app(&self.app)
                        .with_delay(self.profile.termination_timeout),
                );
            }
            self.state = EngineState::Stopped;
            self.bus
                .publish(Event::now(EventKind::EngineStopped).with_app(&self.app));
            let outcome = match self.killed_during_stop {
                0 => StopOutcome::Drained,
                killed => StopOutcome::DrainTimeout { killed },
            };
            for reply in self.stop_replies.drain(..) {
                let _ = reply.send(outcome);
            }
        }
    }

    // ---------------------------
    // Helpers
    // ---------------------------

    /// Force-terminates one slave, closing its bound session with
    /// `SlaveLost`.
    async fn kill_slave(&mut self, id: Uuid, fault: SlaveFault, now: Instant) {
        let Some(slave) = self.pool.get_mut(id) else {
            return;
        };
        let bound = slave.die();
        self.pool.reap(id);
        let _ = self.isolate.terminate(id, TerminateMode::Force).await;

        if let Some(sid) = bound {
            self.fail_session(sid, SessionError::SlaveLost, now);
        }

        self.bus.publish(
            Event::now(EventKind::SlaveDead)
                .with_app(&self.app)
                .with_slave(id)
                .with_reason(fault.as_label()),
        );
    }

    /// Closes a session cleanly after a worker choke.
    fn complete_session(&mut self, sid: u64, now: Instant) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        let bound = session.assigned_slave();
        session.close_ok();
        self.counters.completed += 1;

        if let Some(slave_id) = bound {
            if let Some(slave) = self.pool.get_mut(slave_id) {
                if slave.session() == Some(sid) {
                    slave.unbind(now);
                    slave.stats.processed += 1;
                    if slave.state() == SlaveState::ActiveIdle {
                        self.pool.release(slave_id);
                    }
                }
            }
        }

        self.bus.publish(
            Event::now(EventKind::SessionCompleted)
                .with_app(&self.app)
                .with_session(sid)
                .with_delay(now.saturating_duration_since(session.created_at)),
        );
    }

    /// Closes a session with an error, unbinding its slave if one is
    /// attached.
    fn fail_session(&mut self, sid: u64, err: SessionError, now: Instant) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        self.queue.remove(sid);
        let bound = session.assigned_slave();
        let reason = err.as_label();
        session.close_error(err);
        self.counters.failed += 1;

        if let Some(slave_id) = bound {
            if let Some(slave) = self.pool.get_mut(slave_id) {
                if slave.session() == Some(sid) {
                    slave.unbind(now);
                    slave.stats.failed += 1;
                    if slave.state() == SlaveState::ActiveIdle {
                        self.pool.release(slave_id);
                    }
                }
            }
        }

        self.bus.publish(
            Event::now(EventKind::SessionFailed)
                .with_app(&self.app)
                .with_session(sid)
                .with_reason(reason)
                .with_delay(now.saturating_duration_since(session.created_at)),
        );
    }

    fn snapshot(&self, now: Instant) -> EngineInfo {
        let slaves = self
            .pool
            .iter()
            .map(|s| SlaveInfo {
                id: s.id,
                state: s.state().as_label(),
                uptime_ms: s.uptime(now).as_millis() as u64,
                stats: s.stats,
            })
            .collect();

        EngineInfo {
            app: self.app.clone(),
            state: self.state,
            pool: PoolInfo {
                size: self.pool.size(),
                idle: self.pool.idle_count(),
                spawning: self.pool.spawning(),
                limit: self.profile.pool_limit,
                slaves,
            },
            queue: QueueInfo {
                depth: self.queue.len(),
                limit: self.profile.queue_limit,
                oldest_ms: self.queue.peek_age(now).map(|d| d.as_millis() as u64),
            },
            sessions: self.counters,
        }
    }
}

/// Forwards worker frames and the exit notification into the engine's
/// slave-event channel. One task per live worker.
fn spawn_relay(id: Uuid, handle: WorkerHandle, tx: mpsc::Sender<SlaveEvent>) {
    let mut source = handle.source;
    let mut exited = handle.exited;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = source.recv() => match maybe {
                    Some(frame) => {
                        if tx.send(SlaveEvent::Frame { id, frame }).await.is_err() {
                            return;
                        }
                    }
                    // Channel closed: the worker is going away; wait for
                    // the exit code below.
                    None => break,
                },
                code = &mut exited => {
                    let code = code.unwrap_or(-1);
                    let _ = tx.send(SlaveEvent::Exited { id, code }).await;
                    return;
                }
            }
        }

        let code = exited.await.unwrap_or(-1);
        let _ = tx.send(SlaveEvent::Exited { id, code }).await;
    });
}
