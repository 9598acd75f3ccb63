//! Shared test harness: scriptable isolation backend, storage seeding,
//! and event-waiting helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use appvisor::{
    App, Bus, Config, Event, EventKind, Frame, Isolate, IsolateError, MemoryStorage, SessionHandle,
    SpawnRequest, Storage, TerminateMode, UpstreamFrame, WorkerHandle,
};

/// How long a scripted worker waits between heartbeats.
pub const HEARTBEAT_EVERY: Duration = Duration::from_millis(100);

/// Scripted behavior of mock workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Handshake, heartbeat, echo every chunk back on choke.
    Echo,
    /// Never handshake, never exit (until killed).
    Mute,
    /// Handshake once, then fall silent.
    NoHeartbeat,
    /// Handshake, heartbeat, accept spans but never answer; ignores
    /// polite termination.
    Busy,
    /// Like `Busy`, but a polite terminate completes open spans before
    /// exiting.
    BusyFinishOnTerminate,
}

struct WorkerCtl {
    sink_tx: mpsc::Sender<Frame>,
    kill: CancellationToken,
}

/// In-process isolation backend running scripted workers.
pub struct MockIsolate {
    mode: WorkerMode,
    workers: Arc<DashMap<Uuid, WorkerCtl>>,
    spawn_count: std::sync::atomic::AtomicUsize,
}

impl MockIsolate {
    pub fn new(mode: WorkerMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            workers: Arc::new(DashMap::new()),
            spawn_count: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Total spawns ever requested.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Ids of live workers.
    pub fn worker_ids(&self) -> Vec<Uuid> {
        self.workers.iter().map(|e| *e.key()).collect()
    }

    /// Simulates a crash of every live worker.
    pub fn kill_all(&self) {
        for entry in self.workers.iter() {
            entry.value().kill.cancel();
        }
    }
}

#[async_trait]
impl Isolate for MockIsolate {
    async fn spawn(&self, request: SpawnRequest) -> Result<WorkerHandle, IsolateError> {
        self.spawn_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let (sink_tx, sink_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();

        self.workers.insert(
            request.slave_id,
            WorkerCtl {
                sink_tx: sink_tx.clone(),
                kill: kill.clone(),
            },
        );

        let mode = self.mode;
        let id = request.slave_id;
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let code = tokio::select! {
                _ = kill.cancelled() => -9,
                code = worker_body(mode, id, sink_rx, out_tx) => code,
            };
            workers.remove(&id);
            let _ = exit_tx.send(code);
        });

        Ok(WorkerHandle {
            sink: sink_tx,
            source: out_rx,
            exited: exit_rx,
        })
    }

    async fn terminate(&self, id: Uuid, mode: TerminateMode) -> Result<(), IsolateError> {
        let ctl = self
            .workers
            .get(&id)
            .ok_or(IsolateError::UnknownWorker { id })?;
        match mode {
            TerminateMode::Polite => {
                let _ = ctl.sink_tx.try_send(Frame::Terminate);
            }
            TerminateMode::Force => ctl.kill.cancel(),
        }
        Ok(())
    }
}

async fn worker_body(
    mode: WorkerMode,
    id: Uuid,
    mut inbox: mpsc::Receiver<Frame>,
    out: mpsc::Sender<Frame>,
) -> i32 {
    if mode == WorkerMode::Mute {
        return std::future::pending().await;
    }

    if out.send(Frame::Handshake { slave: id }).await.is_err() {
        return 0;
    }
    if mode == WorkerMode::NoHeartbeat {
        return std::future::pending().await;
    }

    let mut beat = interval(HEARTBEAT_EVERY);
    let mut spans: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();

    loop {
        tokio::select! {
            _ = beat.tick() => {
                if out.send(Frame::Heartbeat).await.is_err() {
                    return 0;
                }
            }
            maybe = inbox.recv() => {
                let Some(frame) = maybe else { return 0 };
                match frame {
                    Frame::Open { span, .. } => {
                        spans.insert(span, Vec::new());
                    }
                    Frame::Chunk { span, data } => {
                        if let Some(chunks) = spans.get_mut(&span) {
                            chunks.push(data);
                        }
                    }
                    Frame::Choke { span } => {
                        if mode == WorkerMode::Echo {
                            if let Some(chunks) = spans.remove(&span) {
                                for data in chunks {
                                    if out.send(Frame::Chunk { span, data }).await.is_err() {
                                        return 0;
                                    }
                                }
                                if out.send(Frame::Choke { span }).await.is_err() {
                                    return 0;
                                }
                            }
                        }
                    }
                    Frame::Error { span, .. } => {
                        spans.remove(&span);
                    }
                    Frame::Terminate => match mode {
                        WorkerMode::Busy => {} // pretend not to hear it
                        _ => {
                            for span in spans.keys().copied().collect::<Vec<_>>() {
                                let _ = out.send(Frame::Choke { span }).await;
                            }
                            return 0;
                        }
                    },
                    Frame::Handshake { .. } | Frame::Heartbeat => {}
                }
            }
        }
    }
}

/// Gzipped tarball with a single placeholder file.
pub fn bundle() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let data = b"#!/bin/sh\nexit 0\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, "run", &data[..]).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// Seeds authoritative storage with a manifest and bundle for `name`.
pub async fn seed_app(storage: &MemoryStorage, name: &str, engine: Value) {
    let manifest = json!({
        "type": "test",
        "slave": "run",
        "engine": engine,
    });
    storage
        .put("manifests", name, &serde_json::to_vec(&manifest).unwrap())
        .await
        .unwrap();
    storage.put("apps", name, &bundle()).await.unwrap();
}

/// Everything an engine-level test needs, kept alive together.
pub struct TestBed {
    pub app: App,
    pub bus: Bus,
    pub isolate: Arc<MockIsolate>,
    pub storage: Arc<MemoryStorage>,
    _spool: tempfile::TempDir,
}

/// Builds a started app named `"echo"` with the given engine policy and
/// worker script.
pub async fn test_app(engine: Value, mode: WorkerMode) -> TestBed {
    let spool = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    seed_app(&storage, "echo", engine).await;

    let cache: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let isolate = MockIsolate::new(mode);
    let bus = Bus::new(1024);

    let config = Config {
        spool_path: spool.path().to_path_buf(),
        pump_interval: Duration::from_millis(50),
        ..Config::default()
    };

    let app = App::new(
        "echo",
        "test",
        config,
        &storage_dyn,
        &cache,
        isolate.clone(),
        bus.clone(),
    )
    .await
    .unwrap();
    app.start().await;

    TestBed {
        app,
        bus,
        isolate,
        storage,
        _spool: spool,
    }
}

/// Opens a session with an unbounded upstream channel.
pub async fn open_session(
    app: &App,
    deadline: Option<Instant>,
) -> (SessionHandle, mpsc::UnboundedReceiver<UpstreamFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = app.enqueue("ping", tx, deadline).await.unwrap();
    (handle, rx)
}

/// Waits for the next event of `kind`, discarding everything else.
pub async fn wait_for(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(ev) if ev.kind == kind => return ev,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
}

/// Waits for the next upstream frame.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<UpstreamFrame>) -> UpstreamFrame {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for upstream frame")
        .expect("upstream closed without a frame")
}
