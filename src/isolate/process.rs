//! # Process isolation backend.
//!
//! One OS process per worker. Frames cross the process boundary as
//! newline-delimited JSON over the child's stdin/stdout; stderr is passed
//! through for operator visibility.
//!
//! ## Worker contract
//! The spawned program receives `--app <name> --uuid <slave-id>` and runs
//! with the bundle directory as its working directory. It must:
//! - print a `handshake` frame first,
//! - keep printing `heartbeat` frames within the app's heartbeat window,
//! - answer `open`/`chunk`/`choke` spans with `chunk`/`choke`/`error`,
//! - exit soon after reading a `terminate` frame.
//!
//! ## Shutdown
//! - Polite: a `Terminate` frame is queued on the worker's stdin.
//! - Force: the process is killed outright.
//!
//! Unparseable lines from a worker are dropped; a worker that floods stdout
//! with garbage will simply starve its own heartbeats and be reaped by the
//! engine.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::IsolateError;
use crate::protocol::Frame;

use super::{Isolate, SpawnRequest, TerminateMode, WorkerHandle};

/// Capacity of the per-worker frame channels.
const CHANNEL_CAPACITY: usize = 64;

/// Control block for one live child.
struct WorkerCtl {
    stdin_tx: mpsc::Sender<Frame>,
    kill: CancellationToken,
}

/// Spawns app workers as child processes speaking JSON-lines over stdio.
#[derive(Default)]
pub struct ProcessIsolate {
    workers: Arc<DashMap<Uuid, WorkerCtl>>,
}

impl ProcessIsolate {
    /// Creates a backend with no live workers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of children currently tracked.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[async_trait]
impl Isolate for ProcessIsolate {
    async fn spawn(&self, request: SpawnRequest) -> Result<WorkerHandle, IsolateError> {
        let program = match &request.entry {
            Some(entry) => request.manifest_path.join(entry),
            None => request.manifest_path.join("slave"),
        };

        let mut child = Command::new(&program)
            .arg("--app")
            .arg(&request.app)
            .arg("--uuid")
            .arg(request.slave_id.to_string())
            .current_dir(&request.manifest_path)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IsolateError::SpawnFailed {
                reason: format!("exec '{}': {e}", program.display()),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| IsolateError::SpawnFailed {
            reason: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| IsolateError::SpawnFailed {
            reason: "child stdout unavailable".to_string(),
        })?;

        let (sink_tx, sink_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (source_tx, source_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        let kill = CancellationToken::new();

        self.workers.insert(
            request.slave_id,
            WorkerCtl {
                stdin_tx: sink_tx.clone(),
                kill: kill.clone(),
            },
        );

        tokio::spawn(encode_frames(sink_rx, stdin));
        tokio::spawn(decode_frames(stdout, source_tx));
        tokio::spawn(reap_child(
            child,
            kill,
            exit_tx,
            request.slave_id,
            Arc::clone(&self.workers),
        ));

        Ok(WorkerHandle {
            sink: sink_tx,
            source: source_rx,
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
                // Best effort; a worker with a saturated stdin queue will be
                // force-killed by the engine's termination timeout anyway.
                let _ = ctl.stdin_tx.try_send(Frame::Terminate);
            }
            TerminateMode::Force => ctl.kill.cancel(),
        }
        Ok(())
    }
}

/// Serializes outgoing frames onto the child's stdin, one JSON line each.
async fn encode_frames(mut rx: mpsc::Receiver<Frame>, mut stdin: tokio::process::ChildStdin) {
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(_) => continue,
        };
        line.push(b'\n');
        if stdin.write_all(&line).await.is_err() {
            break;
        }
    }
}

/// Parses incoming JSON lines from the child's stdout into frames.
async fn decode_frames(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<Frame>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(frame) = serde_json::from_str::<Frame>(&line) {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    }
}

/// Waits for the child to exit (or kills it on request), reports the exit
/// code, and drops the control block.
async fn reap_child(
    mut child: tokio::process::Child,
    kill: CancellationToken,
    exit_tx: oneshot::Sender<i32>,
    id: Uuid,
    workers: Arc<DashMap<Uuid, WorkerCtl>>,
) {
    let code = tokio::select! {
        status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
        _ = kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-9)
        }
    };

    workers.remove(&id);
    let _ = exit_tx.send(code);
}
