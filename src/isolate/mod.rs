//! # Isolation abstraction consumed by the engines.
//!
//! An [`Isolate`] turns a spawn request into a live worker: an external
//! process (or anything that behaves like one) reachable through a
//! bidirectional [`Frame`](crate::protocol::Frame) channel plus an exit
//! notifier. The engine never touches process machinery directly.
//!
//! ## Contract
//! - `spawn` may be slow (fork/exec, container setup); engines call it from
//!   a helper task, never from their dispatch loop.
//! - `terminate(_, Polite)` delivers a `Terminate` frame; the worker is
//!   expected to finish its current span and exit on its own.
//! - `terminate(_, Force)` kills the worker; the exit notifier still fires.
//! - One backend instance may serve many engines; calls for one engine must
//!   not block another.
//!
//! [`ProcessIsolate`] is the built-in backend: one OS process per worker,
//! newline-delimited JSON frames over stdio.

mod process;

pub use process::ProcessIsolate;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::IsolateError;
use crate::protocol::Frame;

/// How a worker should be brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Ask the worker to finish and exit (a `Terminate` frame).
    Polite,
    /// Kill the worker immediately.
    Force,
}

/// Everything a backend needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// App the worker belongs to.
    pub app: String,
    /// Slave id; the worker must echo it in its handshake.
    pub slave_id: Uuid,
    /// Unpacked bundle directory.
    pub manifest_path: PathBuf,
    /// Worker entry point relative to the bundle, if the manifest names
    /// one.
    pub entry: Option<String>,
    /// Extra environment passed through to the worker.
    pub env: Vec<(String, String)>,
}

/// Live worker as seen by the engine.
///
/// Dropping the handle does not kill the worker; that is what
/// [`Isolate::terminate`] is for.
pub struct WorkerHandle {
    /// Engine → worker frames.
    pub sink: mpsc::Sender<Frame>,
    /// Worker → engine frames. `None` after the engine moves it into its
    /// relay task.
    pub source: mpsc::Receiver<Frame>,
    /// Fires once with the exit code when the worker is gone.
    pub exited: oneshot::Receiver<i32>,
}

/// Worker lifecycle backend.
#[async_trait]
pub trait Isolate: Send + Sync + 'static {
    /// Starts one worker and returns its channel handle.
    async fn spawn(&self, request: SpawnRequest) -> Result<WorkerHandle, IsolateError>;

    /// Brings a worker down.
    ///
    /// Returns [`IsolateError::UnknownWorker`] if the backend no longer
    /// tracks `id`; callers racing against worker death treat that as
    /// success.
    async fn terminate(&self, id: Uuid, mode: TerminateMode) -> Result<(), IsolateError>;
}
