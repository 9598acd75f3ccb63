//! # appvisor
//!
//! **Appvisor** is an application-hosting engine: it deploys named apps as
//! pools of supervised worker processes and dispatches streaming RPC
//! sessions to them.
//!
//! ## Features
//!
//! | Area            | Description                                                            | Key types / traits                       |
//! |-----------------|------------------------------------------------------------------------|------------------------------------------|
//! | **Node**        | Registry of apps; runlist boot, storage reconcile.                     | [`Node`]                                 |
//! | **Apps**        | Manifest resolution, bundle deploy, engine lifecycle.                  | [`App`], [`Manifest`], [`Profile`]       |
//! | **Dispatch**    | FIFO backlog, idle-slave pairing, per-session streaming.               | [`SessionHandle`], [`UpstreamFrame`]     |
//! | **Supervision** | Worker heartbeats, startup/idle/termination timers, pool growth.       | [`EngineInfo`], [`BackoffPolicy`]        |
//! | **Collaborators** | Pluggable storage and isolation backends.                            | [`Storage`], [`Isolate`]                 |
//! | **Observability** | Broadcast event bus with non-blocking subscriber fan-out.            | [`Event`], [`Subscribe`]                 |
//! | **Errors**      | Typed failures per surface, with stable labels for metrics.            | [`ConfigError`], [`SessionError`]        |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use appvisor::{Config, MemoryStorage, Node, ProcessIsolate, UpstreamFrame};
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = Arc::new(MemoryStorage::new());
//!     let cache = Arc::new(MemoryStorage::new());
//!     let isolate = Arc::new(ProcessIsolate::new());
//!
//!     let node = Node::new(
//!         Config::default(),
//!         storage,
//!         cache,
//!         isolate,
//!         Vec::new(),
//!     );
//!     node.boot().await;
//!
//!     if let Some(app) = node.app("echo").await {
//!         let (tx, mut rx) = mpsc::unbounded_channel();
//!         let session = app.enqueue("ping", tx, None).await.unwrap();
//!         session.write(b"hello".to_vec()).await.unwrap();
//!         session.choke().await.unwrap();
//!
//!         while let Some(frame) = rx.recv().await {
//!             match frame {
//!                 UpstreamFrame::Chunk(data) => println!("{} bytes", data.len()),
//!                 UpstreamFrame::Choke => break,
//!                 UpstreamFrame::Error(e) => { eprintln!("{e}"); break }
//!             }
//!         }
//!     }
//!
//!     node.shutdown().await;
//! }
//! ```
//!
//! ---

mod app;
mod archive;
mod config;
mod engine;
mod error;
mod events;
mod isolate;
mod manifest;
mod node;
mod policies;
mod protocol;
mod storage;
mod subscribers;

// ---- Public re-exports ----

pub use app::{App, AppInfo};
pub use config::Config;
pub use engine::{
    Engine, EngineInfo, EngineState, PoolInfo, QueueInfo, SessionCounters, SessionHandle,
    SlaveInfo, SlaveStats,
};
pub use error::{
    ArchiveError, ConfigError, EnqueueError, IsolateError, NodeError, SessionError, SlaveFault,
    StopOutcome, StorageError,
};
pub use events::{Bus, Event, EventKind};
pub use isolate::{Isolate, ProcessIsolate, SpawnRequest, TerminateMode, WorkerHandle};
pub use manifest::{Manifest, Profile, ProfileDoc};
pub use node::Node;
pub use policies::{BackoffPolicy, JitterPolicy};
pub use protocol::{Frame, UpstreamFrame};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: expose a simple built-in logging subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
