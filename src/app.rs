//! # App: a named engine instance.
//!
//! Thin façade bundling a resolved [`Manifest`] with the [`Engine`] that
//! serves it. The app owns the engine's lifecycle:
//!
//! - `start` - spawn the engine, or resume it if paused
//! - `pause` - refuse new sessions, let in-flight work drain, stay
//!   resumable
//! - `stop` - full shutdown bounded by the profile's
//!   `termination_timeout`
//! - `enqueue` / `info` - passthroughs to the engine

use std::sync::Arc;
use tokio::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::engine::{Engine, EngineInfo, EngineState, SessionHandle};
use crate::error::{ConfigError, EnqueueError, StopOutcome};
use crate::events::Bus;
use crate::isolate::Isolate;
use crate::manifest::Manifest;
use crate::protocol::UpstreamFrame;
use crate::storage::Storage;

/// Point-in-time app snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    /// App name.
    pub name: String,
    /// Profile label the app was started with.
    pub profile: String,
    /// App status; `Stopped` when no engine is live.
    pub state: EngineState,
    /// Engine details while one is live.
    pub engine: Option<EngineInfo>,
}

/// A named deployable unit and its engine.
pub struct App {
    manifest: Arc<Manifest>,
    profile_label: String,
    config: Config,
    isolate: Arc<dyn Isolate>,
    bus: Bus,
    engine: Mutex<Option<Engine>>,
}

impl App {
    /// Resolves the manifest for `name` (deploying the bundle if needed)
    /// and builds the app in the stopped state.
    pub async fn new(
        name: &str,
        profile_label: &str,
        config: Config,
        storage: &Arc<dyn Storage>,
        cache: &Arc<dyn Storage>,
        isolate: Arc<dyn Isolate>,
        bus: Bus,
    ) -> Result<App, ConfigError> {
        let manifest =
            Manifest::load(storage, cache, &config.spool_path, &bus, name).await?;

        Ok(App {
            manifest: Arc::new(manifest),
            profile_label: profile_label.to_string(),
            config,
            isolate,
            bus,
            engine: Mutex::new(None),
        })
    }

    /// App name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// The resolved manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Starts the engine, or resumes it if paused. Idempotent on a
    /// running app.
    pub async fn start(&self) {
        let mut slot = self.engine.lock().await;
        match slot.as_ref() {
            Some(engine) => {
                engine.resume().await;
            }
            None => {
                *slot = Some(Engine::spawn(
                    Arc::clone(&self.manifest),
                    &self.config,
                    Arc::clone(&self.isolate),
                    self.bus.clone(),
                ));
            }
        }
    }

    /// Refuses new sessions and lets in-flight work drain. A later
    /// `start` resumes.
    pub async fn pause(&self) {
        if let Some(engine) = self.engine.lock().await.as_ref() {
            engine.pause().await;
        }
    }

    /// Full shutdown; returns once the pool is empty.
    pub async fn stop(&self) -> StopOutcome {
        let engine = self.engine.lock().await.take();
        match engine {
            Some(engine) => engine.stop().await,
            None => StopOutcome::Drained,
        }
    }

    /// Submits a session to the engine.
    pub async fn enqueue(
        &self,
        event: impl Into<String>,
        upstream: mpsc::UnboundedSender<UpstreamFrame>,
        deadline: Option<Instant>,
    ) -> Result<SessionHandle, EnqueueError> {
        let engine = self.engine.lock().await.clone();
        match engine {
            Some(engine) => engine.enqueue(event, upstream, deadline).await,
            None => Err(EnqueueError::Stopped),
        }
    }

    /// Snapshot of the app and (if live) its engine.
    pub async fn info(&self) -> AppInfo {
        let engine = self.engine.lock().await.clone();
        let engine_info = match engine {
            Some(engine) => engine.info().await,
            None => None,
        };

        AppInfo {
            name: self.manifest.name.clone(),
            profile: self.profile_label.clone(),
            state: engine_info
                .as_ref()
                .map_or(EngineState::Stopped, |i| i.state),
            engine: engine_info,
        }
    }
}
