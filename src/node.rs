//! # Node: top-level registry of apps.
//!
//! Owns the apps map behind one coarse lock - the only lock in the crate.
//! Registry operations (start/pause/list) may block each other briefly but
//! never touch a running engine's loop.
//!
//! ## Boot
//! `boot()` reads the configured runlist from `("runlists", <id>)` and
//! starts every app in it. Per-app failures are reported on the bus and do
//! not abort the node; an unreadable runlist leaves the node empty.
//!
//! ## Reconcile
//! `reconcile()` reproduces the storage ⟷ registry symmetric difference:
//! apps present in storage but not running are started, apps running but
//! gone from storage are stopped **without warning**. Call it from a
//! signal handler or an admin endpoint when storage contents change.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::app::{App, AppInfo};
use crate::config::Config;
use crate::error::NodeError;
use crate::events::{Bus, Event, EventKind};
use crate::isolate::Isolate;
use crate::storage::Storage;
use crate::subscribers::{Subscribe, SubscriberSet};

/// Profile label used for apps discovered by `reconcile` (the storage
/// listing carries no profile information).
const RECONCILE_PROFILE: &str = "default";

/// Runlist document: `app name → profile name`.
#[derive(Debug, Default, Deserialize)]
struct RunlistDoc(HashMap<String, String>);

/// Top-level registry of running apps.
pub struct Node {
    config: Config,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn Storage>,
    isolate: Arc<dyn Isolate>,
    bus: Bus,
    apps: Mutex<HashMap<String, Arc<App>>>,
}

impl Node {
    /// Builds a node and wires the subscriber fan-out. Must be called
    /// inside a tokio runtime (listener and subscriber workers are
    /// spawned here).
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn Storage>,
        isolate: Arc<dyn Isolate>,
        subscribers: Vec<Arc<dyn Subscribe>>,
    ) -> Node {
        let bus = Bus::new(config.bus_capacity);
        spawn_fanout(bus.clone(), subscribers);

        Node {
            config,
            storage,
            cache,
            isolate,
            bus,
            apps: Mutex::new(HashMap::new()),
        }
    }

    /// The node's event bus; subscribe for raw event access (tests,
    /// ad-hoc tooling).
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// Reads the configured runlist and starts every app in it.
    ///
    /// Failures are isolated per app; an unreadable runlist is reported
    /// and skipped.
    pub async fn boot(&self) {
        let runlist = match self.storage.get("runlists", &self.config.runlist).await {
            Ok(blob) => match serde_json::from_slice::<RunlistDoc>(&blob) {
                Ok(doc) => doc.0,
                Err(e) => {
                    self.bus.publish(
                        Event::now(EventKind::RunlistSkipped)
                            .with_reason("runlist_malformed")
                            .with_error(e.to_string()),
                    );
                    return;
                }
            },
            Err(e) => {
                self.bus.publish(
                    Event::now(EventKind::RunlistSkipped)
                        .with_reason(e.as_label())
                        .with_error(e.to_string()),
                );
                return;
            }
        };

        // Deterministic boot order.
        let mut entries: Vec<_> = runlist.into_iter().collect();
        entries.sort();

        for (name, profile) in entries {
            if let Err(e) = self.start_app(&name, &profile).await {
                self.bus.publish(
                    Event::now(EventKind::AppStartFailed)
                        .with_app(&name)
                        .with_reason(e.as_label())
                        .with_error(e.to_string()),
                );
            }
        }
    }

    /// Starts an app: resolves its manifest (deploying if necessary),
    /// spawns its engine, and registers it.
    pub async fn start_app(&self, name: &str, profile: &str) -> Result<(), NodeError> {
        let mut apps = self.apps.lock().await;
        if apps.contains_key(name) {
            return Err(NodeError::AppAlreadyRunning {
                name: name.to_string(),
            });
        }

        let app = App::new(
            name,
            profile,
            self.config.clone(),
            &self.storage,
            &self.cache,
            Arc::clone(&self.isolate),
            self.bus.clone(),
        )
        .await?;
        app.start().await;
        apps.insert(name.to_string(), Arc::new(app));

        self.bus
            .publish(Event::now(EventKind::AppStarted).with_app(name));
        Ok(())
    }

    /// Pauses an app and removes it from the registry; its engine drains
    /// and shuts down under the profile's termination grace.
    pub async fn pause_app(&self, name: &str) -> Result<(), NodeError> {
        let app = {
            let mut apps = self.apps.lock().await;
            apps.remove(name).ok_or_else(|| NodeError::AppNotRunning {
                name: name.to_string(),
            })?
        };

        self.bus
            .publish(Event::now(EventKind::AppPaused).with_app(name));
        app.stop().await;
        Ok(())
    }

    /// Names of the running apps, sorted.
    pub async fn list(&self) -> Vec<String> {
        let apps = self.apps.lock().await;
        let mut names: Vec<String> = apps.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Shared handle to a running app.
    pub async fn app(&self, name: &str) -> Option<Arc<App>> {
        self.apps.lock().await.get(name).cloned()
    }

    /// Snapshot of one app.
    pub async fn info(&self, name: &str) -> Result<AppInfo, NodeError> {
        let app = self
            .app(name)
            .await
            .ok_or_else(|| NodeError::AppNotRunning {
                name: name.to_string(),
            })?;
        Ok(app.info().await)
    }

    /// Aligns the registry with storage: the symmetric difference between
    /// `storage.list("apps")` and the running set decides what changes.
    ///
    /// - in storage, not running → started (with the `default` profile
    ///   label)
    /// - running, not in storage → stopped without warning
    pub async fn reconcile(&self) -> Result<(), NodeError> {
        let available = self.storage.list("apps").await?;
        let running = self.list().await;

        for name in &running {
            if !available.contains(name) {
                let _ = self.pause_app(name).await;
            }
        }

        for name in &available {
            if !running.contains(name) {
                if let Err(e) = self.start_app(name, RECONCILE_PROFILE).await {
                    self.bus.publish(
                        Event::now(EventKind::AppStartFailed)
                            .with_app(name)
                            .with_reason(e.as_label())
                            .with_error(e.to_string()),
                    );
                }
            }
        }

        Ok(())
    }

    /// Stops every app; the node is empty afterwards.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<App>)> = {
            let mut apps = self.apps.lock().await;
            apps.drain().collect()
        };

        for (name, app) in drained {
            self.bus
                .publish(Event::now(EventKind::AppPaused).with_app(&name));
            app.stop().await;
        }
    }
}

/// Bridges the broadcast bus into the subscriber fan-out.
fn spawn_fanout(bus: Bus, subscribers: Vec<Arc<dyn Subscribe>>) {
    if subscribers.is_empty() {
        return;
    }
    let set = SubscriberSet::new(subscribers, bus.clone());
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => set.emit_arc(Arc::new(ev)),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
}
