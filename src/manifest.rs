//! # Manifest resolution and app deployment.
//!
//! A [`Manifest`] ties an app name to its unpacked code location, its
//! runtime type, and the [`Profile`] policy bundle its engine runs under.
//!
//! ## Resolution order
//! ```text
//! Manifest::load(name)
//!   ├─► cache get ("manifests", name) ──► spool dir present? ──► done
//!   │                                          │ missing
//!   └─► authoritative storage                  ▼
//!         ├─► get ("manifests", name)     redeploy
//!         ├─► get ("apps", name)  ──► archive::deploy(spool/name)
//!         └─► cache put ("manifests", name)   (failure is non-fatal)
//! ```
//!
//! ## Rules
//! - Deploy is destructive; the spool slot is erased before extraction.
//! - A cache-write failure is reported on the bus and otherwise ignored;
//!   the manifest is still returned.
//! - A missing spool directory invalidates a cached manifest and triggers
//!   redeploy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive;
use crate::error::ConfigError;
use crate::events::{Bus, Event, EventKind};
use crate::storage::Storage;

/// Engine policy bundle, validated.
///
/// All timeouts are positive; `pool_limit` and `grow_threshold` are at
/// least 1. `queue_limit == 0` disables the backlog entirely (sessions are
/// rejected whenever no idle slave is available).
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Max wait for a worker's handshake after spawn.
    pub startup_timeout: Duration,
    /// Max inter-heartbeat gap after the handshake.
    pub heartbeat_timeout: Duration,
    /// Idle time after which a worker is politely stopped.
    pub idle_timeout: Duration,
    /// Grace between polite stop and forced kill.
    pub termination_timeout: Duration,
    /// Cap on concurrent workers.
    pub pool_limit: usize,
    /// Cap on the session backlog; 0 disables the backlog.
    pub queue_limit: usize,
    /// Backlog depth that triggers spawning one more worker.
    pub grow_threshold: usize,
}

impl Default for Profile {
    /// Matches the document defaults in [`ProfileDoc`]:
    /// 10s/30s/600s/5s timeouts, pool 10, queue 100, grow 10.
    fn default() -> Self {
        ProfileDoc::default()
            .validate("default")
            .expect("built-in profile defaults are valid")
    }
}

/// Raw engine policy section as stored in a manifest document.
///
/// Values are seconds (floats) and counts; missing fields fall back to the
/// defaults. Turned into a [`Profile`] by [`ProfileDoc::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProfileDoc {
    /// Seconds a spawned worker has to produce its handshake.
    pub startup_timeout: f64,
    /// Max seconds between heartbeats after the handshake.
    pub heartbeat_timeout: f64,
    /// Seconds of idleness before a worker is politely stopped.
    pub idle_timeout: f64,
    /// Seconds between polite stop and forced kill.
    pub termination_timeout: f64,
    /// Cap on concurrent workers.
    pub pool_limit: usize,
    /// Cap on the session backlog.
    pub queue_limit: usize,
    /// Backlog depth that triggers a spawn; 0 means "derive from
    /// queue-limit / pool-limit".
    pub grow_threshold: usize,
}

impl Default for ProfileDoc {
    fn default() -> Self {
        Self {
            startup_timeout: 10.0,
            heartbeat_timeout: 30.0,
            idle_timeout: 600.0,
            termination_timeout: 5.0,
            pool_limit: 10,
            queue_limit: 100,
            grow_threshold: 0,
        }
    }
}

impl ProfileDoc {
    /// Validates the raw values and produces a [`Profile`].
    pub fn validate(&self, app: &str) -> Result<Profile, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProfile {
            name: app.to_string(),
            reason: reason.to_string(),
        };

        if self.startup_timeout <= 0.0 {
            return Err(invalid("slave startup timeout must be positive"));
        }
        if self.heartbeat_timeout <= 0.0 {
            return Err(invalid("slave heartbeat timeout must be positive"));
        }
        if self.idle_timeout <= 0.0 {
            return Err(invalid("slave idle timeout must be positive"));
        }
        if self.termination_timeout < 0.0 {
            return Err(invalid("termination timeout must not be negative"));
        }
        if self.pool_limit == 0 {
            return Err(invalid("engine pool limit must be positive"));
        }

        let grow_threshold = match self.grow_threshold {
            0 => (self.queue_limit / self.pool_limit).max(1),
            n => n,
        };

        Ok(Profile {
            startup_timeout: Duration::from_secs_f64(self.startup_timeout),
            heartbeat_timeout: Duration::from_secs_f64(self.heartbeat_timeout),
            idle_timeout: Duration::from_secs_f64(self.idle_timeout),
            termination_timeout: Duration::from_secs_f64(self.termination_timeout),
            pool_limit: self.pool_limit,
            queue_limit: self.queue_limit,
            grow_threshold,
        })
    }
}

/// Manifest document as stored under `("manifests", name)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestDoc {
    /// Runtime type of the app ("python", "binary", …).
    #[serde(rename = "type", default)]
    kind: String,
    /// Worker entry point, relative to the unpacked bundle.
    #[serde(default)]
    slave: Option<String>,
    /// Engine policy section.
    #[serde(default)]
    engine: ProfileDoc,
    /// Absolute spool path; populated on deploy, present in cached copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

/// Resolved app metadata; immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// App name.
    pub name: String,
    /// Absolute path of the unpacked bundle.
    pub path: std::path::PathBuf,
    /// Runtime type of the app.
    pub kind: String,
    /// Worker entry point, relative to `path`.
    pub slave: Option<String>,
    /// Validated engine policy.
    pub profile: Profile,
}

impl Manifest {
    /// Resolves the manifest for `name`, deploying the app bundle into the
    /// spool if the cache has no usable copy.
    ///
    /// Missing manifest or bundle, extraction failure, and malformed
    /// documents all surface as [`ConfigError`]; a cache write failure
    /// does not.
    pub async fn load(
        storage: &Arc<dyn Storage>,
        cache: &Arc<dyn Storage>,
        spool: &Path,
        bus: &Bus,
        name: &str,
    ) -> Result<Manifest, ConfigError> {
        if let Some(doc) = Self::from_cache(cache, name).await? {
            if let Some(path) = &doc.path {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Self::from_doc(name, doc);
                }
            }
        }

        let doc = Self::deploy(storage, cache, spool, bus, name).await?;
        Self::from_doc(name, doc)
    }

    /// Cache probe: absent key is a miss, a malformed cached document is an
    /// error (the cache is ours; garbage in it is a bug, not a miss).
    async fn from_cache(
        cache: &Arc<dyn Storage>,
        name: &str,
    ) -> Result<Option<ManifestDoc>, ConfigError> {
        match cache.get("manifests", name).await {
            Ok(blob) => {
                let doc = serde_json::from_slice(&blob).map_err(|e| ConfigError::Malformed {
                    collection: "manifests".to_string(),
                    key: name.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(doc))
            }
            Err(_) => Ok(None),
        }
    }

    /// Fetches the manifest and bundle from authoritative storage, unpacks
    /// the bundle into the spool, and refreshes the cache.
    async fn deploy(
        storage: &Arc<dyn Storage>,
        cache: &Arc<dyn Storage>,
        spool: &Path,
        bus: &Bus,
        name: &str,
    ) -> Result<ManifestDoc, ConfigError> {
        let not_available = || ConfigError::AppNotAvailable {
            name: name.to_string(),
        };

        let manifest_blob = storage
            .get("manifests", name)
            .await
            .map_err(|_| not_available())?;
        let bundle = storage.get("apps", name).await.map_err(|_| not_available())?;

        let mut doc: ManifestDoc =
            serde_json::from_slice(&manifest_blob).map_err(|e| ConfigError::Malformed {
                collection: "manifests".to_string(),
                key: name.to_string(),
                reason: e.to_string(),
            })?;

        let target = spool.join(name);
        archive::deploy(bundle, &target)
            .await
            .map_err(|_| not_available())?;

        doc.path = Some(target.to_string_lossy().into_owned());
        bus.publish(Event::now(EventKind::AppDeployed).with_app(name));

        // Put the resolved document into the cache for future reference.
        match serde_json::to_vec(&doc) {
            Ok(blob) => {
                if let Err(e) = cache.put("manifests", name, &blob).await {
                    bus.publish(
                        Event::now(EventKind::CacheWriteFailed)
                            .with_app(name)
                            .with_reason(e.as_label())
                            .with_error(e.to_string()),
                    );
                }
            }
            Err(e) => {
                bus.publish(
                    Event::now(EventKind::CacheWriteFailed)
                        .with_app(name)
                        .with_error(e.to_string()),
                );
            }
        }

        Ok(doc)
    }

    fn from_doc(name: &str, doc: ManifestDoc) -> Result<Manifest, ConfigError> {
        let path = doc.path.ok_or_else(|| ConfigError::Malformed {
            collection: "manifests".to_string(),
            key: name.to_string(),
            reason: "cached manifest has no path".to_string(),
        })?;

        Ok(Manifest {
            name: name.to_string(),
            path: path.into(),
            kind: doc.kind,
            slave: doc.slave,
            profile: doc.engine.validate(name)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_defaults_are_valid() {
        let p = Profile::default();
        assert_eq!(p.pool_limit, 10);
        assert_eq!(p.queue_limit, 100);
        assert_eq!(p.grow_threshold, 10);
    }

    #[test]
    fn grow_threshold_derives_from_queue_over_pool() {
        let doc = ProfileDoc {
            pool_limit: 4,
            queue_limit: 100,
            grow_threshold: 0,
            ..ProfileDoc::default()
        };
        assert_eq!(doc.validate("echo").unwrap().grow_threshold, 25);

        // Never derived below 1, even with a tiny queue.
        let doc = ProfileDoc {
            pool_limit: 10,
            queue_limit: 0,
            grow_threshold: 0,
            ..ProfileDoc::default()
        };
        assert_eq!(doc.validate("echo").unwrap().grow_threshold, 1);
    }

    #[test]
    fn rejects_non_positive_timeouts() {
        for field in ["startup", "heartbeat", "idle"] {
            let mut doc = ProfileDoc::default();
            match field {
                "startup" => doc.startup_timeout = 0.0,
                "heartbeat" => doc.heartbeat_timeout = -1.0,
                _ => doc.idle_timeout = 0.0,
            }
            let err = doc.validate("echo").unwrap_err();
            assert_eq!(err.as_label(), "config_invalid_profile");
        }
    }

    #[test]
    fn rejects_zero_pool_limit() {
        let doc = ProfileDoc {
            pool_limit: 0,
            ..ProfileDoc::default()
        };
        assert!(doc.validate("echo").is_err());
    }

    #[test]
    fn manifest_doc_parses_kebab_case_engine_section() {
        let raw = br#"{
            "type": "python",
            "slave": "run.py",
            "engine": { "pool-limit": 2, "queue-limit": 8, "startup-timeout": 1.5 }
        }"#;
        let doc: ManifestDoc = serde_json::from_slice(raw).unwrap();
        assert_eq!(doc.kind, "python");
        assert_eq!(doc.slave.as_deref(), Some("run.py"));

        let profile = doc.engine.validate("echo").unwrap();
        assert_eq!(profile.pool_limit, 2);
        assert_eq!(profile.queue_limit, 8);
        assert_eq!(profile.startup_timeout, Duration::from_millis(1500));
        assert_eq!(profile.grow_threshold, 4);
    }
}
