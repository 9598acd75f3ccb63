//! # Simple logging subscriber for debugging and demos.
//!
//! [`LogWriter`] prints events to stdout in a human-readable format.
//! This is primarily useful for development, debugging, and examples.
//!
//! ## Output format
//! ```text
//! [app-started] app=echo
//! [slave-spawning] app=echo slave=6f9c…
//! [slave-active] app=echo slave=6f9c…
//! [session-queued] app=echo session=1
//! [session-assigned] app=echo session=1 slave=6f9c…
//! [session-failed] app=echo session=1 err="session deadline exceeded while queued"
//! [slave-dead] app=echo slave=6f9c… reason=slave_heartbeat_lost
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Simple stdout logging subscriber.
///
/// Enabled via the `logging` feature. Prints human-readable event
/// descriptions to stdout for debugging and demonstration purposes.
///
/// Not intended for production use - implement a custom [`Subscribe`] for
/// structured logging or metrics collection.
pub struct LogWriter;

impl LogWriter {
    fn tag(kind: EventKind) -> &'static str {
        match kind {
            EventKind::SubscriberPanicked => "subscriber-panicked",
            EventKind::SubscriberOverflow => "subscriber-overflow",
            EventKind::AppStarted => "app-started",
            EventKind::AppPaused => "app-paused",
            EventKind::AppStartFailed => "app-start-failed",
            EventKind::RunlistSkipped => "runlist-skipped",
            EventKind::AppDeployed => "app-deployed",
            EventKind::CacheWriteFailed => "cache-write-failed",
            EventKind::EngineStarted => "engine-started",
            EventKind::EnginePaused => "engine-paused",
            EventKind::EngineResumed => "engine-resumed",
            EventKind::EngineStopping => "engine-stopping",
            EventKind::EngineStopped => "engine-stopped",
            EventKind::DrainTimeout => "drain-timeout",
            EventKind::SlaveSpawning => "slave-spawning",
            EventKind::SlaveActive => "slave-active",
            EventKind::SlaveDraining => "slave-draining",
            EventKind::SlaveDead => "slave-dead",
            EventKind::SessionQueued => "session-queued",
            EventKind::SessionAssigned => "session-assigned",
            EventKind::SessionCompleted => "session-completed",
            EventKind::SessionFailed => "session-failed",
            EventKind::SessionCancelled => "session-cancelled",
            EventKind::SessionRejected => "session-rejected",
        }
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let mut line = format!("[{}]", Self::tag(e.kind));
        if let Some(app) = &e.app {
            line.push_str(&format!(" app={app}"));
        }
        if let Some(slave) = e.slave {
            line.push_str(&format!(" slave={slave}"));
        }
        if let Some(session) = e.session {
            line.push_str(&format!(" session={session}"));
        }
        if let Some(reason) = e.reason {
            line.push_str(&format!(" reason={reason}"));
        }
        if let Some(delay) = e.delay {
            line.push_str(&format!(" delay={delay:?}"));
        }
        if let Some(err) = &e.error {
            line.push_str(&format!(" err={err:?}"));
        }
        println!("{line}");
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
