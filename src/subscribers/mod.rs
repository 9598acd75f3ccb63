//! # Event subscribers for the appvisor runtime.
//!
//! This module provides the [`Subscribe`] trait and the non-blocking
//! fan-out machinery for handling runtime events broadcast through the
//! [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   engine loop ── publish(Event) ──► Bus ──► node listener
//!                                               │
//!                                          SubscriberSet
//!                                               │
//!                                   ┌───────────┼───────────┐
//!                                   ▼           ▼           ▼
//!                               LogWriter    Metrics     Custom ...
//! ```
//!
//! ## Implementing custom subscribers
//! ```no_run
//! use appvisor::{Subscribe, Event, EventKind};
//! use async_trait::async_trait;
//!
//! struct FailureCounter;
//!
//! #[async_trait]
//! impl Subscribe for FailureCounter {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::SessionFailed {
//!             // increment failure counter
//!         }
//!     }
//!     fn name(&self) -> &'static str { "failure-counter" }
//! }
//! ```

mod set;
mod subscribe;

#[cfg(feature = "logging")]
mod log;

pub use set::SubscriberSet;
pub use subscribe::Subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
