//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the node, the app
//! engines, their slaves, and the subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Node`, `App`, the engine loop (slave and session
//!   transitions), `Manifest::load`, `SubscriberSet` workers
//!   (overflow/panic).
//! - **Consumers**: the per-node subscriber listener (fans out to
//!   `SubscriberSet`) and anything that calls [`Bus::subscribe`].

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
