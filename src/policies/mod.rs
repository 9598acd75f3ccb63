//! Policies for pacing worker respawns:
//!  - [`BackoffPolicy`] for spawn-retry delays;
//!  - [`JitterPolicy`] for randomizing those delays.
//!
//! ## Overview
//! - [`backoff`] - compute the next delay after spawn failures with a
//!   capped multiplicative growth.
//! - [`jitter`] - optionally spread delays out to avoid synchronized
//!   retries against a shared isolation backend.
//!
//! ## Example
//! ```rust
//! use appvisor::{BackoffPolicy, JitterPolicy};
//! use std::time::Duration;
//!
//! // Backoff: 100ms -> 200ms -> 400ms (capped by 1s)
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(1),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! let d1 = backoff.next(None);
//! let d2 = backoff.next(Some(d1));
//! assert_eq!(d1, Duration::from_millis(100));
//! assert_eq!(d2, Duration::from_millis(200));
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
