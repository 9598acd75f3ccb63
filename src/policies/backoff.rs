//! # Backoff policy for retrying worker spawns.
//!
//! When the isolation backend fails to produce a worker, the pool waits
//! before asking again. [`BackoffPolicy`] computes that wait: start at
//! [`first`](BackoffPolicy::first), multiply by
//! [`factor`](BackoffPolicy::factor) per consecutive failure, cap at
//! [`max`](BackoffPolicy::max), then apply the configured
//! [`JitterPolicy`].
//!
//! A successful handshake resets the sequence (the pool forgets the
//! previous delay).
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use appvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! let d1 = backoff.next(None);
//! let d2 = backoff.next(Some(d1));
//! assert_eq!(d1, Duration::from_millis(100));
//! assert_eq!(d2, Duration::from_millis(200));
//!
//! // Past the cap, the delay stays at `max`.
//! assert_eq!(backoff.next(Some(Duration::from_secs(20))), Duration::from_secs(10));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Spawn-retry delay policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Ceiling for grown delays.
    pub max: Duration,
    /// Growth factor per consecutive failure (`>= 1.0` recommended).
    pub factor: f64,
    /// Randomization applied to the computed delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// `first = 500ms`, `max = 30s`, `factor = 2.0`, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the next delay from the previous one (`None` after a
    /// reset). The growth is clamped to `max` before jitter is applied,
    /// and non-finite products fall back to `max` outright.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let grown = match prev {
            None => self.first,
            Some(d) if d.as_secs_f64() * self.factor >= self.max.as_secs_f64() => self.max,
            Some(d) => {
                let product = d.as_secs_f64() * self.factor;
                if product.is_finite() {
                    Duration::from_secs_f64(product)
                } else {
                    self.max
                }
            }
        };
        self.jitter.apply(grown.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_factor_keeps_the_delay_flat() {
        let b = BackoffPolicy {
            first: Duration::from_millis(250),
            max: Duration::from_secs(5),
            factor: 1.0,
            jitter: JitterPolicy::None,
        };
        let d = b.next(None);
        assert_eq!(b.next(Some(d)), d);
    }

    #[test]
    fn growth_is_capped_at_max() {
        let b = BackoffPolicy {
            first: Duration::from_secs(1),
            max: Duration::from_secs(4),
            factor: 3.0,
            jitter: JitterPolicy::None,
        };
        let d1 = b.next(None);
        let d2 = b.next(Some(d1));
        let d3 = b.next(Some(d2));
        assert_eq!(d1, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(3));
        assert_eq!(d3, Duration::from_secs(4));
    }
}
