//! # Jitter for spawn-retry delays.
//!
//! Several engines sharing one isolation backend will otherwise retry in
//! lockstep after a backend outage. [`JitterPolicy`] spreads the retries
//! out.

use std::time::Duration;

use rand::Rng;

/// Randomization applied to a computed backoff delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the delay as computed. Predictable; fine when a single engine
    /// talks to the backend, and the right choice in tests.
    #[default]
    None,
    /// Uniform in `[0, delay]`. Maximum spread, at the cost of sometimes
    /// retrying almost immediately.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`. Keeps most of the
    /// backoff while still decorrelating peers.
    Equal,
}

impl JitterPolicy {
    /// Applies this policy to `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 || *self == JitterPolicy::None {
            return delay;
        }

        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let spread = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                Duration::from_millis(half + spread)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let d = Duration::from_millis(700);
        assert_eq!(JitterPolicy::None.apply(d), d);
    }

    #[test]
    fn full_stays_within_the_delay() {
        let d = Duration::from_millis(500);
        for _ in 0..64 {
            assert!(JitterPolicy::Full.apply(d) <= d);
        }
    }

    #[test]
    fn equal_keeps_at_least_half() {
        let d = Duration::from_millis(500);
        for _ in 0..64 {
            let j = JitterPolicy::Equal.apply(d);
            assert!(j >= d / 2 && j <= d);
        }
    }
}
