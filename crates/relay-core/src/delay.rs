//! Delivery jitter.
//!
//! Every item handed to a subscriber waits for a random delay first. Each
//! subscription owns its own [`RandomDelay`], so no RNG state is shared
//! between connections.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lower bound of the delay, in milliseconds.
pub const DEFAULT_MIN_DELAY_MS: u64 = 1000;

/// Default width of the delay range, in milliseconds.
pub const DEFAULT_DELAY_SPREAD_MS: u64 = 5000;

/// Produces the delay applied before each delivery.
pub trait DelayPolicy: Send {
    /// Draw the next delay.
    fn next_delay(&mut self) -> Duration;
}

/// Delay configuration.
///
/// Delays are drawn uniformly from `[min_ms, min_ms + spread_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Lower bound in milliseconds.
    #[serde(default = "default_min_ms")]
    pub min_ms: u64,
    /// Width of the range in milliseconds. Zero disables jitter.
    #[serde(default = "default_spread_ms")]
    pub spread_ms: u64,
}

fn default_min_ms() -> u64 {
    DEFAULT_MIN_DELAY_MS
}

fn default_spread_ms() -> u64 {
    DEFAULT_DELAY_SPREAD_MS
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_ms: DEFAULT_MIN_DELAY_MS,
            spread_ms: DEFAULT_DELAY_SPREAD_MS,
        }
    }
}

impl DelayConfig {
    /// A constant delay with no jitter.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            spread_ms: 0,
        }
    }

    /// Build a fresh policy with its own entropy.
    #[must_use]
    pub fn build(&self) -> RandomDelay {
        RandomDelay::new(*self)
    }
}

/// Uniformly distributed delay.
#[derive(Debug)]
pub struct RandomDelay {
    config: DelayConfig,
    rng: StdRng,
}

impl RandomDelay {
    /// Create a policy seeded from the operating system.
    #[must_use]
    pub fn new(config: DelayConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Create a reproducible policy.
    #[must_use]
    pub fn seeded(config: DelayConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The configured range.
    #[must_use]
    pub fn config(&self) -> DelayConfig {
        self.config
    }
}

impl DelayPolicy for RandomDelay {
    fn next_delay(&mut self) -> Duration {
        let offset = if self.config.spread_ms == 0 {
            0
        } else {
            self.rng.random_range(0..self.config.spread_ms)
        };
        Duration::from_millis(self.config.min_ms.saturating_add(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_range() {
        let config = DelayConfig::default();
        assert_eq!(config.min_ms, 1000);
        assert_eq!(config.spread_ms, 5000);
    }

    #[test]
    fn test_delay_always_in_range() {
        let mut policy = RandomDelay::new(DelayConfig::default());
        let lower = Duration::from_millis(1000);
        let upper = Duration::from_millis(6000);

        for _ in 0..10_000 {
            let delay = policy.next_delay();
            assert!(delay >= lower && delay < upper, "delay out of range: {:?}", delay);
        }
    }

    #[test]
    fn test_delay_spreads_over_range() {
        let mut policy = RandomDelay::seeded(DelayConfig::default(), 7);
        let samples: Vec<Duration> = (0..1_000).map(|_| policy.next_delay()).collect();

        let min = samples.iter().min().unwrap();
        let max = samples.iter().max().unwrap();
        assert!(*min < Duration::from_millis(2000));
        assert!(*max > Duration::from_millis(5000));
    }

    #[test]
    fn test_fixed_delay() {
        let mut policy = DelayConfig::fixed(Duration::from_millis(250)).build();
        for _ in 0..10 {
            assert_eq!(policy.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let mut a = RandomDelay::seeded(DelayConfig::default(), 42);
        let mut b = RandomDelay::seeded(DelayConfig::default(), 42);
        for _ in 0..16 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn test_extreme_bounds_saturate() {
        let config = DelayConfig {
            min_ms: u64::MAX - 1,
            spread_ms: 10,
        };
        let mut policy = RandomDelay::seeded(config, 3);
        for _ in 0..32 {
            assert!(policy.next_delay() >= Duration::from_millis(u64::MAX - 1));
        }

        assert_eq!(DelayConfig::fixed(Duration::MAX).min_ms, u64::MAX);
    }
}
