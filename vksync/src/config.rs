//! Engine configuration.

use crate::sync::{SemaphoreKind, SynchronizationType};
use serde::{Deserialize, Serialize};
use std::{hash::BuildHasher, time::Duration};

/// Parameters of a test run. Every field has a default, so a configuration file only needs to
/// name what it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The seed every per-case random generator is derived from.
    pub seed: u64,

    /// The timeout of waits that are expected to succeed, in milliseconds.
    pub long_timeout_ms: u64,

    /// The timeout of waits that are expected to time out, in milliseconds.
    pub short_timeout_ms: u64,

    /// The number of iterations of the signal-order, device/host and host-wait families.
    pub iterations: usize,

    /// The number of branches of a fan-out.
    pub fan_out_width: usize,

    /// The number of semaphores waited on by the wait-all and wait-any tests.
    pub wait_semaphore_count: usize,

    /// Only run these families. Empty means all of them.
    pub families: Vec<String>,

    /// Only run these protocols. Empty means both.
    pub sync_types: Vec<SynchronizationType>,

    /// Only run these semaphore kinds. Empty means both.
    pub semaphore_kinds: Vec<SemaphoreKind>,

    /// Only run cases whose name contains this string.
    pub name_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            seed: 0x5eed,
            long_timeout_ms: 10_000,
            short_timeout_ms: 1,
            iterations: 12,
            fan_out_width: 5,
            wait_semaphore_count: 100,
            families: Vec::new(),
            sync_types: Vec::new(),
            semaphore_kinds: Vec::new(),
            name_filter: None,
        }
    }
}

impl Config {
    #[inline]
    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    #[inline]
    pub fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.short_timeout_ms)
    }

    /// Derives the seed of one case from the run seed and the case name, so that a case is
    /// reproducible on its own regardless of which other cases run.
    pub fn seed_for(&self, case_name: &str) -> u64 {
        foldhash::fast::FixedState::with_seed(self.seed).hash_one(case_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();

        assert_eq!(config.long_timeout(), Duration::from_secs(10));
        assert_eq!(config.short_timeout(), Duration::from_millis(1));
        assert_eq!(config.fan_out_width, 5);
    }

    #[test]
    fn case_seeds_are_stable() {
        let config = Config::default();

        assert_eq!(config.seed_for("a"), config.seed_for("a"));
        assert_ne!(config.seed_for("a"), config.seed_for("b"));

        let other = Config {
            seed: 1,
            ..Config::default()
        };
        assert_ne!(config.seed_for("a"), other.seed_for("a"));
    }
}
