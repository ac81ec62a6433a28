//! Configuration for asset activation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Activation polling bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Delay between status polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum status polls after the activation request.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Maximum total wait for one image in seconds.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    /// Consecutive provider errors tolerated while polling.
    #[serde(default = "default_error_budget")]
    pub error_budget: u32,
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_max_polls() -> u32 {
    120
}

fn default_max_wait() -> u64 {
    900 // 15 minutes
}

fn default_error_budget() -> u32 {
    3
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            max_wait_secs: default_max_wait(),
            error_budget: default_error_budget(),
        }
    }
}

impl ActivationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ActivationConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.max_polls, 120);
        assert_eq!(config.max_wait(), Duration::from_secs(900));
        assert_eq!(config.error_budget, 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ActivationConfig = toml::from_str("max_polls = 10").unwrap();
        assert_eq!(config.max_polls, 10);
        assert_eq!(config.poll_interval_ms, 5_000);
    }
}
