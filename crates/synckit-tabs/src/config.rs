//! Coordinator configuration.

use std::time::Duration;

/// Timing knobs for leader election and liveness.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence threshold before followers declare the leader lost.
    pub heartbeat_timeout: Duration,
    /// How long a tab waits for an older candidate before elevating
    /// itself.
    pub settle_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2000),
            heartbeat_timeout: Duration::from_millis(5000),
            settle_timeout: Duration::from_millis(100),
        }
    }
}

impl CoordinatorConfig {
    /// Set the heartbeat period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the leader-loss threshold.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the election settle window.
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2000));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(5000));
        assert_eq!(config.settle_timeout, Duration::from_millis(100));
    }
}
