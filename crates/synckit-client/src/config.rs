//! Client configuration.

use std::time::Duration;

use crate::error::{Result, SyncError};

/// Tunables for the offline queue and sync manager. Passed explicitly to
/// each component; there is no process-wide configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Offline queue capacity. `enqueue` fails once reached.
    pub max_queue_size: usize,
    /// Delivery attempts before an entry moves to the dead-letter queue.
    pub max_retries: u32,
    /// Base delay between replay attempts.
    pub retry_delay: Duration,
    /// Multiplier applied per failed attempt.
    pub retry_backoff: f64,
    /// How long a pushed delta waits for its ACK.
    pub ack_timeout: Duration,
    /// How long subscribe / sync-request wait for a sync response.
    pub sync_response_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_retries: 5,
            retry_delay: Duration::from_millis(1000),
            retry_backoff: 2.0,
            ack_timeout: Duration::from_secs(5),
            sync_response_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Set the offline queue capacity.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the retry cap.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff base delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_retry_backoff(mut self, backoff: f64) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the per-push ACK wait.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the subscribe / sync-request wait.
    pub fn with_sync_response_timeout(mut self, timeout: Duration) -> Self {
        self.sync_response_timeout = timeout;
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(SyncError::Configuration(
                "max_queue_size must be at least 1".into(),
            ));
        }
        if !(self.retry_backoff.is_finite() && self.retry_backoff >= 1.0) {
            return Err(SyncError::Configuration(
                "retry_backoff must be a finite multiplier >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Delay before the next attempt of an entry that has failed
    /// `retries` times. Finite for every step.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1);
        let factor = self.retry_backoff.powi(exponent.min(i32::MAX as u32) as i32);
        self.retry_delay.mul_f64(factor.min(1e6))
    }
}
