//! Error types for cross-tab coordination.

use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, TabError>;

/// Errors produced by the broadcast bus and coordinator.
#[derive(Error, Debug)]
pub enum TabError {
    /// The broadcast channel has no live receivers.
    #[error("broadcast channel closed: {0}")]
    ChannelClosed(String),

    /// The coordinator was destroyed and cannot send.
    #[error("coordinator for '{0}' is destroyed")]
    Destroyed(String),

    /// Malformed snapshot or message payload.
    #[error("malformed payload: {0}")]
    Format(String),
}

impl From<serde_json::Error> for TabError {
    fn from(err: serde_json::Error) -> Self {
        TabError::Format(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TabError::Destroyed("doc-1".into());
        assert_eq!(err.to_string(), "coordinator for 'doc-1' is destroyed");
    }
}
