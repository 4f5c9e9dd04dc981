//! Error types for the SyncKit client layer.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by the offline queue, sync manager, and document
/// facade.
///
/// Transport and timeout failures are recovered locally (the affected
/// operation lands in the offline queue and the outcome surfaces through
/// the sync-state stream); they appear here only on paths where the
/// caller asked for the network result directly.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Connectivity or send failure on the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// An ACK or sync-response wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The offline queue is at capacity; existing work is never dropped.
    #[error("offline queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Malformed persisted or remote payload. The payload is dropped and
    /// the document continues from its last known-good state.
    #[error("malformed payload: {0}")]
    Format(String),

    /// Programmer error, e.g. re-entrant replay or a mutation issued
    /// from inside a change notification.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A remote message referenced a document that is not registered.
    #[error("unknown document: {0}")]
    UnknownDocument(String),

    /// The persistence adapter failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Error bubbled up from the CRDT layer.
    #[error(transparent)]
    Crdt(#[from] synckit_crdt::CrdtError),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Format(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::QueueFull { capacity: 100 };
        assert_eq!(err.to_string(), "offline queue full (capacity 100)");
    }

    #[test]
    fn test_crdt_error_is_transparent() {
        let err: SyncError = synckit_crdt::CrdtError::Format("bad".into()).into();
        assert_eq!(err.to_string(), "malformed document state: bad");
    }
}
