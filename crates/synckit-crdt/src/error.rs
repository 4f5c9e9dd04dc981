//! Error types for the SyncKit CRDT layer.

use thiserror::Error;

/// Result type alias for CRDT operations.
pub type Result<T> = std::result::Result<T, CrdtError>;

/// Errors produced by the CRDT document algebra.
#[derive(Error, Debug)]
pub enum CrdtError {
    /// Replica identifiers must be non-empty.
    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    /// Malformed persisted or remote state. The document keeps its
    /// previous state when this is returned.
    #[error("malformed document state: {0}")]
    Format(String),

    /// An operation was routed to a document of the wrong variant.
    #[error("operation '{op}' does not apply to a '{doc}' document")]
    KindMismatch {
        /// Wire name of the offending operation.
        op: &'static str,
        /// Variant name of the target document.
        doc: &'static str,
    },

    /// Index out of range for a text mutation.
    #[error("text index {index} out of bounds (len {len})")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Visible length at the time of the call.
        len: usize,
    },
}

impl From<serde_json::Error> for CrdtError {
    fn from(err: serde_json::Error) -> Self {
        CrdtError::Format(err.to_string())
    }
}
