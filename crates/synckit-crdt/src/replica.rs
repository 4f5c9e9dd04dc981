//! Replica identity.
//!
//! Every independent copy of a document is a replica, identified by a
//! stable [`ClientId`]. The id doubles as the dimension key in vector
//! clocks and as the deterministic tiebreaker for last-write-wins
//! resolution, so its ordering must be total and stable across processes.

use serde::{Deserialize, Serialize};

use crate::error::{CrdtError, Result};

/// Stable, globally unique identifier for a replica.
///
/// Opaque non-empty string. Lexicographic ordering is part of the
/// replication contract: concurrent writes with equal timestamps resolve
/// toward the greater id on every replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client id, rejecting empty strings.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CrdtError::InvalidClientId(
                "client id must be non-empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// View the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClientId {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_rejects_empty() {
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("replica-1").is_ok());
    }

    #[test]
    fn test_client_id_ordering() {
        let a = ClientId::new("A").unwrap();
        let b = ClientId::new("B").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_client_id_serde_transparent() {
        let id = ClientId::new("tab-7").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"tab-7\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
