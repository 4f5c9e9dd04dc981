//! Cross-tab message model.
//!
//! Every message carries its sender, a per-sender monotone sequence
//! number, and a wall-clock timestamp. Sequence numbers give per-sender
//! ordering only; there is no cross-sender total order, so divergence
//! detection built on these messages is optimistic and eventually
//! consistent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identity of one tab within a browsing context. Ordering is the
/// deterministic election tiebreaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(Uuid);

impl TabId {
    /// Mint a fresh tab id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application-level relay kinds carried between tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayKind {
    /// Generic document update.
    Update,
    /// Text insertion.
    TextInsert,
    /// Text deletion.
    TextDelete,
    /// Push onto the undo stack.
    UndoAdd,
    /// Undo request.
    Undo,
    /// Redo request.
    Redo,
}

/// Exact state carried in a full-sync handoff and digested for
/// divergence detection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TabSnapshot {
    /// Undo stack entries, oldest first.
    pub undo_stack: Vec<Value>,
    /// Redo stack entries, oldest first.
    pub redo_stack: Vec<Value>,
    /// Observable document state.
    pub document_state: Value,
}

impl TabSnapshot {
    /// Deterministic digest of the snapshot. Equal snapshots digest
    /// equally on every tab; JSON maps serialize with sorted keys.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Typed payload of a cross-tab message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TabMessageKind {
    /// Presence announcement.
    TabJoined,
    /// Explicit departure.
    TabLeaving,
    /// Candidacy for leadership.
    Election {
        /// The candidate's construction time; older wins.
        tab_start_time: u64,
    },
    /// Leader liveness, optionally with a state digest.
    Heartbeat {
        /// The leader's construction time, for split-brain arbitration.
        tab_start_time: u64,
        /// Digest of the leader's state, when a provider is wired.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_hash: Option<String>,
    },
    /// Follower asks the named leader for its exact state.
    RequestFullSync {
        /// The leader being asked.
        target: TabId,
    },
    /// Leader answers the named follower.
    FullSyncResponse {
        /// The follower being answered.
        target: TabId,
        /// The leader's exact state.
        snapshot: TabSnapshot,
    },
    /// Application-level relay.
    Relay {
        /// Relay kind.
        kind: RelayKind,
        /// Opaque application payload.
        data: Value,
    },
}

impl TabMessageKind {
    /// Wire name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            TabMessageKind::TabJoined => "tab-joined",
            TabMessageKind::TabLeaving => "tab-leaving",
            TabMessageKind::Election { .. } => "election",
            TabMessageKind::Heartbeat { .. } => "heartbeat",
            TabMessageKind::RequestFullSync { .. } => "request-full-sync",
            TabMessageKind::FullSyncResponse { .. } => "full-sync-response",
            TabMessageKind::Relay { .. } => "relay",
        }
    }
}

/// One message on the tab broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabMessage {
    /// Typed payload.
    #[serde(flatten)]
    pub kind: TabMessageKind,
    /// Sending tab.
    pub from: TabId,
    /// Per-sender monotone sequence number.
    pub seq: u64,
    /// Wall-clock milliseconds at send.
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_digest_is_deterministic() {
        let a = TabSnapshot {
            undo_stack: vec![json!({ "op": "set" })],
            redo_stack: vec![],
            document_state: json!({ "title": "x" }),
        };
        let b = a.clone();
        assert_eq!(a.digest(), b.digest());

        let c = TabSnapshot {
            document_state: json!({ "title": "y" }),
            ..a.clone()
        };
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = TabMessage {
            kind: TabMessageKind::Election { tab_start_time: 42 },
            from: TabId::new(),
            seq: 1,
            timestamp: 100,
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], json!("election"));
        assert_eq!(wire["tab_start_time"], json!(42));

        let back: TabMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_tab_id_ordering_is_stable() {
        let mut ids = vec![TabId::new(), TabId::new(), TabId::new()];
        ids.sort();
        let strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut sorted = strings.clone();
        sorted.sort();
        // byte order matches the canonical string order
        assert_eq!(strings, sorted);
    }
}
