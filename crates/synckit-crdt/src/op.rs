//! The operation model: the unit transmitted between replicas and held
//! in the offline queue.
//!
//! Operations carry their full causal context (the issuing replica's
//! vector clock at issuance plus a wall-clock timestamp) so any replica
//! can order, deduplicate, and tiebreak them without coordination.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::replica::ClientId;

/// Identity of a text node or set tag: the minting replica plus that
/// replica's sequence number at mint time. Value type; never a pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Minting replica.
    pub client: ClientId,
    /// The replica's clock component when the node was minted.
    pub seq: u64,
}

impl NodeId {
    /// Create a node id.
    pub fn new(client: ClientId, seq: u64) -> Self {
        Self { client, seq }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.client, self.seq)
    }
}

/// Unique tag attached to each observed-remove set addition.
pub type Tag = NodeId;

/// Position reference for text nodes: the visible left/right neighbor at
/// insertion time, or the sequence boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    /// Before the first character.
    Start,
    /// After the last character.
    End,
    /// A concrete node.
    Node(NodeId),
}

/// Typed payload of an operation, tagged with its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperationKind {
    /// Write a field of an LWW map.
    Set {
        /// Target field.
        field: String,
        /// New value.
        value: Value,
    },
    /// Tombstone a field of an LWW map.
    Delete {
        /// Target field.
        field: String,
    },
    /// Splice one character into a text document. The minted node and its
    /// origin pair travel with the operation so every replica integrates
    /// it identically; `position` is the visible index at issuance.
    TextInsert {
        /// Visible index at issuance.
        position: usize,
        /// Inserted character.
        character: char,
        /// Identity of the minted node.
        node: NodeId,
        /// Visible left neighbor at issuance.
        left_origin: Anchor,
        /// Visible right neighbor at issuance.
        right_origin: Anchor,
    },
    /// Tombstone a run of visible characters.
    TextDelete {
        /// Visible start index at issuance.
        position: usize,
        /// Number of characters tombstoned.
        length: usize,
        /// Node identities resolved at issuance.
        targets: Vec<NodeId>,
    },
    /// Adjust a PN-counter. Positive deltas increment, negative decrement.
    CounterAdd {
        /// Signed delta.
        delta: i64,
    },
    /// Add an element to an observed-remove set under a fresh tag.
    SetAdd {
        /// Element value.
        element: Value,
        /// Unique tag minted for this addition.
        tag: Tag,
    },
    /// Remove an element by retiring the tags observed at issuance.
    SetRemove {
        /// Element value.
        element: Value,
        /// Tags observed for the element at issuance.
        tags: Vec<Tag>,
    },
}

impl OperationKind {
    /// Wire name of this operation kind.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Set { .. } => "set",
            OperationKind::Delete { .. } => "delete",
            OperationKind::TextInsert { .. } => "text-insert",
            OperationKind::TextDelete { .. } => "text-delete",
            OperationKind::CounterAdd { .. } => "counter-add",
            OperationKind::SetAdd { .. } => "set-add",
            OperationKind::SetRemove { .. } => "set-remove",
        }
    }

    /// The field / position / element discriminator, used to pair a remote
    /// delta with a locally pending operation on the same target.
    pub fn field_key(&self) -> String {
        match self {
            OperationKind::Set { field, .. } | OperationKind::Delete { field } => field.clone(),
            OperationKind::TextInsert { position, .. } => position.to_string(),
            OperationKind::TextDelete { position, .. } => position.to_string(),
            OperationKind::CounterAdd { .. } => String::new(),
            OperationKind::SetAdd { element, .. } | OperationKind::SetRemove { element, .. } => {
                canonical_value_key(element)
            }
        }
    }

    /// Canonical rendering of the operation's value payload, used by the
    /// offline queue's duplicate detection.
    pub fn value_key(&self) -> String {
        match self {
            OperationKind::Set { value, .. } => canonical_value_key(value),
            OperationKind::Delete { .. } => String::new(),
            OperationKind::TextInsert { character, .. } => character.to_string(),
            OperationKind::TextDelete { length, .. } => length.to_string(),
            OperationKind::CounterAdd { delta } => delta.to_string(),
            OperationKind::SetAdd { element, .. } | OperationKind::SetRemove { element, .. } => {
                canonical_value_key(element)
            }
        }
    }
}

/// Canonical string form of a JSON value. `serde_json` maps are ordered,
/// so equal values always render identically.
pub fn canonical_value_key(value: &Value) -> String {
    value.to_string()
}

/// A single replicated mutation with its causal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Target document.
    pub document_id: String,
    /// Typed payload.
    #[serde(flatten)]
    pub kind: OperationKind,
    /// The issuing replica's full clock, post-tick.
    pub clock: VectorClock,
    /// Issuing replica.
    pub client_id: ClientId,
    /// Wall-clock milliseconds at issuance.
    pub timestamp: u64,
}

impl Operation {
    /// The operation's sequence number: its issuer's own clock component.
    pub fn sequence(&self) -> u64 {
        self.clock.get(&self.client_id)
    }

    /// Key for the offline queue's duplicate detection:
    /// `(documentId, type, field/position/element, value)`.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.document_id,
            self.kind.name(),
            self.kind.field_key(),
            self.kind.value_key()
        )
    }
}
