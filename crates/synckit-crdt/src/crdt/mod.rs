//! # CRDT Document Algebra
//!
//! Four conflict-free replicated document variants sharing one
//! mutation/observe/merge contract:
//!
//! - **LwwMap**: field -> value map with per-field last-write-wins cells
//! - **FugueText**: position-identified character sequence with
//!   interleaving-free concurrent insertion
//! - **PnCounter**: per-replica increment/decrement registers
//! - **OrSet**: observed-remove set with unique add-tags
//!
//! All variants are strong eventually consistent: two replicas that have
//! received the same set of operations expose equal observable state
//! regardless of delivery order. Remote application is idempotent.
//!
//! Variants are dispatched through the [`DocumentData`] sum type rather
//! than trait objects; the shared behavioral contract is the [`Crdt`]
//! trait.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CrdtError, Result};
use crate::op::Operation;

pub mod fugue;
pub mod lww_map;
pub mod or_set;
pub mod pn_counter;

pub use fugue::{FugueText, TextNode};
pub use lww_map::{LwwCell, LwwMap};
pub use or_set::OrSet;
pub use pn_counter::PnCounter;

/// Shared contract implemented by every document variant.
pub trait Crdt: Sized {
    /// Apply an operation received from another replica (or replayed from
    /// the local log). Returns whether state changed; re-delivery of an
    /// already-integrated operation returns `Ok(false)`.
    fn apply_remote(&mut self, op: &Operation) -> Result<bool>;

    /// Merge a full peer state into this one. Commutative, associative,
    /// idempotent.
    fn merge(&mut self, other: &Self);
}

/// The CRDT state of one document: a tagged variant, one per algebra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentData {
    /// Last-write-wins field map.
    Map(LwwMap),
    /// Interleaving-free text sequence.
    Text(FugueText),
    /// Positive-negative counter.
    Counter(PnCounter),
    /// Observed-remove set.
    Set(OrSet),
}

impl DocumentData {
    /// Fresh empty map document.
    pub fn new_map() -> Self {
        DocumentData::Map(LwwMap::new())
    }

    /// Fresh empty text document.
    pub fn new_text() -> Self {
        DocumentData::Text(FugueText::new())
    }

    /// Fresh zeroed counter document.
    pub fn new_counter() -> Self {
        DocumentData::Counter(PnCounter::new())
    }

    /// Fresh empty set document.
    pub fn new_set() -> Self {
        DocumentData::Set(OrSet::new())
    }

    /// Variant name, matching the serialized `kind` tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            DocumentData::Map(_) => "map",
            DocumentData::Text(_) => "text",
            DocumentData::Counter(_) => "counter",
            DocumentData::Set(_) => "set",
        }
    }

    /// Apply an operation from another replica, dispatching on the
    /// variant. Operations routed to the wrong variant fail with
    /// [`CrdtError::KindMismatch`].
    pub fn apply_remote(&mut self, op: &Operation) -> Result<bool> {
        match self {
            DocumentData::Map(map) => map.apply_remote(op),
            DocumentData::Text(text) => text.apply_remote(op),
            DocumentData::Counter(counter) => counter.apply_remote(op),
            DocumentData::Set(set) => set.apply_remote(op),
        }
    }

    /// Integrate an operation this replica just minted. Local operations
    /// go through the same integration path as remote ones; the freshly
    /// ticked clock makes them win their own cells outright.
    pub fn apply_local(&mut self, op: &Operation) -> Result<bool> {
        self.apply_remote(op)
    }

    /// Merge a peer state of the same variant.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        match (self, other) {
            (DocumentData::Map(a), DocumentData::Map(b)) => a.merge(b),
            (DocumentData::Text(a), DocumentData::Text(b)) => a.merge(b),
            (DocumentData::Counter(a), DocumentData::Counter(b)) => a.merge(b),
            (DocumentData::Set(a), DocumentData::Set(b)) => a.merge(b),
            (me, other) => {
                return Err(CrdtError::Format(format!(
                    "cannot merge '{}' state into '{}' document",
                    other.kind_name(),
                    me.kind_name()
                )))
            }
        }
        Ok(())
    }

    /// Observable state, recomputed from the authoritative CRDT.
    pub fn view(&self) -> DocumentView {
        match self {
            DocumentData::Map(map) => DocumentView::Map(map.to_map()),
            DocumentData::Text(text) => DocumentView::Text(text.text()),
            DocumentData::Counter(counter) => DocumentView::Counter(counter.value()),
            DocumentData::Set(set) => DocumentView::Set(set.elements()),
        }
    }

    /// Serialize to the persisted representation.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a persisted representation. Malformed input fails with
    /// [`CrdtError::Format`] and leaves any existing state untouched.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Derived, user-facing state of a document. Cheap to clone and compare;
/// never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentView {
    /// Visible fields of a map document.
    Map(serde_json::Map<String, Value>),
    /// Visible characters of a text document.
    Text(String),
    /// Observed counter value.
    Counter(i64),
    /// Live elements of a set document, in canonical order.
    Set(Vec<Value>),
}

impl DocumentView {
    /// The map fields, when this is a map view.
    pub fn as_map(&self) -> Option<&serde_json::Map<String, Value>> {
        match self {
            DocumentView::Map(map) => Some(map),
            _ => None,
        }
    }

    /// The text, when this is a text view.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DocumentView::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The counter value, when this is a counter view.
    pub fn as_counter(&self) -> Option<i64> {
        match self {
            DocumentView::Counter(value) => Some(*value),
            _ => None,
        }
    }

    /// The elements, when this is a set view.
    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            DocumentView::Set(elements) => Some(elements),
            _ => None,
        }
    }

    /// Render as a JSON value (used for digests and relays).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::op::OperationKind;
    use crate::replica::ClientId;
    use serde_json::json;

    fn set_op(doc: &str, field: &str, value: Value, client: &str, seq: u64, ts: u64) -> Operation {
        let client = ClientId::new(client).unwrap();
        let mut clock = VectorClock::new();
        for _ in 0..seq {
            clock = clock.ticked(&client);
        }
        Operation {
            document_id: doc.to_string(),
            kind: OperationKind::Set {
                field: field.to_string(),
                value,
            },
            clock,
            client_id: client,
            timestamp: ts,
        }
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut counter = DocumentData::new_counter();
        let op = set_op("doc", "title", json!("x"), "A", 1, 1);
        let err = counter.apply_remote(&op).unwrap_err();
        assert!(matches!(err, CrdtError::KindMismatch { .. }));
    }

    #[test]
    fn test_merge_rejects_wrong_variant() {
        let mut map = DocumentData::new_map();
        let text = DocumentData::new_text();
        assert!(map.merge(&text).is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut map = DocumentData::new_map();
        map.apply_remote(&set_op("doc", "title", json!("hello"), "A", 1, 10))
            .unwrap();

        let bytes = map.snapshot().unwrap();
        let restored = DocumentData::load(&bytes).unwrap();
        assert_eq!(restored, map);
        assert_eq!(restored.view(), map.view());
    }

    #[test]
    fn test_load_rejects_malformed_state() {
        assert!(matches!(
            DocumentData::load(b"not json"),
            Err(CrdtError::Format(_))
        ));
    }

    #[test]
    fn test_view_accessors() {
        let counter = DocumentData::new_counter();
        assert_eq!(counter.view().as_counter(), Some(0));
        assert_eq!(counter.view().as_text(), None);

        let text = DocumentData::new_text();
        assert_eq!(text.view().as_text(), Some(""));
    }
}
