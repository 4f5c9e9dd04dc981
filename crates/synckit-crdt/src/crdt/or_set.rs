//! # Observed-Remove Set
//!
//! Set of JSON values where every addition mints a unique tag and removal
//! retires exactly the tags observed at issuance. A concurrent add mints
//! a tag the remover never saw, so add wins. Elements are keyed by their
//! canonical serialization; merge unions additions and removals.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::Crdt;
use crate::error::{CrdtError, Result};
use crate::op::{canonical_value_key, Operation, OperationKind, Tag};

/// An element with the tags minted for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SetEntry {
    element: Value,
    tags: HashSet<Tag>,
}

/// Observed-remove set over JSON values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrSet {
    /// Element entries keyed by canonical value serialization.
    entries: HashMap<String, SetEntry>,
    /// Retired tags.
    removed: HashSet<Tag>,
}

impl OrSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the element has at least one live tag.
    pub fn contains(&self, element: &Value) -> bool {
        self.entries
            .get(&canonical_value_key(element))
            .map_or(false, |entry| {
                entry.tags.iter().any(|tag| !self.removed.contains(tag))
            })
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.tags.iter().any(|tag| !self.removed.contains(tag)))
            .count()
    }

    /// True when no element is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live elements in canonical key order.
    pub fn elements(&self) -> Vec<Value> {
        let mut live: Vec<(&String, &SetEntry)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.tags.iter().any(|tag| !self.removed.contains(tag)))
            .collect();
        live.sort_by(|a, b| a.0.cmp(b.0));
        live.into_iter()
            .map(|(_, entry)| entry.element.clone())
            .collect()
    }

    /// Live tags currently observed for an element. Used to build the
    /// removal payload; empty for absent elements.
    pub fn observed_tags(&self, element: &Value) -> Vec<Tag> {
        self.entries
            .get(&canonical_value_key(element))
            .map(|entry| {
                entry
                    .tags
                    .iter()
                    .filter(|tag| !self.removed.contains(*tag))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build the payload removing every tag observed for `element`.
    pub fn prepare_remove(&self, element: Value) -> OperationKind {
        let tags = self.observed_tags(&element);
        OperationKind::SetRemove { element, tags }
    }
}

impl Crdt for OrSet {
    fn apply_remote(&mut self, op: &Operation) -> Result<bool> {
        match &op.kind {
            OperationKind::SetAdd { element, tag } => {
                let entry = self
                    .entries
                    .entry(canonical_value_key(element))
                    .or_insert_with(|| SetEntry {
                        element: element.clone(),
                        tags: HashSet::new(),
                    });
                Ok(entry.tags.insert(tag.clone()))
            }
            OperationKind::SetRemove { tags, .. } => {
                let mut changed = false;
                for tag in tags {
                    changed |= self.removed.insert(tag.clone());
                }
                Ok(changed)
            }
            other => Err(CrdtError::KindMismatch {
                op: other.name(),
                doc: "set",
            }),
        }
    }

    fn merge(&mut self, other: &Self) {
        for (key, entry) in &other.entries {
            let ours = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| SetEntry {
                    element: entry.element.clone(),
                    tags: HashSet::new(),
                });
            for tag in &entry.tags {
                ours.tags.insert(tag.clone());
            }
        }
        for tag in &other.removed {
            self.removed.insert(tag.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::replica::ClientId;
    use serde_json::json;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn add(element: Value, client: &str, seq: u64) -> Operation {
        let client = id(client);
        let mut clock = VectorClock::new();
        for _ in 0..seq {
            clock = clock.ticked(&client);
        }
        Operation {
            document_id: "doc".to_string(),
            kind: OperationKind::SetAdd {
                element,
                tag: Tag::new(client.clone(), seq),
            },
            clock,
            client_id: client,
            timestamp: 0,
        }
    }

    fn remove(set: &OrSet, element: Value, client: &str, seq: u64) -> Operation {
        let client = id(client);
        let mut clock = VectorClock::new();
        for _ in 0..seq {
            clock = clock.ticked(&client);
        }
        Operation {
            document_id: "doc".to_string(),
            kind: set.prepare_remove(element),
            clock,
            client_id: client,
            timestamp: 0,
        }
    }

    #[test]
    fn test_add_and_contains() {
        let mut set = OrSet::new();
        set.apply_remote(&add(json!("apple"), "A", 1)).unwrap();

        assert!(set.contains(&json!("apple")));
        assert!(!set.contains(&json!("pear")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_retires_observed_tags() {
        let mut set = OrSet::new();
        set.apply_remote(&add(json!(1), "A", 1)).unwrap();

        let rm = remove(&set, json!(1), "A", 2);
        set.apply_remote(&rm).unwrap();

        assert!(!set.contains(&json!(1)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_re_add_after_remove() {
        let mut set = OrSet::new();
        set.apply_remote(&add(json!("x"), "A", 1)).unwrap();
        let rm = remove(&set, json!("x"), "A", 2);
        set.apply_remote(&rm).unwrap();

        set.apply_remote(&add(json!("x"), "A", 3)).unwrap();
        assert!(set.contains(&json!("x")));
    }

    #[test]
    fn test_concurrent_add_wins_over_remove() {
        let mut a = OrSet::new();
        let mut b = OrSet::new();

        let shared = add(json!("doc"), "A", 1);
        a.apply_remote(&shared).unwrap();
        b.apply_remote(&shared).unwrap();

        // A removes while B concurrently re-adds under a fresh tag
        let rm = remove(&a, json!("doc"), "A", 2);
        let readd = add(json!("doc"), "B", 1);

        a.apply_remote(&rm).unwrap();
        a.apply_remote(&readd).unwrap();
        b.apply_remote(&readd).unwrap();
        b.apply_remote(&rm).unwrap();

        assert!(a.contains(&json!("doc")));
        assert!(b.contains(&json!("doc")));
        assert_eq!(a.elements(), b.elements());
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let mut set = OrSet::new();
        let op = add(json!(42), "A", 1);

        assert!(set.apply_remote(&op).unwrap());
        assert!(!set.apply_remote(&op).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_merge_converges() {
        let mut a = OrSet::new();
        let mut b = OrSet::new();

        a.apply_remote(&add(json!("left"), "A", 1)).unwrap();
        b.apply_remote(&add(json!("right"), "B", 1)).unwrap();
        let rm = remove(&b, json!("right"), "B", 2);
        b.apply_remote(&rm).unwrap();

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.elements(), ba.elements());
        assert_eq!(ab.elements(), vec![json!("left")]);
    }

    #[test]
    fn test_structured_elements_key_canonically() {
        let mut set = OrSet::new();
        set.apply_remote(&add(json!({ "a": 1, "b": 2 }), "A", 1)).unwrap();

        // field order is canonicalized, so this is the same element
        assert!(set.contains(&json!({ "b": 2, "a": 1 })));
    }

    #[test]
    fn test_remove_absent_element_is_noop() {
        let mut set = OrSet::new();
        let rm = remove(&set, json!("ghost"), "A", 1);
        assert!(!set.apply_remote(&rm).unwrap());
        assert!(set.is_empty());
    }
}
