//! # Last-Write-Wins Map
//!
//! Field -> value map where every field carries its own causal cell.
//! Causally ordered writes resolve strictly (the later write replaces the
//! earlier); concurrent writes tiebreak by `(timestamp, client_id)`,
//! higher pair wins. Deletion writes a tombstone cell that competes under
//! the same rule, so a delete can lose to a concurrent set and vice versa.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{ClockOrdering, VectorClock};
use crate::crdt::Crdt;
use crate::error::{CrdtError, Result};
use crate::op::{Operation, OperationKind};
use crate::replica::ClientId;

/// One field's causal cell: the value plus everything needed to arbitrate
/// against a competing write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwCell {
    /// Stored value; meaningless when `tombstone` is set.
    pub value: Value,
    /// Wall-clock milliseconds at issuance.
    pub ts: u64,
    /// Issuing replica, the deterministic tiebreaker.
    pub client_id: ClientId,
    /// Issuing replica's clock at issuance.
    pub clock: VectorClock,
    /// Set when the field was deleted.
    pub tombstone: bool,
}

impl LwwCell {
    /// True when `self` replaces `existing` under the LWW rule.
    fn beats(&self, existing: &LwwCell) -> bool {
        match self.clock.compare(&existing.clock) {
            ClockOrdering::After => true,
            ClockOrdering::Before | ClockOrdering::Equal => false,
            ClockOrdering::Concurrent => {
                (self.ts, &self.client_id) > (existing.ts, &existing.client_id)
            }
        }
    }
}

/// Last-write-wins field map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LwwMap {
    cells: HashMap<String, LwwCell>,
}

impl LwwMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            cells: HashMap::new(),
        }
    }

    /// Visible value of a field. Tombstoned fields read as absent.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.cells
            .get(field)
            .and_then(|cell| (!cell.tombstone).then_some(&cell.value))
    }

    /// True when the field is visible.
    pub fn contains_field(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Number of visible fields.
    pub fn len(&self) -> usize {
        self.cells.values().filter(|c| !c.tombstone).count()
    }

    /// True when no field is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate visible fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.cells
            .iter()
            .filter(|(_, cell)| !cell.tombstone)
            .map(|(field, cell)| (field, &cell.value))
    }

    /// The underlying cell for a field, tombstones included.
    pub fn cell(&self, field: &str) -> Option<&LwwCell> {
        self.cells.get(field)
    }

    /// Render the visible fields as a JSON object.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        let mut fields: Vec<_> = self.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        map
    }

    fn integrate(&mut self, field: &str, incoming: LwwCell) -> bool {
        match self.cells.get(field) {
            Some(existing) if !incoming.beats(existing) => false,
            _ => {
                self.cells.insert(field.to_string(), incoming);
                true
            }
        }
    }
}

impl Crdt for LwwMap {
    fn apply_remote(&mut self, op: &Operation) -> Result<bool> {
        let (field, value, tombstone) = match &op.kind {
            OperationKind::Set { field, value } => (field, value.clone(), false),
            OperationKind::Delete { field } => (field, Value::Null, true),
            other => {
                return Err(CrdtError::KindMismatch {
                    op: other.name(),
                    doc: "map",
                })
            }
        };

        let incoming = LwwCell {
            value,
            ts: op.timestamp,
            client_id: op.client_id.clone(),
            clock: op.clock.clone(),
            tombstone,
        };
        Ok(self.integrate(field, incoming))
    }

    fn merge(&mut self, other: &Self) {
        for (field, cell) in &other.cells {
            self.integrate(field, cell.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn set(field: &str, value: Value, client: &str, clock: VectorClock, ts: u64) -> Operation {
        Operation {
            document_id: "doc".to_string(),
            kind: OperationKind::Set {
                field: field.to_string(),
                value,
            },
            clock,
            client_id: id(client),
            timestamp: ts,
        }
    }

    fn delete(field: &str, client: &str, clock: VectorClock, ts: u64) -> Operation {
        Operation {
            document_id: "doc".to_string(),
            kind: OperationKind::Delete {
                field: field.to_string(),
            },
            clock,
            client_id: id(client),
            timestamp: ts,
        }
    }

    #[test]
    fn test_set_and_get() {
        let mut map = LwwMap::new();
        let clock = VectorClock::new().ticked(&id("A"));
        map.apply_remote(&set("title", json!("hello"), "A", clock, 1)).unwrap();

        assert_eq!(map.get("title"), Some(&json!("hello")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_causally_later_write_replaces() {
        let mut map = LwwMap::new();
        let c1 = VectorClock::new().ticked(&id("A"));
        let c2 = c1.ticked(&id("A"));

        map.apply_remote(&set("title", json!("old"), "A", c1, 100)).unwrap();
        // later clock, *earlier* wall time: causality wins over timestamps
        map.apply_remote(&set("title", json!("new"), "A", c2, 50)).unwrap();

        assert_eq!(map.get("title"), Some(&json!("new")));
    }

    #[test]
    fn test_concurrent_tiebreak_by_timestamp_then_client() {
        // equal timestamps: the higher client id wins on both sides
        let mut a = LwwMap::new();
        let mut b = LwwMap::new();

        let op_a = set("title", json!("α"), "A", VectorClock::new().ticked(&id("A")), 100);
        let op_b = set("title", json!("β"), "B", VectorClock::new().ticked(&id("B")), 100);

        a.apply_remote(&op_a).unwrap();
        a.apply_remote(&op_b).unwrap();
        b.apply_remote(&op_b).unwrap();
        b.apply_remote(&op_a).unwrap();

        assert_eq!(a.get("title"), Some(&json!("β")));
        assert_eq!(b.get("title"), Some(&json!("β")));
    }

    #[test]
    fn test_delete_writes_competing_tombstone() {
        let mut map = LwwMap::new();
        let c1 = VectorClock::new().ticked(&id("A"));
        let c2 = c1.ticked(&id("A"));

        map.apply_remote(&set("title", json!("x"), "A", c1, 1)).unwrap();
        map.apply_remote(&delete("title", "A", c2.clone(), 2)).unwrap();

        assert_eq!(map.get("title"), None);
        assert!(!map.contains_field("title"));
        // the tombstone cell is retained for arbitration
        assert!(map.cell("title").unwrap().tombstone);

        // a concurrent set with a higher (ts, client) pair revives the field
        let concurrent = set(
            "title",
            json!("y"),
            "B",
            VectorClock::new().ticked(&id("B")),
            3,
        );
        map.apply_remote(&concurrent).unwrap();
        assert_eq!(map.get("title"), Some(&json!("y")));
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let mut map = LwwMap::new();
        let op = set("k", json!(1), "A", VectorClock::new().ticked(&id("A")), 5);

        assert!(map.apply_remote(&op).unwrap());
        assert!(!map.apply_remote(&op).unwrap());
        assert_eq!(map.get("k"), Some(&json!(1)));
    }

    #[test]
    fn test_apply_order_does_not_matter() {
        let ops = vec![
            set("a", json!(1), "A", VectorClock::new().ticked(&id("A")), 10),
            set("a", json!(2), "B", VectorClock::new().ticked(&id("B")), 11),
            set("b", json!(3), "C", VectorClock::new().ticked(&id("C")), 12),
        ];

        let mut forward = LwwMap::new();
        for op in &ops {
            forward.apply_remote(op).unwrap();
        }

        let mut backward = LwwMap::new();
        for op in ops.iter().rev() {
            backward.apply_remote(op).unwrap();
        }

        assert_eq!(forward.to_map(), backward.to_map());
    }

    #[test]
    fn test_merge_converges() {
        let mut a = LwwMap::new();
        let mut b = LwwMap::new();

        a.apply_remote(&set("x", json!("from-a"), "A", VectorClock::new().ticked(&id("A")), 10))
            .unwrap();
        b.apply_remote(&set("y", json!("from-b"), "B", VectorClock::new().ticked(&id("B")), 20))
            .unwrap();

        let mut merged_ab = a.clone();
        merged_ab.merge(&b);
        let mut merged_ba = b.clone();
        merged_ba.merge(&a);

        assert_eq!(merged_ab.to_map(), merged_ba.to_map());
        assert_eq!(merged_ab.len(), 2);
    }

    #[test]
    fn test_delete_missing_field_records_tombstone() {
        let mut map = LwwMap::new();
        map.apply_remote(&delete("ghost", "A", VectorClock::new().ticked(&id("A")), 1))
            .unwrap();

        assert_eq!(map.get("ghost"), None);
        // a concurrent set with a lower (ts, client) pair loses to the tombstone
        let losing = set(
            "ghost",
            json!("zombie"),
            "0",
            VectorClock::new().ticked(&id("0")),
            0,
        );
        map.apply_remote(&losing).unwrap();
        assert_eq!(map.get("ghost"), None);
    }
}
