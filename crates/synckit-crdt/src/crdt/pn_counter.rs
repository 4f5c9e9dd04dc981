//! # Positive-Negative Counter
//!
//! Signed counter split into per-replica increment and decrement
//! registers; the observed value is the difference of the two sums.
//! Deltas from a replica are folded into that replica's registers in
//! sequence order, with a per-replica watermark so redelivered
//! operations fold exactly once. Merge takes the component-wise maximum
//! of every register.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crdt::Crdt;
use crate::error::{CrdtError, Result};
use crate::op::{Operation, OperationKind};
use crate::replica::ClientId;

/// Positive-negative counter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PnCounter {
    /// Per-replica increment totals.
    inc: HashMap<ClientId, u64>,
    /// Per-replica decrement totals.
    dec: HashMap<ClientId, u64>,
    /// Highest applied sequence number per replica.
    applied: HashMap<ClientId, u64>,
}

impl PnCounter {
    /// Create a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observed value: total increments minus total decrements.
    pub fn value(&self) -> i64 {
        let inc: u64 = self.inc.values().sum();
        let dec: u64 = self.dec.values().sum();
        inc as i64 - dec as i64
    }

    /// Total increments across replicas.
    pub fn total_increments(&self) -> u64 {
        self.inc.values().sum()
    }

    /// Total decrements across replicas.
    pub fn total_decrements(&self) -> u64 {
        self.dec.values().sum()
    }

    /// True when the observed value is zero.
    pub fn is_zero(&self) -> bool {
        self.value() == 0
    }
}

impl Crdt for PnCounter {
    fn apply_remote(&mut self, op: &Operation) -> Result<bool> {
        let delta = match &op.kind {
            OperationKind::CounterAdd { delta } => *delta,
            other => {
                return Err(CrdtError::KindMismatch {
                    op: other.name(),
                    doc: "counter",
                })
            }
        };

        // Redelivery guard: each replica's deltas fold once, in order.
        let seq = op.sequence();
        let watermark = self.applied.get(&op.client_id).copied().unwrap_or(0);
        if seq <= watermark {
            return Ok(false);
        }
        self.applied.insert(op.client_id.clone(), seq);

        if delta >= 0 {
            *self.inc.entry(op.client_id.clone()).or_insert(0) += delta as u64;
        } else {
            *self.dec.entry(op.client_id.clone()).or_insert(0) += delta.unsigned_abs();
        }
        Ok(delta != 0)
    }

    fn merge(&mut self, other: &Self) {
        for (id, &value) in &other.inc {
            let entry = self.inc.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        for (id, &value) in &other.dec {
            let entry = self.dec.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        for (id, &value) in &other.applied {
            let entry = self.applied.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn add(client: &str, seq: u64, delta: i64) -> Operation {
        let client = id(client);
        let mut clock = VectorClock::new();
        for _ in 0..seq {
            clock = clock.ticked(&client);
        }
        Operation {
            document_id: "doc".to_string(),
            kind: OperationKind::CounterAdd { delta },
            clock,
            client_id: client,
            timestamp: 0,
        }
    }

    #[test]
    fn test_increment_and_decrement() {
        let mut counter = PnCounter::new();
        counter.apply_remote(&add("A", 1, 5)).unwrap();
        counter.apply_remote(&add("A", 2, -2)).unwrap();

        assert_eq!(counter.value(), 3);
        assert_eq!(counter.total_increments(), 5);
        assert_eq!(counter.total_decrements(), 2);
    }

    #[test]
    fn test_concurrent_convergence() {
        // A adds 5; B adds 3 then subtracts 1; both must observe 7
        let ops = [add("A", 1, 5), add("B", 1, 3), add("B", 2, -1)];

        let mut a = PnCounter::new();
        let mut b = PnCounter::new();
        for op in &ops {
            a.apply_remote(op).unwrap();
        }
        // different cross-replica interleaving, same per-replica order
        for idx in [1, 2, 0] {
            b.apply_remote(&ops[idx]).unwrap();
        }

        assert_eq!(a.value(), 7);
        assert_eq!(b.value(), 7);
    }

    #[test]
    fn test_redelivery_folds_once() {
        let mut counter = PnCounter::new();
        let op = add("A", 1, 10);

        assert!(counter.apply_remote(&op).unwrap());
        assert!(!counter.apply_remote(&op).unwrap());
        assert_eq!(counter.value(), 10);
    }

    #[test]
    fn test_merge_is_componentwise_max() {
        let mut a = PnCounter::new();
        a.apply_remote(&add("A", 1, 4)).unwrap();

        let mut b = a.clone();
        b.apply_remote(&add("B", 1, -1)).unwrap();

        a.merge(&b);
        b.merge(&a);

        assert_eq!(a.value(), 3);
        assert_eq!(b.value(), 3);

        // idempotent
        let before = a.clone();
        a.merge(&before);
        assert_eq!(a, before);
    }

    #[test]
    fn test_zero_delta_changes_nothing_observable() {
        let mut counter = PnCounter::new();
        assert!(!counter.apply_remote(&add("A", 1, 0)).unwrap());
        assert!(counter.is_zero());
    }
}
