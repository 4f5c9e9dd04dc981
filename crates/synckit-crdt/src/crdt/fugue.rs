//! # Fugue Text
//!
//! Position-identified character sequence with interleaving-free
//! concurrent insertion. Every character is a node identified by
//! `(client, seq)` and anchored between the left and right visible
//! neighbors observed at insertion time. Concurrent inserts sharing an
//! origin pair order by client id ascending; runs typed by one replica
//! stay contiguous because each character anchors on its predecessor.
//!
//! Integration resolves the insertion point from the origin pair alone,
//! so the same operation splices identically on every replica. Remote
//! nodes whose origins have not arrived yet are buffered and retried
//! once the missing node integrates. Deletion is an idempotent tombstone
//! flip; deletes for unseen nodes buffer the same way.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crdt::Crdt;
use crate::error::{CrdtError, Result};
use crate::op::{Anchor, NodeId, Operation, OperationKind};

/// One character of the sequence with its identity and anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    /// Minting replica and sequence number.
    pub id: NodeId,
    /// Visible left neighbor at insertion.
    pub left_origin: Anchor,
    /// Visible right neighbor at insertion.
    pub right_origin: Anchor,
    /// The character.
    pub character: char,
    /// Tombstone flag; tombstoned nodes stay for anchoring.
    pub deleted: bool,
}

/// Interleaving-free replicated text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FugueText {
    /// All nodes, tombstones included, in document order.
    nodes: Vec<TextNode>,
    /// Remote inserts waiting for their origins.
    pending_inserts: Vec<TextNode>,
    /// Remote deletes waiting for their targets.
    pending_deletes: HashSet<NodeId>,
}

impl FugueText {
    /// Create an empty text.
    pub fn new() -> Self {
        Self::default()
    }

    /// The visible characters, in order.
    pub fn text(&self) -> String {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| n.character)
            .collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| !n.deleted).count()
    }

    /// True when no character is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All nodes in document order, tombstones included.
    pub fn nodes(&self) -> &[TextNode] {
        &self.nodes
    }

    /// Build the payload for inserting `character` at visible `index`.
    /// Indexes past the end append; inserting at the end anchors on the
    /// sequence boundary. The caller supplies the freshly minted id.
    pub fn prepare_insert(&self, index: usize, character: char, node: NodeId) -> OperationKind {
        let visible: Vec<&TextNode> = self.nodes.iter().filter(|n| !n.deleted).collect();
        let index = index.min(visible.len());

        let left_origin = if index == 0 {
            Anchor::Start
        } else {
            Anchor::Node(visible[index - 1].id.clone())
        };
        let right_origin = if index == visible.len() {
            Anchor::End
        } else {
            Anchor::Node(visible[index].id.clone())
        };

        OperationKind::TextInsert {
            position: index,
            character,
            node,
            left_origin,
            right_origin,
        }
    }

    /// Build the payload for tombstoning `length` visible characters from
    /// `start`. A range running past the end is truncated, so deleting
    /// past the end no-ops on the missing suffix.
    pub fn prepare_delete(&self, start: usize, length: usize) -> OperationKind {
        let targets: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .skip(start)
            .take(length)
            .map(|n| n.id.clone())
            .collect();

        OperationKind::TextDelete {
            position: start,
            length: targets.len(),
            targets,
        }
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
            || self.pending_inserts.iter().any(|n| &n.id == id)
    }

    fn position_of(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    /// Resolve the insertion point for `node` and splice it. Returns
    /// `false` when an origin has not arrived yet.
    ///
    /// The conflict walk advances through the span between the two
    /// origins: a same-origin sibling from a lower client pushes the
    /// insertion point past itself and its subtree; a sibling sharing
    /// both origins from a higher client stops the walk. Nodes anchored
    /// inside the walked region belong to already-passed subtrees and
    /// are stepped over without moving the insertion point.
    fn try_integrate(&mut self, node: TextNode) -> std::result::Result<(), TextNode> {
        let left_pos = match &node.left_origin {
            Anchor::Start => None,
            Anchor::Node(id) => match self.position_of(id) {
                Some(pos) => Some(pos),
                None => return Err(node),
            },
            Anchor::End => self.nodes.len().checked_sub(1),
        };
        let right_pos = match &node.right_origin {
            Anchor::End => self.nodes.len(),
            Anchor::Node(id) => match self.position_of(id) {
                Some(pos) => pos,
                None => return Err(node),
            },
            Anchor::Start => 0,
        };

        let mut insert_after = left_pos;
        let mut scanned: HashSet<NodeId> = HashSet::new();
        let mut conflicting: HashSet<NodeId> = HashSet::new();

        let mut cursor = left_pos.map(|p| p + 1).unwrap_or(0);
        while cursor < self.nodes.len() && cursor != right_pos {
            let other = &self.nodes[cursor];
            scanned.insert(other.id.clone());
            conflicting.insert(other.id.clone());

            if other.left_origin == node.left_origin {
                if other.id.client < node.id.client {
                    insert_after = Some(cursor);
                    conflicting.clear();
                } else if other.right_origin == node.right_origin {
                    break;
                }
            } else if let Anchor::Node(other_origin) = &other.left_origin {
                if scanned.contains(other_origin) {
                    if !conflicting.contains(other_origin) {
                        insert_after = Some(cursor);
                        conflicting.clear();
                    }
                } else {
                    break;
                }
            } else {
                break;
            }
            cursor += 1;
        }

        let at = insert_after.map(|p| p + 1).unwrap_or(0);
        self.nodes.insert(at, node);
        Ok(())
    }

    fn integrate(&mut self, mut node: TextNode) -> bool {
        if self.contains(&node.id) {
            return false;
        }
        if self.pending_deletes.remove(&node.id) {
            node.deleted = true;
        }
        match self.try_integrate(node) {
            Ok(()) => {
                self.drain_pending();
                true
            }
            Err(node) => {
                tracing::debug!(node = %node.id, "buffering text insert until origins arrive");
                self.pending_inserts.push(node);
                false
            }
        }
    }

    /// Retry buffered inserts until a pass integrates nothing new.
    fn drain_pending(&mut self) {
        loop {
            let pending = std::mem::take(&mut self.pending_inserts);
            let before = pending.len();
            for node in pending {
                if let Err(node) = self.try_integrate(node) {
                    self.pending_inserts.push(node);
                }
            }
            if self.pending_inserts.len() == before {
                break;
            }
        }
    }

    fn tombstone(&mut self, target: &NodeId) -> bool {
        if let Some(node) = self.nodes.iter_mut().find(|n| &n.id == target) {
            if !node.deleted {
                node.deleted = true;
                return true;
            }
            return false;
        }
        if let Some(node) = self.pending_inserts.iter_mut().find(|n| &n.id == target) {
            node.deleted = true;
            return true;
        }
        self.pending_deletes.insert(target.clone())
    }
}

impl Crdt for FugueText {
    fn apply_remote(&mut self, op: &Operation) -> Result<bool> {
        match &op.kind {
            OperationKind::TextInsert {
                character,
                node,
                left_origin,
                right_origin,
                ..
            } => Ok(self.integrate(TextNode {
                id: node.clone(),
                left_origin: left_origin.clone(),
                right_origin: right_origin.clone(),
                character: *character,
                deleted: false,
            })),
            OperationKind::TextDelete { targets, .. } => {
                let mut changed = false;
                for target in targets {
                    changed |= self.tombstone(target);
                }
                Ok(changed)
            }
            other => Err(CrdtError::KindMismatch {
                op: other.name(),
                doc: "text",
            }),
        }
    }

    fn merge(&mut self, other: &Self) {
        for node in &other.nodes {
            if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id) {
                existing.deleted |= node.deleted;
            } else {
                self.integrate(node.clone());
            }
        }
        for node in &other.pending_inserts {
            if !self.contains(&node.id) {
                self.integrate(node.clone());
            }
        }
        for target in &other.pending_deletes {
            self.tombstone(target);
        }
        self.drain_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::replica::ClientId;

    struct Replica {
        client: ClientId,
        clock: VectorClock,
        text: FugueText,
    }

    impl Replica {
        fn new(name: &str) -> Self {
            Self {
                client: ClientId::new(name).unwrap(),
                clock: VectorClock::new(),
                text: FugueText::new(),
            }
        }

        fn insert(&mut self, index: usize, ch: char) -> Operation {
            self.clock = self.clock.ticked(&self.client);
            let node = NodeId::new(self.client.clone(), self.clock.get(&self.client));
            let kind = self.text.prepare_insert(index, ch, node);
            let op = Operation {
                document_id: "doc".to_string(),
                kind,
                clock: self.clock.clone(),
                client_id: self.client.clone(),
                timestamp: 0,
            };
            self.text.apply_remote(&op).unwrap();
            op
        }

        fn delete(&mut self, start: usize, length: usize) -> Operation {
            self.clock = self.clock.ticked(&self.client);
            let kind = self.text.prepare_delete(start, length);
            let op = Operation {
                document_id: "doc".to_string(),
                kind,
                clock: self.clock.clone(),
                client_id: self.client.clone(),
                timestamp: 0,
            };
            self.text.apply_remote(&op).unwrap();
            op
        }

        fn type_str(&mut self, index: usize, s: &str) -> Vec<Operation> {
            s.chars()
                .enumerate()
                .map(|(i, ch)| self.insert(index + i, ch))
                .collect()
        }
    }

    #[test]
    fn test_insert_and_read() {
        let mut a = Replica::new("A");
        a.type_str(0, "Hello");
        assert_eq!(a.text.text(), "Hello");
        assert_eq!(a.text.len(), 5);
    }

    #[test]
    fn test_insert_past_end_appends() {
        let mut a = Replica::new("A");
        a.type_str(0, "Hi");
        a.insert(99, '!');
        assert_eq!(a.text.text(), "Hi!");
    }

    #[test]
    fn test_delete_and_suffix_noop() {
        let mut a = Replica::new("A");
        a.type_str(0, "Hello");
        a.delete(1, 2);
        assert_eq!(a.text.text(), "Hlo");

        // deleting past the end only removes what exists
        a.delete(2, 10);
        assert_eq!(a.text.text(), "Hl");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut a = Replica::new("A");
        a.type_str(0, "ab");
        let del = a.delete(0, 1);
        assert_eq!(a.text.text(), "b");

        assert!(!a.text.apply_remote(&del).unwrap());
        assert_eq!(a.text.text(), "b");
    }

    #[test]
    fn test_concurrent_inserts_do_not_interleave() {
        // both replicas see "AC"; A inserts X at 1, B inserts Y at 1;
        // the lower client id sorts first -> "AXYC"
        let mut a = Replica::new("A");
        let base = a.type_str(0, "AC");

        let mut b = Replica::new("B");
        for op in &base {
            b.text.apply_remote(op).unwrap();
        }

        let op_x = a.insert(1, 'X');
        let op_y = b.insert(1, 'Y');
        assert_eq!(a.text.text(), "AXC");
        assert_eq!(b.text.text(), "AYC");

        a.text.apply_remote(&op_y).unwrap();
        b.text.apply_remote(&op_x).unwrap();

        assert_eq!(a.text.text(), "AXYC");
        assert_eq!(b.text.text(), "AXYC");
    }

    #[test]
    fn test_concurrent_runs_stay_contiguous() {
        let mut a = Replica::new("A");
        let base = a.type_str(0, "mile");

        let mut b = Replica::new("B");
        for op in &base {
            b.text.apply_remote(op).unwrap();
        }

        let run_a = a.type_str(4, " high");
        let run_b = b.type_str(4, " wide");

        for op in &run_b {
            a.text.apply_remote(op).unwrap();
        }
        for op in &run_a {
            b.text.apply_remote(op).unwrap();
        }

        assert_eq!(a.text.text(), b.text.text());
        let text = a.text.text();
        assert!(text.contains(" high"), "run interleaved: {text}");
        assert!(text.contains(" wide"), "run interleaved: {text}");
    }

    #[test]
    fn test_out_of_order_delivery_buffers() {
        let mut a = Replica::new("A");
        let ops = a.type_str(0, "xyz");

        // deliver in reverse: each insert's origin arrives after it
        let mut b = Replica::new("B");
        for op in ops.iter().rev() {
            b.text.apply_remote(op).unwrap();
        }
        assert_eq!(b.text.text(), "xyz");
    }

    #[test]
    fn test_delete_before_insert_arrives() {
        let mut a = Replica::new("A");
        let insert = a.insert(0, 'q');
        let delete = a.delete(0, 1);

        let mut b = Replica::new("B");
        b.text.apply_remote(&delete).unwrap();
        b.text.apply_remote(&insert).unwrap();

        assert_eq!(b.text.text(), "");
        assert_eq!(a.text.text(), "");
    }

    #[test]
    fn test_reapply_insert_is_idempotent() {
        let mut a = Replica::new("A");
        let op = a.insert(0, 'k');

        assert!(!a.text.apply_remote(&op).unwrap());
        assert_eq!(a.text.text(), "k");
        assert_eq!(a.text.len(), 1);
    }

    #[test]
    fn test_merge_full_states() {
        let mut a = Replica::new("A");
        let base = a.type_str(0, "shared");
        let mut b = Replica::new("B");
        for op in &base {
            b.text.apply_remote(op).unwrap();
        }

        a.type_str(6, "-one");
        b.delete(0, 1);

        let mut merged_ab = a.text.clone();
        merged_ab.merge(&b.text);
        let mut merged_ba = b.text.clone();
        merged_ba.merge(&a.text);

        assert_eq!(merged_ab.text(), merged_ba.text());
        assert_eq!(merged_ab.text(), "hared-one");
    }

    #[test]
    fn test_three_replica_convergence() {
        let mut a = Replica::new("A");
        let mut b = Replica::new("B");
        let mut c = Replica::new("C");

        let ops_a = a.type_str(0, "aa");
        let ops_b = b.type_str(0, "bb");
        let ops_c = c.type_str(0, "cc");

        let all = |mine: &[Operation]| {
            let mut ops: Vec<&Operation> = Vec::new();
            for group in [&ops_a, &ops_b, &ops_c] {
                if group.as_ptr() != mine.as_ptr() {
                    ops.extend(group.iter());
                }
            }
            ops
        };

        for op in all(&ops_a) {
            a.text.apply_remote(op).unwrap();
        }
        for op in all(&ops_b).iter().rev() {
            b.text.apply_remote(op).unwrap();
        }
        for op in all(&ops_c) {
            c.text.apply_remote(op).unwrap();
        }

        assert_eq!(a.text.text(), b.text.text());
        assert_eq!(b.text.text(), c.text.text());
    }

    #[test]
    fn test_empty_text_observes_empty() {
        let text = FugueText::new();
        assert_eq!(text.text(), "");
        assert!(text.is_empty());
    }
}
