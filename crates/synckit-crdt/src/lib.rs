//! # SyncKit CRDT Layer
//!
//! Conflict-free replicated document types and causality tracking for the
//! SyncKit replication substrate.
//!
//! This crate provides the per-document state machines that let replicas
//! mutate independently, exchange operations in any order, and converge
//! without coordination.
//!
//! ## Document variants
//!
//! - **LwwMap**: last-write-wins field map for record-shaped documents
//! - **FugueText**: interleaving-free collaborative text
//! - **PnCounter**: increment/decrement counter
//! - **OrSet**: observed-remove set with add-wins semantics
//!
//! ## Causality
//!
//! Every operation carries the issuing replica's [`VectorClock`] at
//! issuance. Clocks order causally related operations; concurrent updates
//! to the same LWW cell resolve deterministically by
//! `(timestamp, client_id)`.
//!
//! ## Quick start
//!
//! ```rust
//! use serde_json::json;
//! use synckit_crdt::{ClientId, DocumentData, Operation, OperationKind, VectorClock};
//!
//! let client = ClientId::new("replica-a").unwrap();
//! let mut doc = DocumentData::new_map();
//!
//! let clock = VectorClock::new().ticked(&client);
//! let op = Operation {
//!     document_id: "todo-1".to_string(),
//!     kind: OperationKind::Set { field: "title".into(), value: json!("buy milk") },
//!     clock,
//!     client_id: client,
//!     timestamp: 1_700_000_000_000,
//! };
//! doc.apply_local(&op).unwrap();
//!
//! assert_eq!(doc.view().as_map().unwrap()["title"], json!("buy milk"));
//! ```
//!
//! ## Guarantees
//!
//! - **Strong eventual consistency**: replicas that received the same set
//!   of operations expose equal observable views
//! - **Idempotent delivery**: re-applying an integrated operation is a
//!   no-op, so at-least-once transports are safe
//! - **Deterministic tiebreaks**: concurrent conflicts resolve the same
//!   way on every replica

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod clock;
pub mod crdt;
pub mod error;
pub mod op;
pub mod replica;

pub use clock::{ClockOrdering, VectorClock};
pub use crdt::{Crdt, DocumentData, DocumentView, FugueText, LwwCell, LwwMap, OrSet, PnCounter, TextNode};
pub use error::{CrdtError, Result};
pub use op::{canonical_value_key, Anchor, NodeId, Operation, OperationKind, Tag};
pub use replica::ClientId;
