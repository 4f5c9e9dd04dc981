//! # SyncKit Client
//!
//! Offline-first client replication substrate: durable operation queue,
//! sync manager, document facade, and the persistence/transport
//! interfaces the host plugs into.
//!
//! ## Architecture
//!
//! ```text
//! user ──> Document ──> CRDT apply + clock tick + persist
//!              │
//!              └──> SyncManager ──> delta/ACK over Transport
//!                       │
//!                       └──> OfflineQueue (durable retry) ──> StorageAdapter
//! ```
//!
//! Local mutations commit against the CRDT and storage before any
//! network activity; connectivity outcomes surface through the
//! per-document sync-state stream. Everything pending survives a restart
//! through the persistence adapter.
//!
//! ## Quick start
//!
//! ```rust
//! use serde_json::json;
//! use synckit_client::{ChannelTransport, Document, MemoryStorage, SyncConfig, SyncManager};
//! use synckit_crdt::{ClientId, DocumentData};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let storage = MemoryStorage::new();
//! let (transport, _server_side) = ChannelTransport::new();
//!
//! let client = ClientId::new("replica-a").unwrap();
//! let manager = SyncManager::new(client.clone(), transport, storage.clone(),
//!     SyncConfig::default()).unwrap();
//!
//! let doc = Document::new("todo-1", client, DocumentData::new_map(), storage);
//! manager.register(&doc);
//!
//! doc.set("title", json!("buy milk")).await.unwrap();
//! assert_eq!(doc.get().as_map().unwrap()["title"], json!("buy milk"));
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod history;
pub mod manager;
pub mod queue;
pub mod storage;
pub mod transport;

pub use client::SyncKit;
pub use config::SyncConfig;
pub use document::{Document, DocumentEnvelope};
pub use error::{Result, SyncError};
pub use history::{UndoManager, UndoStep};
pub use manager::{DocumentSyncState, SyncManager, SyncStatus};
pub use queue::{ListenerHandle, OfflineQueue, QueueStats, QueuedOperation};
pub use storage::{keys, MemoryStorage, StorageAdapter};
pub use transport::{
    AckPayload, ChannelTransport, ConnectionState, DeltaPayload, ErrorPayload, MessageKind,
    SubscribePayload, SyncRequestPayload, SyncResponsePayload, Transport, TransportMessage,
};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
