//! Persistence adapter interface.
//!
//! The host supplies a key-value blob store; the core treats values as
//! opaque serialized envelopes. The offline queue and the document
//! facade write disjoint keyspaces: queue entries under `queue:<id>`,
//! dead-lettered entries under `queue:failed:<id>`, and document
//! envelopes under their document id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Key prefixes reserved by the core.
pub mod keys {
    /// Prefix for pending queue entries.
    pub const QUEUE_PREFIX: &str = "queue:";
    /// Prefix for dead-lettered queue entries.
    pub const FAILED_PREFIX: &str = "queue:failed:";

    /// Storage key for a pending queue entry.
    pub fn queue_entry(id: &uuid::Uuid) -> String {
        format!("{QUEUE_PREFIX}{id}")
    }

    /// Storage key for a dead-lettered queue entry.
    pub fn failed_entry(id: &uuid::Uuid) -> String {
        format!("{FAILED_PREFIX}{id}")
    }

    /// True for pending queue keys (dead-letter keys excluded).
    pub fn is_queue_key(key: &str) -> bool {
        key.starts_with(QUEUE_PREFIX) && !key.starts_with(FAILED_PREFIX)
    }

    /// True for dead-letter keys.
    pub fn is_failed_key(key: &str) -> bool {
        key.starts_with(FAILED_PREFIX)
    }
}

/// Host-supplied key-value blob store.
///
/// Implementations must make a completed `set` visible to any later
/// `get` on the same adapter, including from a fresh client instance;
/// the offline queue's durability guarantee is built on that.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the store for use.
    async fn init(&self) -> Result<()>;

    /// Read a value, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a value; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All stored keys.
    async fn list(&self) -> Result<Vec<String>>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;
}

/// In-memory reference adapter. Shared via `Arc` so a "restarted" client
/// can be built over the same storage in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}
