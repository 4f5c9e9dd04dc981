//! Top-level client entry point.
//!
//! Owns the sync manager and hands out document facades: a document is
//! created (and rehydrated from storage) on first reference, shared on
//! later references, and dropped only by explicit delete.

use std::sync::Arc;

use tokio::sync::Mutex;

use synckit_crdt::{ClientId, DocumentData};

use crate::config::SyncConfig;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::manager::SyncManager;
use crate::storage::StorageAdapter;
use crate::transport::Transport;

/// One replica's client: storage, transport, sync manager, and the
/// document registry. Instantiated per replica; configuration is passed
/// explicitly and nothing here is process-global.
pub struct SyncKit {
    client_id: ClientId,
    storage: Arc<dyn StorageAdapter>,
    manager: Arc<SyncManager>,
    open: Mutex<()>,
}

impl std::fmt::Debug for SyncKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncKit")
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl SyncKit {
    /// Build a client over host-supplied transport and storage.
    pub fn new(
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageAdapter>,
        config: SyncConfig,
    ) -> Result<Self> {
        let manager = SyncManager::new(client_id.clone(), transport, storage.clone(), config)?;
        Ok(Self {
            client_id,
            storage,
            manager,
            open: Mutex::new(()),
        })
    }

    /// Prepare the adapter and restore any persisted queue entries.
    pub async fn start(&self) -> Result<()> {
        self.storage.init().await?;
        self.manager.queue().load().await?;
        Ok(())
    }

    /// Owning replica.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The sync manager.
    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Get or create a document. The first reference creates the facade
    /// with the given initial variant, rehydrates it from storage, and
    /// registers it with the sync manager; later references return the
    /// same facade regardless of `initial`.
    pub async fn document(&self, id: &str, initial: DocumentData) -> Result<Arc<Document>> {
        // serialize first-reference races so two callers share one facade
        let _guard = self.open.lock().await;
        if let Some(existing) = self.manager.document(id) {
            return Ok(existing);
        }

        let document = Document::new(id, self.client_id.clone(), initial, self.storage.clone());
        document.hydrate().await?;
        self.manager.register(&document);
        Ok(document)
    }

    /// Drop a document for good: unsubscribe, deregister, and delete the
    /// persisted envelope.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        if self.manager.document(id).is_none() {
            return Err(SyncError::UnknownDocument(id.to_string()));
        }
        self.manager.unsubscribe(id).await?;
        self.manager.deregister(id);
        self.storage.delete(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    fn kit() -> (SyncKit, Arc<MemoryStorage>) {
        let storage = MemoryStorage::new();
        let (transport, _rx) = ChannelTransport::new();
        let kit = SyncKit::new(
            ClientId::new("A").unwrap(),
            transport,
            storage.clone(),
            SyncConfig::default(),
        )
        .unwrap();
        (kit, storage)
    }

    #[tokio::test]
    async fn test_document_created_on_first_reference() {
        let (kit, _storage) = kit();
        kit.start().await.unwrap();

        let first = kit.document("doc-1", DocumentData::new_map()).await.unwrap();
        first.set("k", json!(1)).await.unwrap();

        // second reference shares the same facade
        let second = kit.document("doc-1", DocumentData::new_counter()).await.unwrap();
        assert_eq!(second.get().as_map().unwrap()["k"], json!(1));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_first_reference_rehydrates() {
        let (kit, storage) = kit();
        {
            let doc = kit.document("doc-1", DocumentData::new_map()).await.unwrap();
            doc.set("saved", json!(true)).await.unwrap();
        }

        // a fresh client over the same storage sees the envelope
        let (transport, _rx) = ChannelTransport::new();
        let restarted = SyncKit::new(
            ClientId::new("A").unwrap(),
            transport,
            storage,
            SyncConfig::default(),
        )
        .unwrap();
        let doc = restarted
            .document("doc-1", DocumentData::new_map())
            .await
            .unwrap();
        assert_eq!(doc.get().as_map().unwrap()["saved"], json!(true));
    }

    #[tokio::test]
    async fn test_delete_document_removes_envelope() {
        let (kit, storage) = kit();
        let doc = kit.document("doc-1", DocumentData::new_map()).await.unwrap();
        doc.set("k", json!(1)).await.unwrap();
        assert!(storage.get("doc-1").await.unwrap().is_some());

        kit.delete_document("doc-1").await.unwrap();
        assert!(storage.get("doc-1").await.unwrap().is_none());
        assert!(kit.manager().document("doc-1").is_none());

        assert!(matches!(
            kit.delete_document("doc-1").await,
            Err(SyncError::UnknownDocument(_))
        ));
    }
}
