//! Per-client sync orchestrator.
//!
//! Registers documents, subscribes them over the transport, pushes local
//! operations with ACK tracking, applies remote deltas with LWW conflict
//! resolution, replays the offline queue on reconnection, and publishes
//! an observable sync state per document.
//!
//! Mutations never block on the network: a push that cannot complete
//! lands in the offline queue and the outcome surfaces through the
//! sync-state stream, not through the mutation return.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use synckit_crdt::{ClientId, ClockOrdering, Operation};

use crate::config::SyncConfig;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::queue::{ListenerHandle, OfflineQueue};
use crate::storage::StorageAdapter;
use crate::transport::{
    AckPayload, ConnectionState, DeltaPayload, ErrorPayload, MessageKind, SubscribePayload,
    SyncRequestPayload, SyncResponsePayload, Transport, TransportMessage,
};

/// Sync lifecycle of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Registered, not subscribed.
    #[default]
    Idle,
    /// Subscribe or sync-request in flight.
    Syncing,
    /// Subscribed and up to date at last contact.
    Synced,
    /// Transport is down; work is queued locally.
    Offline,
    /// Subscribe timed out or the transport failed.
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Observable sync state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentSyncState {
    /// Lifecycle phase.
    pub status: SyncStatus,
    /// Wall-clock milliseconds of the last confirmed exchange.
    pub last_synced_at: Option<u64>,
    /// Failure reason, when `status` is `Error`.
    pub error: Option<String>,
    /// Operations in flight or waiting in the offline queue.
    pub pending_operations: usize,
}

type StateListener = Arc<dyn Fn(&DocumentSyncState) + Send + Sync>;

struct PendingAck {
    operation: Operation,
    responder: oneshot::Sender<()>,
}

/// Per-client sync orchestrator. One instance per replica; shared via
/// `Arc` between the transport pump and the document facades.
pub struct SyncManager {
    client_id: ClientId,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    documents: RwLock<HashMap<String, Arc<Document>>>,
    subscriptions: RwLock<HashSet<String>>,
    states: Mutex<HashMap<String, DocumentSyncState>>,
    state_listeners: Mutex<HashMap<String, HashMap<Uuid, StateListener>>>,
    pending_acks: Mutex<HashMap<Uuid, PendingAck>>,
    pending_responses: Mutex<HashMap<String, oneshot::Sender<SyncResponsePayload>>>,
    outbound_tx: mpsc::UnboundedSender<Operation>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Operation>>>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("client_id", &self.client_id)
            .field("documents", &self.documents.read().len())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl SyncManager {
    /// Create a manager over the given transport and storage. The
    /// offline queue shares the storage adapter; call
    /// [`OfflineQueue::load`] through [`queue`](Self::queue) to restore
    /// persisted work.
    pub fn new(
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageAdapter>,
        config: SyncConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            client_id,
            queue: Arc::new(OfflineQueue::new(storage, config.clone())),
            config,
            transport,
            documents: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashSet::new()),
            states: Mutex::new(HashMap::new()),
            state_listeners: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }))
    }

    /// Owning replica.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Record a document and wire its operation sink into this manager.
    /// Sync state starts `idle`.
    pub fn register(&self, document: &Arc<Document>) {
        let id = document.id().to_string();
        document.set_op_sink(self.outbound_tx.clone());
        self.documents.write().insert(id.clone(), document.clone());
        self.update_state(&id, |_| {});
    }

    /// The registered document, if any.
    pub fn document(&self, document_id: &str) -> Option<Arc<Document>> {
        self.documents.read().get(document_id).cloned()
    }

    /// Forget a document: drop its registration, subscription, and sync
    /// state. The persisted envelope is untouched; deleting it is the
    /// owner's call.
    pub fn deregister(&self, document_id: &str) {
        self.documents.write().remove(document_id);
        self.subscriptions.write().remove(document_id);
        self.states.lock().remove(document_id);
        self.state_listeners.lock().remove(document_id);
    }

    /// Drive operations committed by document facades into
    /// [`push`](Self::push). Spawn once after registering documents.
    pub fn spawn_outbound(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let rx = self.outbound_rx.lock().take();
        let manager = self.clone();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                tracing::warn!("outbound pump already running");
                return;
            };
            while let Some(op) = rx.recv().await {
                if let Err(err) = manager.push(op).await {
                    tracing::warn!(%err, "failed to push local operation");
                }
            }
        })
    }

    /// Subscribe a registered document: announce interest, await the
    /// server's `sync_response` (merged through the CRDT), and mark the
    /// document `synced`. A timeout or send failure is recovered locally
    /// and surfaces through the sync state.
    pub async fn subscribe(&self, document_id: &str) -> Result<()> {
        if self.document(document_id).is_none() {
            return Err(SyncError::UnknownDocument(document_id.to_string()));
        }
        self.sync_round(document_id, MessageKind::Subscribe).await
    }

    /// Drop interest in a document. The wire notice is best-effort when
    /// disconnected; state returns to `idle`.
    pub async fn unsubscribe(&self, document_id: &str) -> Result<()> {
        if !self.subscriptions.write().remove(document_id) {
            return Ok(());
        }
        if self.transport.is_connected() {
            let msg = TransportMessage::new(
                MessageKind::Unsubscribe,
                &SubscribePayload {
                    document_id: document_id.to_string(),
                },
            )?;
            if let Err(err) = self.transport.send(msg).await {
                tracing::debug!(%err, document = %document_id, "unsubscribe notice not delivered");
            }
        }
        self.update_state(document_id, |state| {
            state.status = SyncStatus::Idle;
            state.error = None;
        });
        Ok(())
    }

    /// Ask the server for current state and merge the answer.
    pub async fn request_sync(&self, document_id: &str) -> Result<()> {
        if self.document(document_id).is_none() {
            return Err(SyncError::UnknownDocument(document_id.to_string()));
        }
        self.sync_round(document_id, MessageKind::SyncRequest).await
    }

    /// Deliver one operation. Connected: send a `delta` and await its
    /// ACK; on timeout or send failure the operation moves to the
    /// offline queue. Disconnected: queue immediately. Either way the
    /// caller sees `Ok` unless the queue itself is full.
    pub async fn push(&self, op: Operation) -> Result<()> {
        let document_id = op.document_id.clone();

        if !self.transport.is_connected() {
            self.queue.enqueue(op).await?;
            self.update_state(&document_id, |_| {});
            return Ok(());
        }

        match self.push_now(op.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(%err, document = %document_id, "delta not confirmed; queueing for retry");
                self.queue.enqueue(op).await?;
                self.update_state(&document_id, |_| {});
                Ok(())
            }
        }
    }

    /// Send one delta and await its ACK, with no queue fallback. Used
    /// directly as the offline queue's replay sender.
    pub async fn push_now(&self, op: Operation) -> Result<()> {
        let message_id = Uuid::new_v4();
        let payload = DeltaPayload {
            message_id,
            operation: op.clone(),
        };
        let msg = TransportMessage::new(MessageKind::Delta, &payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().insert(
            message_id,
            PendingAck {
                operation: op.clone(),
                responder: tx,
            },
        );
        self.update_state(&op.document_id, |_| {});

        if let Err(err) = self.transport.send(msg).await {
            self.pending_acks.lock().remove(&message_id);
            self.update_state(&op.document_id, |_| {});
            return Err(err);
        }

        let outcome = timeout(self.config.ack_timeout, rx).await;
        // clear the pending entry before returning, win or lose
        self.pending_acks.lock().remove(&message_id);

        match outcome {
            Ok(Ok(())) => {
                self.update_state(&op.document_id, |state| {
                    state.last_synced_at = Some(crate::now_ms());
                });
                Ok(())
            }
            Ok(Err(_)) => {
                self.update_state(&op.document_id, |_| {});
                Err(SyncError::Timeout(format!("ack for delta {message_id} (cancelled)")))
            }
            Err(_) => {
                self.update_state(&op.document_id, |_| {});
                Err(SyncError::Timeout(format!("ack for delta {message_id}")))
            }
        }
    }

    /// Feed one inbound transport message. Malformed payloads are logged
    /// and dropped; deltas for unregistered documents warn only.
    pub async fn handle_incoming(&self, message: TransportMessage) {
        match message.kind {
            MessageKind::Ack => match message.parse_payload::<AckPayload>() {
                Ok(payload) => {
                    if let Some(pending) = self.pending_acks.lock().remove(&payload.message_id) {
                        let _ = pending.responder.send(());
                    } else {
                        tracing::debug!(message_id = %payload.message_id, "ack for unknown delta");
                    }
                }
                Err(err) => tracing::warn!(%err, "dropping malformed ack"),
            },
            MessageKind::Delta => match message.parse_payload::<DeltaPayload>() {
                Ok(payload) => self.apply_remote_delta(payload.operation).await,
                Err(err) => tracing::warn!(%err, "dropping malformed delta"),
            },
            MessageKind::SyncResponse => match message.parse_payload::<SyncResponsePayload>() {
                Ok(payload) => {
                    let waiter = self.pending_responses.lock().remove(&payload.document_id);
                    let unclaimed = match waiter {
                        Some(tx) => tx.send(payload).err(),
                        None => Some(payload),
                    };
                    if let Some(payload) = unclaimed {
                        // unsolicited or the waiter gave up: merge anyway
                        if let Err(err) = self.adopt_sync_response(&payload).await {
                            tracing::warn!(%err, document = %payload.document_id, "failed to merge sync response");
                        } else {
                            self.update_state(&payload.document_id, |state| {
                                state.last_synced_at = Some(crate::now_ms());
                            });
                        }
                    }
                }
                Err(err) => tracing::warn!(%err, "dropping malformed sync response"),
            },
            MessageKind::Error => match message.parse_payload::<ErrorPayload>() {
                Ok(payload) => {
                    tracing::warn!(message = %payload.message, "server reported error");
                    if let Some(document_id) = payload.document_id {
                        self.update_state(&document_id, |state| {
                            state.status = SyncStatus::Error;
                            state.error = Some(payload.message.clone());
                        });
                    }
                }
                Err(err) => tracing::warn!(%err, "dropping malformed error message"),
            },
            other => {
                tracing::warn!(kind = ?other, "unexpected inbound message kind");
            }
        }
    }

    /// React to a transport connectivity change.
    pub fn handle_connection_change(self: &Arc<Self>, state: ConnectionState) {
        tracing::info!(%state, "connection state changed");
        match state {
            ConnectionState::Connected => {
                let subscribed: Vec<String> =
                    self.subscriptions.read().iter().cloned().collect();
                for id in &subscribed {
                    self.update_state(id, |state| {
                        state.status = SyncStatus::Syncing;
                        state.error = None;
                    });
                }
                let manager = self.clone();
                tokio::spawn(async move {
                    for id in subscribed {
                        if let Err(err) = manager.sync_round(&id, MessageKind::Subscribe).await {
                            tracing::warn!(%err, document = %id, "re-subscribe failed");
                        }
                    }
                    let replayed = manager
                        .queue
                        .replay(|op| {
                            let manager = manager.clone();
                            async move { manager.push_now(op).await }
                        })
                        .await;
                    match replayed {
                        Ok(count) if count > 0 => {
                            tracing::info!(count, "replayed offline queue");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(%err, "offline queue replay failed"),
                    }
                });
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                for id in self.subscribed_ids() {
                    self.update_state(&id, |state| {
                        state.status = SyncStatus::Offline;
                    });
                }
            }
            ConnectionState::Failed => {
                for id in self.subscribed_ids() {
                    self.update_state(&id, |state| {
                        state.status = SyncStatus::Error;
                        state.error = Some("Connection failed".to_string());
                    });
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Current sync state of a document.
    pub fn sync_state(&self, document_id: &str) -> Option<DocumentSyncState> {
        self.states.lock().get(document_id).cloned()
    }

    /// Observe a document's sync state. The listener fires immediately
    /// with the current state and after every change.
    pub fn on_sync_state(
        &self,
        document_id: &str,
        listener: impl Fn(&DocumentSyncState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = Uuid::new_v4();
        let listener: StateListener = Arc::new(listener);
        listener(&self.sync_state(document_id).unwrap_or_default());
        self.state_listeners
            .lock()
            .entry(document_id.to_string())
            .or_default()
            .insert(id, listener);
        ListenerHandle(id)
    }

    /// Unregister a sync-state listener.
    pub fn remove_sync_listener(&self, document_id: &str, handle: ListenerHandle) {
        if let Some(listeners) = self.state_listeners.lock().get_mut(document_id) {
            listeners.remove(&handle.0);
        }
    }

    /// Cancel every pending ACK and sync-response wait. Cancelled pushes
    /// observe the cancellation and queue their operations.
    pub fn shutdown(&self) {
        self.pending_acks.lock().clear();
        self.pending_responses.lock().clear();
    }

    // ---- internals ----

    async fn sync_round(&self, document_id: &str, kind: MessageKind) -> Result<()> {
        self.update_state(document_id, |state| {
            state.status = SyncStatus::Syncing;
            state.error = None;
        });

        let msg = match kind {
            MessageKind::Subscribe => TransportMessage::new(
                kind,
                &SubscribePayload {
                    document_id: document_id.to_string(),
                },
            )?,
            _ => TransportMessage::new(
                kind,
                &SyncRequestPayload {
                    document_id: document_id.to_string(),
                },
            )?,
        };

        let (tx, rx) = oneshot::channel();
        self.pending_responses
            .lock()
            .insert(document_id.to_string(), tx);

        if let Err(err) = self.transport.send(msg).await {
            self.pending_responses.lock().remove(document_id);
            tracing::warn!(%err, document = %document_id, "sync round send failed");
            self.update_state(document_id, |state| {
                state.status = SyncStatus::Offline;
                state.error = Some(err.to_string());
            });
            return Ok(());
        }

        let outcome = timeout(self.config.sync_response_timeout, rx).await;
        self.pending_responses.lock().remove(document_id);

        match outcome {
            Ok(Ok(response)) => {
                if let Err(err) = self.adopt_sync_response(&response).await {
                    tracing::warn!(%err, document = %document_id, "failed to merge sync response");
                    self.update_state(document_id, |state| {
                        state.status = SyncStatus::Error;
                        state.error = Some(err.to_string());
                    });
                    return Ok(());
                }
                if kind == MessageKind::Subscribe {
                    self.subscriptions.write().insert(document_id.to_string());
                }
                self.update_state(document_id, |state| {
                    state.status = SyncStatus::Synced;
                    state.last_synced_at = Some(crate::now_ms());
                    state.error = None;
                });
                Ok(())
            }
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(document = %document_id, "timed out waiting for sync response");
                self.update_state(document_id, |state| {
                    state.status = SyncStatus::Error;
                    state.error = Some("sync response timeout".to_string());
                });
                Ok(())
            }
        }
    }

    async fn adopt_sync_response(&self, response: &SyncResponsePayload) -> Result<()> {
        let Some(document) = self.document(&response.document_id) else {
            tracing::warn!(document = %response.document_id, "sync response for unknown document");
            return Ok(());
        };
        if let Some(state) = &response.state {
            document
                .merge_remote_state(state, response.clock.as_ref())
                .await?;
        } else if let Some(clock) = &response.clock {
            document.set_clock(document.clock().merged(clock));
        }
        Ok(())
    }

    async fn apply_remote_delta(&self, op: Operation) {
        let Some(document) = self.document(&op.document_id) else {
            tracing::warn!(document = %op.document_id, "delta for unknown document");
            return;
        };

        // Pair the delta with locally pending work on the same target.
        // Causally ordered clocks resolve strictly; the pending local op
        // stays in the delivery pipeline either way, which is what
        // re-sends the loser. Concurrent pairs fall through to the LWW
        // tiebreak inside the CRDT.
        for local in self.local_conflicts(&op) {
            match op.clock.compare(&local.clock) {
                ClockOrdering::Concurrent => {
                    let remote_wins =
                        (op.timestamp, &op.client_id) > (local.timestamp, &local.client_id);
                    let winner = if remote_wins { "remote" } else { "local" };
                    tracing::info!(
                        document = %op.document_id,
                        field = %op.kind.field_key(),
                        winner,
                        "concurrent update resolved by (timestamp, client)"
                    );
                }
                ClockOrdering::After => {
                    tracing::info!(
                        document = %op.document_id,
                        field = %op.kind.field_key(),
                        "remote update supersedes pending local operation"
                    );
                }
                _ => {}
            }
        }

        match document.apply_remote(&op).await {
            Ok(_) => {
                self.update_state(&op.document_id, |state| {
                    state.last_synced_at = Some(crate::now_ms());
                });
            }
            Err(err) => {
                tracing::warn!(%err, document = %op.document_id, "dropping inapplicable delta");
            }
        }
    }

    fn local_conflicts(&self, op: &Operation) -> Vec<Operation> {
        let mut conflicts: Vec<Operation> = self
            .pending_acks
            .lock()
            .values()
            .map(|pending| pending.operation.clone())
            .collect();
        conflicts.extend(self.queue.pending_for(&op.document_id));
        conflicts.retain(|local| {
            local.document_id == op.document_id
                && local.kind.name() == op.kind.name()
                && local.kind.field_key() == op.kind.field_key()
                && local.client_id != op.client_id
        });
        conflicts
    }

    fn subscribed_ids(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    fn pending_count(&self, document_id: &str) -> usize {
        let in_flight = self
            .pending_acks
            .lock()
            .values()
            .filter(|pending| pending.operation.document_id == document_id)
            .count();
        in_flight + self.queue.pending_for(document_id).len()
    }

    fn update_state(&self, document_id: &str, f: impl FnOnce(&mut DocumentSyncState)) {
        let pending = self.pending_count(document_id);
        let snapshot = {
            let mut states = self.states.lock();
            let entry = states.entry(document_id.to_string()).or_default();
            f(entry);
            entry.pending_operations = pending;
            entry.clone()
        };

        let listeners: Vec<StateListener> = self
            .state_listeners
            .lock()
            .get(document_id)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::error!(document = %document_id, "sync state listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::ChannelTransport;
    use serde_json::json;
    use synckit_crdt::DocumentData;

    fn client(name: &str) -> ClientId {
        ClientId::new(name).unwrap()
    }

    fn manager_with_doc(
        doc_id: &str,
    ) -> (
        Arc<SyncManager>,
        Arc<Document>,
        Arc<ChannelTransport>,
        mpsc::UnboundedReceiver<TransportMessage>,
        Arc<MemoryStorage>,
    ) {
        let storage = MemoryStorage::new();
        let (transport, rx) = ChannelTransport::new();
        let manager = SyncManager::new(
            client("A"),
            transport.clone(),
            storage.clone(),
            SyncConfig::default(),
        )
        .unwrap();
        let doc = Document::new(doc_id, client("A"), DocumentData::new_map(), storage.clone());
        manager.register(&doc);
        (manager, doc, transport, rx, storage)
    }

    fn ack_for(msg: &TransportMessage) -> TransportMessage {
        let delta: DeltaPayload = msg.parse_payload().unwrap();
        TransportMessage::new(
            MessageKind::Ack,
            &AckPayload {
                message_id: delta.message_id,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_starts_idle() {
        let (manager, _doc, _transport, _rx, _storage) = manager_with_doc("doc-1");
        let state = manager.sync_state("doc-1").unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.pending_operations, 0);
    }

    #[tokio::test]
    async fn test_subscribe_round_trip() {
        let (manager, _doc, _transport, mut rx, _storage) = manager_with_doc("doc-1");

        let subscriber = async {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.kind, MessageKind::Subscribe);
            let payload: SubscribePayload = msg.parse_payload().unwrap();
            assert_eq!(payload.document_id, "doc-1");

            let response = TransportMessage::new(
                MessageKind::SyncResponse,
                &SyncResponsePayload {
                    document_id: "doc-1".into(),
                    state: None,
                    clock: None,
                },
            )
            .unwrap();
            manager.handle_incoming(response).await;
        };

        let (result, ()) = tokio::join!(manager.subscribe("doc-1"), subscriber);
        result.unwrap();

        let state = manager.sync_state("doc-1").unwrap();
        assert_eq!(state.status, SyncStatus::Synced);
        assert!(state.last_synced_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout_sets_error_state() {
        let (manager, _doc, _transport, _rx, _storage) = manager_with_doc("doc-1");

        manager.subscribe("doc-1").await.unwrap();

        let state = manager.sync_state("doc-1").unwrap();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.error.as_deref(), Some("sync response timeout"));
        // no leaked waiter
        assert!(manager.pending_responses.lock().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_document_fails() {
        let (manager, _doc, _transport, _rx, _storage) = manager_with_doc("doc-1");
        assert!(matches!(
            manager.subscribe("nope").await,
            Err(SyncError::UnknownDocument(_))
        ));
    }

    #[tokio::test]
    async fn test_push_with_ack_confirms() {
        let (manager, doc, _transport, mut rx, _storage) = manager_with_doc("doc-1");
        let op = doc.set("k", json!(1)).await.unwrap();

        let responder = async {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.kind, MessageKind::Delta);
            manager.handle_incoming(ack_for(&msg)).await;
        };

        let (result, ()) = tokio::join!(manager.push(op), responder);
        result.unwrap();

        let state = manager.sync_state("doc-1").unwrap();
        assert!(state.last_synced_at.is_some());
        assert_eq!(state.pending_operations, 0);
        assert_eq!(manager.queue().stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_without_ack_queues() {
        let (manager, doc, _transport, mut rx, _storage) = manager_with_doc("doc-1");
        let op = doc.set("x", json!("y")).await.unwrap();

        manager.push(op).await.unwrap();

        // the delta went out but no ACK ever came
        assert_eq!(rx.recv().await.unwrap().kind, MessageKind::Delta);
        assert_eq!(manager.queue().stats().pending, 1);
        let state = manager.sync_state("doc-1").unwrap();
        assert_eq!(state.pending_operations, 1);
        assert!(manager.pending_acks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_push_while_disconnected_queues_without_sending() {
        let (manager, doc, transport, mut rx, _storage) = manager_with_doc("doc-1");
        transport.set_connected(false);

        let op = doc.set("x", json!(1)).await.unwrap();
        manager.push(op).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(manager.queue().stats().pending, 1);
    }

    #[tokio::test]
    async fn test_remote_delta_applies_and_touches_state() {
        let (manager, doc, _transport, _rx, _storage) = manager_with_doc("doc-1");

        let remote = Document::new(
            "doc-1",
            client("B"),
            DocumentData::new_map(),
            MemoryStorage::new(),
        );
        let op = remote.set("title", json!("from-b")).await.unwrap();

        let msg = TransportMessage::new(
            MessageKind::Delta,
            &DeltaPayload {
                message_id: Uuid::new_v4(),
                operation: op,
            },
        )
        .unwrap();
        manager.handle_incoming(msg).await;

        assert_eq!(doc.get().as_map().unwrap()["title"], json!("from-b"));
        assert!(manager.sync_state("doc-1").unwrap().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_delta_for_unknown_document_is_warning_only() {
        let (manager, _doc, _transport, _rx, _storage) = manager_with_doc("doc-1");

        let remote = Document::new(
            "ghost",
            client("B"),
            DocumentData::new_map(),
            MemoryStorage::new(),
        );
        let op = remote.set("k", json!(1)).await.unwrap();
        let msg = TransportMessage::new(
            MessageKind::Delta,
            &DeltaPayload {
                message_id: Uuid::new_v4(),
                operation: op,
            },
        )
        .unwrap();
        // must not panic or surface an error
        manager.handle_incoming(msg).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (manager, doc, _transport, _rx, _storage) = manager_with_doc("doc-1");
        let before = doc.get();

        let msg = TransportMessage {
            kind: MessageKind::Delta,
            payload: json!({ "not": "a delta" }),
            timestamp: 0,
        };
        manager.handle_incoming(msg).await;

        assert_eq!(doc.get(), before);
    }

    #[tokio::test]
    async fn test_connection_loss_marks_subscriptions_offline() {
        let (manager, _doc, _transport, mut rx, _storage) = manager_with_doc("doc-1");

        let subscriber = async {
            let _ = rx.recv().await.unwrap();
            let response = TransportMessage::new(
                MessageKind::SyncResponse,
                &SyncResponsePayload {
                    document_id: "doc-1".into(),
                    state: None,
                    clock: None,
                },
            )
            .unwrap();
            manager.handle_incoming(response).await;
        };
        let (result, ()) = tokio::join!(manager.subscribe("doc-1"), subscriber);
        result.unwrap();

        manager.handle_connection_change(ConnectionState::Disconnected);
        assert_eq!(
            manager.sync_state("doc-1").unwrap().status,
            SyncStatus::Offline
        );

        manager.handle_connection_change(ConnectionState::Failed);
        let state = manager.sync_state("doc-1").unwrap();
        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.error.as_deref(), Some("Connection failed"));
    }

    #[tokio::test]
    async fn test_sync_state_listener_fires_immediately_and_on_change() {
        let (manager, _doc, transport, _rx, _storage) = manager_with_doc("doc-1");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_sync_state("doc-1", move |state| sink.lock().push(state.clone()));
        assert_eq!(seen.lock().len(), 1);

        transport.set_connected(false);
        let remote = Document::new(
            "doc-1",
            client("A"),
            DocumentData::new_map(),
            MemoryStorage::new(),
        );
        let op = remote.set("k", json!(1)).await.unwrap();
        manager.push(op).await.unwrap();

        assert_eq!(seen.lock().last().unwrap().pending_operations, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_returns_to_idle() {
        let (manager, _doc, _transport, mut rx, _storage) = manager_with_doc("doc-1");

        let subscriber = async {
            let _ = rx.recv().await.unwrap();
            let response = TransportMessage::new(
                MessageKind::SyncResponse,
                &SyncResponsePayload {
                    document_id: "doc-1".into(),
                    state: None,
                    clock: None,
                },
            )
            .unwrap();
            manager.handle_incoming(response).await;
        };
        let (result, ()) = tokio::join!(manager.subscribe("doc-1"), subscriber);
        result.unwrap();

        manager.unsubscribe("doc-1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, MessageKind::Unsubscribe);
        assert_eq!(manager.sync_state("doc-1").unwrap().status, SyncStatus::Idle);
    }
}
