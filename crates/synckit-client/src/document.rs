//! Per-document facade: the user-visible mutation surface.
//!
//! The CRDT state, not the cached view, is authoritative. Every local
//! mutation runs the same sequence: tick the replica's clock, apply the
//! operation to the CRDT, recompute the cached view, persist the
//! envelope, notify subscribers, and hand the operation to the sync
//! manager. Persistence happens before any side effect is observable, so
//! a crash mid-sequence leaves storage consistent and a restarted client
//! rehydrates to the last committed state.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use synckit_crdt::{
    ClientId, CrdtError, DocumentData, DocumentView, NodeId, Operation, OperationKind, Tag,
    VectorClock,
};

use crate::error::{Result, SyncError};
use crate::queue::ListenerHandle;
use crate::storage::StorageAdapter;

/// The persisted unit: CRDT state plus causal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEnvelope {
    /// Document id, also the storage key.
    pub id: String,
    /// Authoritative CRDT state.
    pub data: DocumentData,
    /// The replica's clock at the last committed mutation.
    pub version: VectorClock,
    /// Wall-clock milliseconds of the last committed mutation.
    pub updated_at: u64,
}

type Subscriber = Arc<dyn Fn(&DocumentView) + Send + Sync>;

struct DocState {
    data: DocumentData,
    clock: VectorClock,
    view: DocumentView,
    notifying: bool,
}

/// One replicated document owned by this replica.
pub struct Document {
    id: String,
    client_id: ClientId,
    storage: Arc<dyn StorageAdapter>,
    inner: Mutex<DocState>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    op_sink: Mutex<Option<mpsc::UnboundedSender<Operation>>>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl Document {
    /// Create a document with fresh state. Call
    /// [`hydrate`](Self::hydrate) to restore a persisted envelope.
    pub fn new(
        id: impl Into<String>,
        client_id: ClientId,
        data: DocumentData,
        storage: Arc<dyn StorageAdapter>,
    ) -> Arc<Self> {
        let view = data.view();
        Arc::new(Self {
            id: id.into(),
            client_id,
            storage,
            inner: Mutex::new(DocState {
                data,
                clock: VectorClock::new(),
                view,
                notifying: false,
            }),
            subscribers: Mutex::new(HashMap::new()),
            op_sink: Mutex::new(None),
        })
    }

    /// Document id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning replica.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Current cached view.
    pub fn get(&self) -> DocumentView {
        self.inner.lock().view.clone()
    }

    /// Current clock.
    pub fn clock(&self) -> VectorClock {
        self.inner.lock().clock.clone()
    }

    /// Replace the clock. Used when adopting server-supplied causal
    /// state; normal mutation goes through the tick in `commit`.
    pub fn set_clock(&self, clock: VectorClock) {
        self.inner.lock().clock = clock;
    }

    /// Restore state from the persisted envelope, if one exists.
    /// Malformed blobs fail with a format error and leave the current
    /// state untouched.
    pub async fn hydrate(&self) -> Result<bool> {
        let Some(bytes) = self
            .storage
            .get(&self.id)
            .await
            .map_err(into_storage_err)?
        else {
            return Ok(false);
        };
        self.load(&bytes)?;
        self.notify_subscribers();
        Ok(true)
    }

    /// Serialize the current envelope.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let envelope = DocumentEnvelope {
            id: self.id.clone(),
            data: inner.data.clone(),
            version: inner.clock.clone(),
            updated_at: crate::now_ms(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Replace state from a serialized envelope.
    pub fn load(&self, bytes: &[u8]) -> Result<()> {
        let envelope: DocumentEnvelope = serde_json::from_slice(bytes)?;
        if envelope.id != self.id {
            return Err(SyncError::Format(format!(
                "envelope is for document '{}', not '{}'",
                envelope.id, self.id
            )));
        }
        let mut inner = self.inner.lock();
        inner.view = envelope.data.view();
        inner.data = envelope.data;
        inner.clock = envelope.version;
        Ok(())
    }

    // ---- map surface ----

    /// Write a field of a map document.
    pub async fn set(&self, field: impl Into<String>, value: Value) -> Result<Operation> {
        let field = field.into();
        self.commit(move |_, _| {
            Ok(OperationKind::Set { field, value })
        })
        .await
    }

    /// Tombstone a field of a map document.
    pub async fn delete(&self, field: impl Into<String>) -> Result<Operation> {
        let field = field.into();
        self.commit(move |_, _| Ok(OperationKind::Delete { field })).await
    }

    // ---- text surface ----

    /// Insert a character at a visible index of a text document.
    pub async fn insert(&self, index: usize, character: char) -> Result<Operation> {
        let client = self.client_id.clone();
        self.commit(move |data, seq| match data {
            DocumentData::Text(text) => {
                Ok(text.prepare_insert(index, character, NodeId::new(client, seq)))
            }
            other => Err(mismatch("text-insert", other)),
        })
        .await
    }

    /// Tombstone `length` visible characters of a text document starting
    /// at `start`. Ranges past the end are truncated.
    pub async fn delete_range(&self, start: usize, length: usize) -> Result<Operation> {
        self.commit(move |data, _| match data {
            DocumentData::Text(text) => Ok(text.prepare_delete(start, length)),
            other => Err(mismatch("text-delete", other)),
        })
        .await
    }

    // ---- counter surface ----

    /// Increment a counter document.
    pub async fn increment(&self, delta: u64) -> Result<Operation> {
        let delta = i64::try_from(delta)
            .map_err(|_| SyncError::Invariant("counter delta exceeds i64".into()))?;
        self.commit(move |_, _| Ok(OperationKind::CounterAdd { delta })).await
    }

    /// Decrement a counter document.
    pub async fn decrement(&self, delta: u64) -> Result<Operation> {
        let delta = i64::try_from(delta)
            .map_err(|_| SyncError::Invariant("counter delta exceeds i64".into()))?;
        self.commit(move |_, _| Ok(OperationKind::CounterAdd { delta: -delta }))
            .await
    }

    /// Reset a counter document by issuing a local decrement equal to the
    /// currently observed value. Lossy by design: a concurrent remote
    /// increment survives the reset. Prefer computing a target value and
    /// applying the delta.
    pub async fn reset(&self) -> Result<Operation> {
        self.commit(move |data, _| match data {
            DocumentData::Counter(counter) => Ok(OperationKind::CounterAdd {
                delta: -counter.value(),
            }),
            other => Err(mismatch("counter-add", other)),
        })
        .await
    }

    // ---- set surface ----

    /// Add an element to a set document under a fresh tag.
    pub async fn add(&self, element: Value) -> Result<Operation> {
        let client = self.client_id.clone();
        self.commit(move |_, seq| {
            Ok(OperationKind::SetAdd {
                element,
                tag: Tag::new(client, seq),
            })
        })
        .await
    }

    /// Remove an element from a set document by retiring its observed
    /// tags.
    pub async fn remove(&self, element: Value) -> Result<Operation> {
        self.commit(move |data, _| match data {
            DocumentData::Set(set) => Ok(set.prepare_remove(element)),
            other => Err(mismatch("set-remove", other)),
        })
        .await
    }

    // ---- replication surface ----

    /// Apply an operation from another replica: integrate into the CRDT,
    /// merge the clock, persist, and notify. Idempotent: an operation
    /// whose clock the document already dominates is a no-op.
    pub async fn apply_remote(&self, op: &Operation) -> Result<bool> {
        let (changed, bytes) = {
            let mut inner = self.inner.lock();
            if inner.notifying {
                return Err(SyncError::Invariant(
                    "mutation during change notification".into(),
                ));
            }
            if inner.clock.dominates(&op.clock) {
                tracing::debug!(document = %self.id, "dropping already-observed operation");
                return Ok(false);
            }
            let changed = inner.data.apply_remote(op)?;
            inner.clock = inner.clock.merged(&op.clock);
            inner.view = inner.data.view();
            (changed, self.envelope_bytes(&inner, op.timestamp)?)
        };

        self.storage
            .set(&self.id, bytes)
            .await
            .map_err(into_storage_err)?;
        if changed {
            self.notify_subscribers();
        }
        Ok(changed)
    }

    /// Merge a full peer state (from a `sync_response`) through the CRDT
    /// merge, never wholesale replacement.
    pub async fn merge_remote_state(
        &self,
        state: &DocumentData,
        clock: Option<&VectorClock>,
    ) -> Result<()> {
        let bytes = {
            let mut inner = self.inner.lock();
            if inner.notifying {
                return Err(SyncError::Invariant(
                    "mutation during change notification".into(),
                ));
            }
            inner.data.merge(state)?;
            if let Some(clock) = clock {
                inner.clock = inner.clock.merged(clock);
            }
            inner.view = inner.data.view();
            self.envelope_bytes(&inner, crate::now_ms())?
        };

        self.storage
            .set(&self.id, bytes)
            .await
            .map_err(into_storage_err)?;
        self.notify_subscribers();
        Ok(())
    }

    /// Register a change subscriber. It is invoked immediately with the
    /// current view and synchronously after every change; a panicking
    /// subscriber does not prevent the others from running.
    pub fn subscribe(&self, callback: impl Fn(&DocumentView) + Send + Sync + 'static) -> ListenerHandle {
        let id = Uuid::new_v4();
        let callback: Subscriber = Arc::new(callback);
        callback(&self.get());
        self.subscribers.lock().insert(id, callback);
        ListenerHandle(id)
    }

    /// Unregister a change subscriber.
    pub fn unsubscribe(&self, handle: ListenerHandle) {
        self.subscribers.lock().remove(&handle.0);
    }

    /// Install the sync manager's operation sink. Every committed local
    /// mutation is forwarded into it.
    pub fn set_op_sink(&self, sink: mpsc::UnboundedSender<Operation>) {
        *self.op_sink.lock() = Some(sink);
    }

    // ---- internals ----

    /// The local mutation sequence: reject reentrant calls, tick the
    /// clock, build and apply the operation, recompute the view, persist
    /// the envelope, notify, forward to the sync manager.
    async fn commit(
        &self,
        build: impl FnOnce(&DocumentData, u64) -> Result<OperationKind>,
    ) -> Result<Operation> {
        let (op, bytes) = {
            let mut inner = self.inner.lock();
            if inner.notifying {
                return Err(SyncError::Invariant(
                    "mutation during change notification".into(),
                ));
            }
            let clock = inner.clock.ticked(&self.client_id);
            let kind = build(&inner.data, clock.get(&self.client_id))?;
            let op = Operation {
                document_id: self.id.clone(),
                kind,
                clock: clock.clone(),
                client_id: self.client_id.clone(),
                timestamp: crate::now_ms(),
            };
            inner.data.apply_local(&op)?;
            inner.clock = clock;
            inner.view = inner.data.view();
            let bytes = self.envelope_bytes(&inner, op.timestamp)?;
            (op, bytes)
        };

        self.storage
            .set(&self.id, bytes)
            .await
            .map_err(into_storage_err)?;
        self.notify_subscribers();
        self.forward(&op);
        Ok(op)
    }

    fn envelope_bytes(&self, inner: &DocState, updated_at: u64) -> Result<Vec<u8>> {
        let envelope = DocumentEnvelope {
            id: self.id.clone(),
            data: inner.data.clone(),
            version: inner.clock.clone(),
            updated_at,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn notify_subscribers(&self) {
        self.inner.lock().notifying = true;
        let view = self.inner.lock().view.clone();
        let subscribers: Vec<Subscriber> = self.subscribers.lock().values().cloned().collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&view))).is_err() {
                tracing::error!(document = %self.id, "document subscriber panicked");
            }
        }
        self.inner.lock().notifying = false;
    }

    fn forward(&self, op: &Operation) {
        if let Some(sink) = self.op_sink.lock().as_ref() {
            if sink.send(op.clone()).is_err() {
                tracing::debug!(document = %self.id, "operation sink closed; sync manager gone");
            }
        }
    }
}

fn mismatch(op: &'static str, doc: &DocumentData) -> SyncError {
    SyncError::Crdt(CrdtError::KindMismatch {
        op,
        doc: doc.kind_name(),
    })
}

fn into_storage_err(err: SyncError) -> SyncError {
    match err {
        SyncError::Storage(_) => err,
        other => SyncError::Storage(other.to_string()),
    }
}
