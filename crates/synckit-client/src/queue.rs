//! Durable offline operation queue.
//!
//! Strict FIFO of operations awaiting delivery. Every enqueue, retry
//! update, dead-letter transition, and removal is flushed through the
//! persistence adapter before being acknowledged, so a client restarted
//! offline resumes with the same pending work. Replay walks the queue in
//! order with exponential backoff and moves entries that exhaust their
//! retry budget to the dead-letter queue instead of dropping them.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::Future;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use synckit_crdt::Operation;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::storage::{keys, StorageAdapter};

/// An operation plus its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Queue entry id, also the storage key suffix.
    pub id: Uuid,
    /// The pending operation.
    pub operation: Operation,
    /// Delivery attempts so far.
    pub retries: u32,
    /// Wall-clock milliseconds at enqueue; the reload sort key.
    pub enqueued_at: u64,
}

/// Point-in-time queue counters pushed to change listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Entries awaiting delivery.
    pub pending: usize,
    /// Dead-lettered entries.
    pub failed: usize,
    /// Entries currently handed to a sender.
    pub in_flight: usize,
    /// Enqueue time of the head entry, `None` when the queue is empty.
    pub oldest_enqueued_at: Option<u64>,
}

/// Handle returned by listener registration; pass back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(pub(crate) Uuid);

type ChangeListener = Arc<dyn Fn(&QueueStats) + Send + Sync>;

#[derive(Default)]
struct QueueInner {
    pending: Vec<QueuedOperation>,
    failed: Vec<QueuedOperation>,
}

/// Durable FIFO of operations awaiting delivery.
pub struct OfflineQueue {
    storage: Arc<dyn StorageAdapter>,
    config: SyncConfig,
    inner: Mutex<QueueInner>,
    replaying: AtomicBool,
    in_flight: AtomicUsize,
    listeners: Mutex<HashMap<Uuid, ChangeListener>>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("OfflineQueue")
            .field("pending", &stats.pending)
            .field("failed", &stats.failed)
            .field("in_flight", &stats.in_flight)
            .finish()
    }
}

impl OfflineQueue {
    /// Create a queue over the given adapter. Call [`load`](Self::load)
    /// to restore persisted entries.
    pub fn new(storage: Arc<dyn StorageAdapter>, config: SyncConfig) -> Self {
        Self {
            storage,
            config,
            inner: Mutex::new(QueueInner::default()),
            replaying: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Restore pending and dead-lettered entries from storage, ordered by
    /// enqueue time. Unreadable entries are logged and skipped.
    pub async fn load(&self) -> Result<()> {
        let mut pending = Vec::new();
        let mut failed = Vec::new();

        for key in self.storage.list().await? {
            let is_failed = keys::is_failed_key(&key);
            if !is_failed && !keys::is_queue_key(&key) {
                continue;
            }
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<QueuedOperation>(&bytes) {
                Ok(entry) => {
                    if is_failed {
                        failed.push(entry);
                    } else {
                        pending.push(entry);
                    }
                }
                Err(err) => {
                    tracing::warn!(%key, %err, "skipping unreadable queue entry");
                }
            }
        }

        pending.sort_by_key(|e| e.enqueued_at);
        failed.sort_by_key(|e| e.enqueued_at);

        {
            let mut inner = self.inner.lock();
            inner.pending = pending;
            inner.failed = failed;
        }
        self.notify();
        Ok(())
    }

    /// Append an operation. A pending entry with the same
    /// `(documentId, type, field/position/element, value)` is refreshed
    /// in place instead of duplicated. Fails with
    /// [`SyncError::QueueFull`] at capacity; existing work is never
    /// dropped.
    pub async fn enqueue(&self, operation: Operation) -> Result<Uuid> {
        let dedup_key = operation.dedup_key();

        let duplicate = {
            let mut inner = self.inner.lock();
            match inner
                .pending
                .iter_mut()
                .find(|e| e.operation.dedup_key() == dedup_key)
            {
                Some(entry) => {
                    entry.operation.timestamp =
                        entry.operation.timestamp.max(operation.timestamp);
                    Some(entry.clone())
                }
                None => {
                    if inner.pending.len() >= self.config.max_queue_size {
                        return Err(SyncError::QueueFull {
                            capacity: self.config.max_queue_size,
                        });
                    }
                    None
                }
            }
        };

        if let Some(entry) = duplicate {
            tracing::debug!(entry = %entry.id, "refreshed duplicate queue entry");
            self.persist_pending(&entry).await?;
            self.notify();
            return Ok(entry.id);
        }

        let entry = QueuedOperation {
            id: Uuid::new_v4(),
            operation,
            retries: 0,
            enqueued_at: crate::now_ms(),
        };
        self.persist_pending(&entry).await?;
        self.inner.lock().pending.push(entry.clone());
        self.notify();
        Ok(entry.id)
    }

    /// Deliver pending entries in FIFO order through `sender`, returning
    /// the number delivered.
    ///
    /// A failing entry is retried after `retry_delay * backoff^(n-1)`;
    /// once its retry count reaches the cap it moves to the dead-letter
    /// queue and replay continues with the next entry. Exactly one replay
    /// may run at a time; a concurrent call fails with
    /// [`SyncError::Invariant`].
    pub async fn replay<F, Fut>(&self, sender: F) -> Result<usize>
    where
        F: Fn(Operation) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Invariant("replay already in progress".into()));
        }

        let result = self.replay_locked(&sender).await;
        self.in_flight.store(0, Ordering::SeqCst);
        self.replaying.store(false, Ordering::SeqCst);
        result
    }

    async fn replay_locked<F, Fut>(&self, sender: &F) -> Result<usize>
    where
        F: Fn(Operation) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut delivered = 0usize;

        loop {
            let Some(entry) = self.inner.lock().pending.first().cloned() else {
                break;
            };

            self.in_flight.store(1, Ordering::SeqCst);
            self.notify();
            let outcome = sender(entry.operation.clone()).await;
            self.in_flight.store(0, Ordering::SeqCst);

            match outcome {
                Ok(()) => {
                    self.inner.lock().pending.retain(|e| e.id != entry.id);
                    self.storage.delete(&keys::queue_entry(&entry.id)).await?;
                    delivered += 1;
                    self.notify();
                }
                Err(err) => {
                    let retries = entry.retries + 1;
                    tracing::warn!(entry = %entry.id, retries, %err, "queue delivery failed");

                    let mut updated = entry.clone();
                    updated.retries = retries;
                    if let Some(live) = self
                        .inner
                        .lock()
                        .pending
                        .iter_mut()
                        .find(|e| e.id == entry.id)
                    {
                        live.retries = retries;
                    }

                    if retries >= self.config.max_retries {
                        self.dead_letter(updated).await?;
                    } else {
                        self.persist_pending(&updated).await?;
                        self.notify();
                        tokio::time::sleep(self.config.backoff_delay(retries)).await;
                    }
                }
            }
        }

        Ok(delivered)
    }

    async fn dead_letter(&self, entry: QueuedOperation) -> Result<()> {
        tracing::warn!(entry = %entry.id, "moving exhausted queue entry to dead-letter queue");
        {
            let mut inner = self.inner.lock();
            inner.pending.retain(|e| e.id != entry.id);
            inner.failed.push(entry.clone());
        }
        self.storage.delete(&keys::queue_entry(&entry.id)).await?;
        self.storage
            .set(&keys::failed_entry(&entry.id), serde_json::to_vec(&entry)?)
            .await
            .map_err(storage_err)?;
        self.notify();
        Ok(())
    }

    async fn persist_pending(&self, entry: &QueuedOperation) -> Result<()> {
        self.storage
            .set(&keys::queue_entry(&entry.id), serde_json::to_vec(entry)?)
            .await
            .map_err(storage_err)
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.pending.len(),
            failed: inner.failed.len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            oldest_enqueued_at: inner.pending.first().map(|e| e.enqueued_at),
        }
    }

    /// Pending operations targeting one document, in queue order.
    pub fn pending_for(&self, document_id: &str) -> Vec<Operation> {
        self.inner
            .lock()
            .pending
            .iter()
            .filter(|e| e.operation.document_id == document_id)
            .map(|e| e.operation.clone())
            .collect()
    }

    /// Dead-lettered entries, in order of failure.
    pub fn failed_entries(&self) -> Vec<QueuedOperation> {
        self.inner.lock().failed.clone()
    }

    /// Drop every pending entry, storage included.
    pub async fn clear(&self) -> Result<()> {
        let drained: Vec<QueuedOperation> = std::mem::take(&mut self.inner.lock().pending);
        for entry in &drained {
            self.storage.delete(&keys::queue_entry(&entry.id)).await?;
        }
        self.notify();
        Ok(())
    }

    /// Drop every dead-lettered entry, storage included.
    pub async fn clear_failed(&self) -> Result<()> {
        let drained: Vec<QueuedOperation> = std::mem::take(&mut self.inner.lock().failed);
        for entry in &drained {
            self.storage.delete(&keys::failed_entry(&entry.id)).await?;
        }
        self.notify();
        Ok(())
    }

    /// Register a change listener, invoked with fresh [`QueueStats`] on
    /// every depth, in-flight, or dead-letter change. Listener panics are
    /// caught and logged, never propagated.
    pub fn on_change(&self, listener: impl Fn(&QueueStats) + Send + Sync + 'static) -> ListenerHandle {
        let id = Uuid::new_v4();
        self.listeners.lock().insert(id, Arc::new(listener));
        ListenerHandle(id)
    }

    /// Unregister a change listener.
    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.lock().remove(&handle.0);
    }

    fn notify(&self) {
        let stats = self.stats();
        let listeners: Vec<ChangeListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&stats))).is_err() {
                tracing::error!("queue change listener panicked");
            }
        }
    }
}

fn storage_err(err: SyncError) -> SyncError {
    match err {
        SyncError::Storage(_) => err,
        other => SyncError::Storage(other.to_string()),
    }
}
