//! Per-document cross-tab coordinator.
//!
//! One coordinator per (document, browsing context), all talking over the
//! document's broadcast bus. The oldest tab leads: candidacy is the tab's
//! construction time, ties break toward the lexicographically lower tab
//! id. The leader heartbeats on an interval, optionally carrying a digest
//! of its state; a follower whose own digest differs asks the leader for
//! a full-state handoff and applies it through its restorer.
//!
//! Liveness is tracked on the runtime clock, so a follower declares the
//! leader lost after `heartbeat_timeout` of silence (or an explicit
//! `tab-leaving`) and re-runs the election. Every timer is held as a
//! cancellable handle; `destroy` cancels them all and announces the
//! departure.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use uuid::Uuid;

use crate::bus::TabBus;
use crate::config::CoordinatorConfig;
use crate::error::{Result, TabError};
use crate::messages::{RelayKind, TabId, TabMessage, TabMessageKind, TabSnapshot};

/// Role of a tab within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabRole {
    /// This tab heartbeats and answers full-sync requests.
    Leader,
    /// This tab follows the current leader.
    Follower,
}

/// Observable coordinator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabState {
    /// This tab's id.
    pub tab_id: TabId,
    /// This tab's construction time (wall-clock milliseconds).
    pub tab_start_time: u64,
    /// Current role.
    pub role: TabRole,
    /// The known leader, if any.
    pub leader_id: Option<TabId>,
    /// Wall-clock milliseconds of the last leader heartbeat seen.
    pub last_leader_heartbeat: Option<u64>,
    /// This tab's send sequence number.
    pub sequence: u64,
}

/// Handle returned by relay-handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHandle(Uuid);

type StateProvider = Arc<dyn Fn() -> TabSnapshot + Send + Sync>;
type StateRestorer = Arc<dyn Fn(TabSnapshot) + Send + Sync>;
type RelayHandler = Arc<dyn Fn(RelayKind, &Value) + Send + Sync>;

struct CoordState {
    role: TabRole,
    leader_id: Option<TabId>,
    last_heartbeat_at: Option<Instant>,
    last_heartbeat_wall: Option<u64>,
    election_pending: bool,
    heartbeat_task: Option<JoinHandle<()>>,
}

struct Shared {
    document_id: String,
    tab_id: TabId,
    tab_start_time: u64,
    config: CoordinatorConfig,
    bus: TabBus,
    seq: AtomicU64,
    destroyed: AtomicBool,
    state: Mutex<CoordState>,
    provider: Mutex<Option<StateProvider>>,
    restorer: Mutex<Option<StateRestorer>>,
    handlers: Mutex<HashMap<Uuid, RelayHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cross-tab coordinator for one document.
pub struct TabCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TabCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabCoordinator")
            .field("document_id", &self.shared.document_id)
            .field("tab_id", &self.shared.tab_id)
            .finish()
    }
}

impl TabCoordinator {
    /// Create a coordinator for a document over the shared bus.
    pub fn new(document_id: impl Into<String>, bus: TabBus, config: CoordinatorConfig) -> Self {
        let start = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::with_start_time(document_id, bus, config, start)
    }

    /// Create a coordinator with an explicit construction time. Hosts
    /// that persist tab identity across reloads use this to keep
    /// seniority stable.
    pub fn with_start_time(
        document_id: impl Into<String>,
        bus: TabBus,
        config: CoordinatorConfig,
        tab_start_time: u64,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                document_id: document_id.into(),
                tab_id: TabId::new(),
                tab_start_time,
                config,
                bus,
                seq: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                state: Mutex::new(CoordState {
                    role: TabRole::Follower,
                    leader_id: None,
                    last_heartbeat_at: None,
                    last_heartbeat_wall: None,
                    election_pending: false,
                    heartbeat_task: None,
                }),
                provider: Mutex::new(None),
                restorer: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This tab's id.
    pub fn tab_id(&self) -> TabId {
        self.shared.tab_id
    }

    /// The document this coordinator serves.
    pub fn document_id(&self) -> &str {
        &self.shared.document_id
    }

    /// True while this tab leads its group.
    pub fn is_leader(&self) -> bool {
        self.shared.state.lock().role == TabRole::Leader
    }

    /// Snapshot of the observable state.
    pub fn state(&self) -> TabState {
        let state = self.shared.state.lock();
        TabState {
            tab_id: self.shared.tab_id,
            tab_start_time: self.shared.tab_start_time,
            role: state.role,
            leader_id: state.leader_id,
            last_leader_heartbeat: state.last_heartbeat_wall,
            sequence: self.shared.seq.load(Ordering::SeqCst),
        }
    }

    /// Wire the provider the leader digests and serves full state from.
    pub fn set_state_provider(&self, provider: impl Fn() -> TabSnapshot + Send + Sync + 'static) {
        *self.shared.provider.lock() = Some(Arc::new(provider));
    }

    /// Wire the restorer a follower applies full-sync responses through.
    pub fn set_state_restorer(&self, restorer: impl Fn(TabSnapshot) + Send + Sync + 'static) {
        *self.shared.restorer.lock() = Some(Arc::new(restorer));
    }

    /// Register an application relay handler. Handler panics are caught
    /// and logged per handler.
    pub fn on_relay(
        &self,
        handler: impl Fn(RelayKind, &Value) + Send + Sync + 'static,
    ) -> RelayHandle {
        let id = Uuid::new_v4();
        self.shared.handlers.lock().insert(id, Arc::new(handler));
        RelayHandle(id)
    }

    /// Unregister a relay handler.
    pub fn remove_relay_handler(&self, handle: RelayHandle) {
        self.shared.handlers.lock().remove(&handle.0);
    }

    /// Broadcast an application-level relay to sibling tabs.
    pub fn broadcast_relay(&self, kind: RelayKind, data: Value) -> Result<()> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(TabError::Destroyed(self.shared.document_id.clone()));
        }
        self.shared.bus.send(self.shared.message(TabMessageKind::Relay { kind, data }))
    }

    /// Join the group: announce presence, run for leadership, and start
    /// the receive loop and liveness timer.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let mut rx = shared.bus.subscribe();

        let recv_shared = shared.clone();
        let recv_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.from != recv_shared.tab_id {
                            recv_shared.handle_message(msg);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "tab bus lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        shared.tasks.lock().push(recv_task);

        shared.send(TabMessageKind::TabJoined);
        shared.initiate_election();

        let check = shared.clone();
        let liveness_task = tokio::spawn(async move {
            let mut ticker = interval(check.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                if check.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                check.check_leader_liveness();
            }
        });
        shared.tasks.lock().push(liveness_task);
    }

    /// Leave the group: announce departure, cancel every timer, and stop
    /// receiving.
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl Drop for TabCoordinator {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

impl Shared {
    fn message(&self, kind: TabMessageKind) -> TabMessage {
        TabMessage {
            kind,
            from: self.tab_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    /// Fire-and-forget broadcast; failures are logged and swallowed so
    /// shutdown paths never trip over a closed channel.
    fn send(&self, kind: TabMessageKind) {
        let name = kind.name();
        if let Err(err) = self.bus.send(self.message(kind)) {
            if self.destroyed.load(Ordering::SeqCst) {
                tracing::debug!(%err, kind = name, "broadcast after destroy dropped");
            } else {
                tracing::warn!(%err, kind = name, "broadcast failed");
            }
        }
    }

    fn candidacy(&self) -> (u64, TabId) {
        (self.tab_start_time, self.tab_id)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(TabMessageKind::TabLeaving);
        if let Some(task) = self.state.lock().heartbeat_task.take() {
            task.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::debug!(document = %self.document_id, tab = %self.tab_id, "coordinator destroyed");
    }

    fn handle_message(self: &Arc<Self>, msg: TabMessage) {
        match msg.kind {
            TabMessageKind::TabJoined => {
                // a newcomer knows no leader; an incumbent answers fast
                if self.state.lock().role == TabRole::Leader {
                    self.send_heartbeat();
                }
            }
            TabMessageKind::TabLeaving => {
                let lost_leader = {
                    let mut state = self.state.lock();
                    if state.leader_id == Some(msg.from) {
                        state.leader_id = None;
                        state.last_heartbeat_at = None;
                        true
                    } else {
                        false
                    }
                };
                if lost_leader {
                    tracing::info!(tab = %self.tab_id, "leader left; starting election");
                    self.initiate_election();
                }
            }
            TabMessageKind::Election { tab_start_time } => {
                self.handle_election(msg.from, tab_start_time);
            }
            TabMessageKind::Heartbeat {
                tab_start_time,
                state_hash,
            } => {
                self.handle_heartbeat(msg.from, tab_start_time, state_hash);
            }
            TabMessageKind::RequestFullSync { target } => {
                if target != self.tab_id || self.state.lock().role != TabRole::Leader {
                    return;
                }
                let provider = self.provider.lock().clone();
                if let Some(provider) = provider {
                    match catch_unwind(AssertUnwindSafe(|| provider())) {
                        Ok(snapshot) => self.send(TabMessageKind::FullSyncResponse {
                            target: msg.from,
                            snapshot,
                        }),
                        Err(_) => tracing::error!("state provider panicked"),
                    }
                }
            }
            TabMessageKind::FullSyncResponse { target, snapshot } => {
                if target != self.tab_id {
                    return;
                }
                let restorer = self.restorer.lock().clone();
                if let Some(restorer) = restorer {
                    tracing::info!(tab = %self.tab_id, "applying full-state handoff from leader");
                    if catch_unwind(AssertUnwindSafe(|| restorer(snapshot))).is_err() {
                        tracing::error!("state restorer panicked");
                    }
                }
            }
            TabMessageKind::Relay { kind, data } => {
                let handlers: Vec<RelayHandler> =
                    self.handlers.lock().values().cloned().collect();
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(kind, &data))).is_err() {
                        tracing::error!(kind = ?kind, "relay handler panicked");
                    }
                }
            }
        }
    }

    fn handle_election(self: &Arc<Self>, from: TabId, their_start: u64) {
        let theirs = (their_start, from);
        let ours = self.candidacy();

        if theirs < ours {
            // an older candidate outranks us: cancel any pending
            // self-election and step down if we currently lead
            let was_leader = {
                let mut state = self.state.lock();
                state.election_pending = false;
                if state.role == TabRole::Leader {
                    state.role = TabRole::Follower;
                    state.leader_id = None;
                    if let Some(task) = state.heartbeat_task.take() {
                        task.abort();
                    }
                    true
                } else {
                    false
                }
            };
            if was_leader {
                tracing::info!(tab = %self.tab_id, senior = %from, "stepping down for older candidate");
            }
        } else {
            // a newer candidate: an incumbent re-asserts, a pending
            // candidate restates its own claim
            let (is_leader, pending) = {
                let state = self.state.lock();
                (state.role == TabRole::Leader, state.election_pending)
            };
            if is_leader {
                self.send_heartbeat();
            } else if pending {
                self.send(TabMessageKind::Election {
                    tab_start_time: self.tab_start_time,
                });
            }
        }
    }

    fn handle_heartbeat(self: &Arc<Self>, from: TabId, their_start: u64, state_hash: Option<String>) {
        let reassert = {
            let mut state = self.state.lock();
            if state.role == TabRole::Leader {
                // split brain: the junior side stands down
                if (their_start, from) < self.candidacy() {
                    state.role = TabRole::Follower;
                    if let Some(task) = state.heartbeat_task.take() {
                        task.abort();
                    }
                    tracing::warn!(tab = %self.tab_id, senior = %from, "dual leadership resolved; following");
                    false
                } else {
                    true
                }
            } else {
                false
            }
        };
        if reassert {
            self.send_heartbeat();
            return;
        }

        {
            let mut state = self.state.lock();
            state.leader_id = Some(from);
            state.last_heartbeat_at = Some(Instant::now());
            state.last_heartbeat_wall = Some(chrono::Utc::now().timestamp_millis().max(0) as u64);
            state.election_pending = false;
        }

        // optimistic divergence detection against the leader's digest
        if let Some(remote_hash) = state_hash {
            let provider = self.provider.lock().clone();
            if let Some(provider) = provider {
                match catch_unwind(AssertUnwindSafe(|| provider())) {
                    Ok(snapshot) => {
                        if snapshot.digest() != remote_hash {
                            tracing::warn!(
                                tab = %self.tab_id,
                                leader = %from,
                                "state diverged from leader; requesting full sync"
                            );
                            self.send(TabMessageKind::RequestFullSync { target: from });
                        }
                    }
                    Err(_) => tracing::error!("state provider panicked"),
                }
            }
        }
    }

    fn initiate_election(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            state.election_pending = true;
        }
        self.send(TabMessageKind::Election {
            tab_start_time: self.tab_start_time,
        });

        let shared = self.clone();
        let settle = tokio::spawn(async move {
            sleep(shared.config.settle_timeout).await;
            let elevate = {
                let state = shared.state.lock();
                state.election_pending && state.leader_id.is_none()
            };
            if elevate && !shared.destroyed.load(Ordering::SeqCst) {
                shared.become_leader();
            }
        });
        self.tasks.lock().push(settle);
    }

    fn become_leader(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.role == TabRole::Leader {
                return;
            }
            state.role = TabRole::Leader;
            state.leader_id = Some(self.tab_id);
            state.election_pending = false;

            let shared = self.clone();
            state.heartbeat_task = Some(tokio::spawn(async move {
                let mut ticker = interval(shared.config.heartbeat_interval);
                loop {
                    ticker.tick().await;
                    if shared.destroyed.load(Ordering::SeqCst)
                        || shared.state.lock().role != TabRole::Leader
                    {
                        break;
                    }
                    shared.send_heartbeat();
                }
            }));
        }
        tracing::info!(document = %self.document_id, tab = %self.tab_id, "elected leader");
    }

    fn check_leader_liveness(self: &Arc<Self>) {
        let rerun = {
            let mut state = self.state.lock();
            if state.role == TabRole::Leader {
                false
            } else {
                match (state.leader_id, state.last_heartbeat_at) {
                    (Some(_), Some(at)) if at.elapsed() > self.config.heartbeat_timeout => {
                        tracing::warn!(tab = %self.tab_id, "leader heartbeat timed out");
                        state.leader_id = None;
                        state.last_heartbeat_at = None;
                        true
                    }
                    (None, _) => !state.election_pending,
                    _ => false,
                }
            }
        };
        if rerun {
            self.initiate_election();
        }
    }

    fn send_heartbeat(self: &Arc<Self>) {
        let provider = self.provider.lock().clone();
        let state_hash = provider.and_then(|provider| {
            match catch_unwind(AssertUnwindSafe(|| provider())) {
                Ok(snapshot) => Some(snapshot.digest()),
                Err(_) => {
                    tracing::error!("state provider panicked");
                    None
                }
            }
        });
        self.send(TabMessageKind::Heartbeat {
            tab_start_time: self.tab_start_time,
            state_hash,
        });
    }
}
