//! Tracker of known cluster servers and their liveness, fed by the
//! coordinator's membership updates. Consumers subscribe for change events:
//! the master's failure monitor re-replicates around crashed backups and the
//! backup's garbage collector reclaims replicas of removed masters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::ServerId;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

/// Liveness of one server in the cluster view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum ServerState {
    /// In the cluster and serving.
    Up,

    /// Declared crashed; recovery has not finished yet.
    Crashed,

    /// Recovery complete; the server is gone from the cluster.
    Removed,
}

/// Static details of one tracked server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetails {
    pub id: ServerId,
    pub state: ServerState,

    /// Whether the server runs the master role.
    pub is_master: bool,

    /// Whether the server runs the backup role.
    pub is_backup: bool,

    /// Operator-assigned failure domain (rack / power unit); primaries are
    /// placed preferring distinct domains.
    pub failure_domain: u64,
}

/// Membership change event delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChange {
    Added(ServerId),
    Crashed(ServerId),
    Removed(ServerId),
}

struct TrackerInner {
    servers: HashMap<ServerId, ServerDetails>,
    subscribers: Vec<mpsc::UnboundedSender<ServerChange>>,
}

/// Shared, cloneable handle on the cluster view.
#[derive(Clone)]
pub struct ServerTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl Default for ServerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        ServerTracker {
            inner: Arc::new(Mutex::new(TrackerInner {
                servers: HashMap::new(),
                subscribers: vec![],
            })),
        }
    }

    /// Subscribes for future change events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    fn publish(inner: &mut TrackerInner, change: ServerChange) {
        inner.subscribers.retain(|tx| tx.send(change).is_ok());
    }

    /// Installs a new up server into the view.
    pub fn add_server(
        &self,
        id: ServerId,
        is_master: bool,
        is_backup: bool,
        failure_domain: u64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.servers.insert(
            id,
            ServerDetails {
                id,
                state: ServerState::Up,
                is_master,
                is_backup,
                failure_domain,
            },
        );
        Self::publish(&mut inner, ServerChange::Added(id));
    }

    /// Marks a server crashed (recovery pending).
    pub fn mark_crashed(&self, id: ServerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(details) = inner.servers.get_mut(&id) {
            details.state = ServerState::Crashed;
            Self::publish(&mut inner, ServerChange::Crashed(id));
        }
    }

    /// Marks a server removed (recovery complete).
    pub fn remove_server(&self, id: ServerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(details) = inner.servers.get_mut(&id) {
            details.state = ServerState::Removed;
            Self::publish(&mut inner, ServerChange::Removed(id));
        }
    }

    /// Full details of a server; `None` if it was never seen.
    pub fn details_of(&self, id: ServerId) -> Option<ServerDetails> {
        self.inner.lock().unwrap().servers.get(&id).cloned()
    }

    /// Current liveness of a server; `None` if it was never seen.
    pub fn state_of(&self, id: ServerId) -> Option<ServerState> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .get(&id)
            .map(|details| details.state)
    }

    /// True if the server is known and up.
    pub fn is_up(&self, id: ServerId) -> bool {
        self.state_of(id) == Some(ServerState::Up)
    }

    /// Snapshot of all up servers running the backup role.
    pub fn backups_up(&self) -> Vec<ServerDetails> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .values()
            .filter(|d| d.state == ServerState::Up && d.is_backup)
            .cloned()
            .collect()
    }

    /// Snapshot of all up servers running the master role.
    pub fn masters_up(&self) -> Vec<ServerId> {
        self.inner
            .lock()
            .unwrap()
            .servers
            .values()
            .filter(|d| d.state == ServerState::Up && d.is_master)
            .map(|d| d.id)
            .collect()
    }
}
