//! Collaborator interfaces
//!
//! The backend CRUD surface, the device connectivity signal and the
//! change-notification stream are consumed through these seams. The
//! crate never talks to a transport directly, and no wire format is
//! assumed beyond entity CRUD + list + change feed.

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::error::SyncError;

/// Per-entity backend CRUD surface.
///
/// `add` and `update` return the canonical server record (the backend
/// may fill in ids, timestamps or computed fields).
#[async_trait]
pub trait EntityBackend: Send + Sync {
    type Record: Send + Sync;

    async fn add(&self, record: &Self::Record) -> Result<Self::Record, SyncError>;
    async fn update(&self, record: &Self::Record) -> Result<Self::Record, SyncError>;
    async fn delete(&self, entity_id: &str) -> Result<(), SyncError>;
    async fn list(&self) -> Result<Vec<Self::Record>, SyncError>;
}

/// Device-level online/offline signal.
///
/// The platform layer flips it; the dispatcher, the feed listener and
/// the sync worker observe it.
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        // send_replace never fails; a watch channel keeps the last value
        // even with no receivers.
        self.tx.send_replace(online);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Kind of a row-level change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change notification from the backend
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub entity: String,
    pub kind: ChangeKind,
    pub entity_id: String,
}

/// Broadcast hub the transport layer feeds backend change notifications
/// into. The feed listener subscribes here.
pub struct ChangeFeedHub {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeedHub {
    /// Create a new hub with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new hub with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a change event to all subscribers
    pub fn publish(&self, event: ChangeEvent) {
        trace!(event = ?event, "Publishing change event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeedHub {
    fn default() -> Self {
        Self::new()
    }
}
