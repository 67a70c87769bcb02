//! Background sync worker
//!
//! Replays the ledger and the pending-mutation queue against the backend
//! on a fixed interval and whenever connectivity returns.
//!
//! Replay discipline:
//! - Ledger entries oldest first. A connectivity failure ends the pass;
//!   any other failure is recorded and the entry stays pending. A
//!   critical write is never dropped, whatever its age or retry count.
//! - Queue mutations in strict FIFO. A connectivity failure ends the
//!   pass, so mutation N+1 never lands before N is confirmed. A
//!   non-connectivity failure marks the mutation dead and the pass
//!   continues past it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::backend::ConnectivityMonitor;
use crate::error::SyncError;
use crate::ledger::{Ledger, LedgerEntry};
use crate::queue::{MutationQueue, PendingMutation};

/// Backend submission point for critical writes. Returns the server
/// timestamp of the accepted entry.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn submit(&self, entry: &LedgerEntry) -> Result<DateTime<Utc>, SyncError>;
}

/// Applies one queued mutation against the backend.
#[async_trait]
pub trait MutationReplayer: Send + Sync {
    async fn replay(&self, mutation: &PendingMutation) -> Result<(), SyncError>;
}

/// Progress notifications for the UI ("saved, will sync" → "synced").
#[derive(Debug, Clone)]
pub enum SyncEvent {
    LedgerEntrySynced {
        id: String,
    },
    LedgerEntryFailed {
        id: String,
        error: String,
    },
    MutationReplayed {
        id: String,
        entity: String,
        entity_id: String,
    },
    MutationDead {
        id: String,
        entity: String,
        error: String,
    },
    PassCompleted {
        ledger_synced: usize,
        mutations_replayed: usize,
    },
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default)]
pub struct SyncPassSummary {
    pub ledger_synced: usize,
    pub mutations_replayed: usize,
    pub mutations_dead: usize,
}

/// Drives ledger and queue replay.
pub struct SyncWorker {
    ledger: Arc<Ledger>,
    queue: Arc<MutationQueue>,
    sink: Arc<dyn LedgerSink>,
    replayer: Arc<dyn MutationReplayer>,
    connectivity: Arc<ConnectivityMonitor>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncWorker {
    pub fn new(
        ledger: Arc<Ledger>,
        queue: Arc<MutationQueue>,
        sink: Arc<dyn LedgerSink>,
        replayer: Arc<dyn MutationReplayer>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            ledger,
            queue,
            sink,
            replayer,
            connectivity,
            events,
        }
    }

    /// Subscribe to sync progress events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run one full sync pass: the ledger first, then the queue.
    pub async fn run_once(&self) -> Result<SyncPassSummary, SyncError> {
        let mut summary = SyncPassSummary::default();

        if !self.connectivity.is_online() {
            debug!("Device offline, skipping sync pass");
            return Ok(summary);
        }

        if !self.ledger_pass(&mut summary).await? {
            return Ok(summary);
        }
        self.queue_pass(&mut summary).await?;

        let _ = self.events.send(SyncEvent::PassCompleted {
            ledger_synced: summary.ledger_synced,
            mutations_replayed: summary.mutations_replayed,
        });
        info!(
            ledger_synced = summary.ledger_synced,
            mutations_replayed = summary.mutations_replayed,
            mutations_dead = summary.mutations_dead,
            "Sync pass completed"
        );
        Ok(summary)
    }

    /// Returns false when the pass was cut short by lost connectivity.
    async fn ledger_pass(&self, summary: &mut SyncPassSummary) -> Result<bool, SyncError> {
        for entry in self.ledger.list_pending()? {
            match self.sink.submit(&entry).await {
                Ok(server_timestamp) => {
                    self.ledger.mark_synced(&entry.id, server_timestamp).await?;
                    summary.ledger_synced += 1;
                    let _ = self.events.send(SyncEvent::LedgerEntrySynced {
                        id: entry.id.clone(),
                    });
                }
                Err(err) if err.is_connectivity() => {
                    self.ledger.mark_failed(&entry.id, &err.to_string()).await?;
                    debug!(id = %entry.id, error = %err, "Connectivity lost during ledger pass");
                    return Ok(false);
                }
                Err(err) => {
                    // The entry stays pending; a critical write is never
                    // dropped.
                    self.ledger.mark_failed(&entry.id, &err.to_string()).await?;
                    let _ = self.events.send(SyncEvent::LedgerEntryFailed {
                        id: entry.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(true)
    }

    async fn queue_pass(&self, summary: &mut SyncPassSummary) -> Result<(), SyncError> {
        for mutation in self.queue.pending_mutations()? {
            match self.replayer.replay(&mutation).await {
                Ok(()) => {
                    self.queue.dequeue_on_confirmed_sync(&mutation.id).await?;
                    summary.mutations_replayed += 1;
                    let _ = self.events.send(SyncEvent::MutationReplayed {
                        id: mutation.id.clone(),
                        entity: mutation.entity.clone(),
                        entity_id: mutation.entity_id.clone(),
                    });
                }
                Err(err) if err.is_connectivity() => {
                    // Stop rather than skip ahead: mutation N+1 must not
                    // land before N is confirmed.
                    self.queue.mark_failed(&mutation.id, &err.to_string()).await?;
                    debug!(id = %mutation.id, error = %err, "Connectivity lost during queue pass");
                    return Ok(());
                }
                Err(err) => {
                    self.queue.mark_dead(&mutation.id, &err.to_string()).await?;
                    summary.mutations_dead += 1;
                    let _ = self.events.send(SyncEvent::MutationDead {
                        id: mutation.id.clone(),
                        entity: mutation.entity.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Spawn the worker: one pass per interval tick, plus an immediate
    /// pass on every offline→online transition.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let mut online = self.connectivity.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup does
            // not race app wiring.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow() {
                            continue;
                        }
                        info!("Connectivity restored, starting sync pass");
                    }
                }

                if let Err(err) = self.run_once().await {
                    error!(error = %err, "Sync pass failed");
                }
            }
        })
    }
}
