//! Pending-mutation queue
//!
//! Durable FIFO of ordinary entity writes that could not be applied
//! online. Critical writes go to the ledger instead; everything else
//! (customer edits, product updates, deletions) lands here and is
//! replayed in order once connectivity returns.
//!
//! A mutation that fails replay for a non-connectivity reason is marked
//! dead: it is never retried (infinite retry of an invalid write would
//! hide a real bug forever) and stays stored until an operator resolves
//! it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SyncError;

/// Operation kind of a queued write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    Add,
    Update,
    Delete,
}

/// One queued entity write awaiting replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Mutation id (uuid v4)
    pub id: String,
    /// Tag identifying the target collection
    pub entity: String,
    /// Operation to replay
    pub operation: MutationOp,
    /// Id of the record the operation targets
    pub entity_id: String,
    /// Payload snapshot, already translated to backend field names
    pub payload: Value,
    /// When the mutation was queued
    pub enqueued_at: DateTime<Utc>,
    /// Replay attempts so far
    pub retry_count: u32,
    /// Last replay failure, if any
    pub last_error: Option<String>,
    /// Failed for a non-connectivity reason; excluded from replay
    pub dead: bool,
}

/// Durable FIFO of pending mutations backed by sled.
pub struct MutationQueue {
    db: sled::Db,
    mutations: sled::Tree,
    ids: sled::Tree,
    /// Serializes enqueue sequencing and row updates.
    write_lock: Mutex<()>,
}

impl MutationQueue {
    /// Open or create the queue database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(path.as_ref())?;
        let mutations = db.open_tree("mutations")?;
        let ids = db.open_tree("ids")?;

        info!(path = %path.as_ref().display(), "Opened mutation queue database");

        Ok(Self {
            db,
            mutations,
            ids,
            write_lock: Mutex::new(()),
        })
    }

    /// Append a mutation to the durable queue.
    pub async fn enqueue(
        &self,
        id: &str,
        entity: &str,
        operation: MutationOp,
        entity_id: &str,
        payload: Value,
    ) -> Result<PendingMutation, SyncError> {
        let _guard = self.write_lock.lock().await;

        let mutation = PendingMutation {
            id: id.to_string(),
            entity: entity.to_string(),
            operation,
            entity_id: entity_id.to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            dead: false,
        };

        let seq = self.next_seq()?;
        self.mutations
            .insert(seq.to_be_bytes(), encode_mutation(&mutation)?)?;
        self.ids.insert(id.as_bytes(), &seq.to_be_bytes()[..])?;
        self.db.flush_async().await?;

        debug!(
            id = %id,
            entity = %entity,
            operation = ?operation,
            entity_id = %entity_id,
            "Mutation queued"
        );
        Ok(mutation)
    }

    /// Live mutations in append order. Dead mutations are excluded; they
    /// are surfaced through [`dead_mutations`](Self::dead_mutations).
    pub fn pending_mutations(&self) -> Result<Vec<PendingMutation>, SyncError> {
        let mut pending = Vec::new();
        for item in self.mutations.iter() {
            let (_, value) = item?;
            let mutation = decode_mutation(&value)?;
            if !mutation.dead {
                pending.push(mutation);
            }
        }
        Ok(pending)
    }

    /// Mutations that failed for a non-connectivity reason, append order.
    pub fn dead_mutations(&self) -> Result<Vec<PendingMutation>, SyncError> {
        let mut dead = Vec::new();
        for item in self.mutations.iter() {
            let (_, value) = item?;
            let mutation = decode_mutation(&value)?;
            if mutation.dead {
                dead.push(mutation);
            }
        }
        Ok(dead)
    }

    /// Latest live queued operation for a record, so the UI can show one
    /// "pending update" or "pending delete" indicator without duplicates.
    pub fn pending_status(
        &self,
        entity: &str,
        entity_id: &str,
    ) -> Result<Option<MutationOp>, SyncError> {
        let mut latest = None;
        for item in self.mutations.iter() {
            let (_, value) = item?;
            let mutation = decode_mutation(&value)?;
            if !mutation.dead && mutation.entity == entity && mutation.entity_id == entity_id {
                latest = Some(mutation.operation);
            }
        }
        Ok(latest)
    }

    /// Set of entity ids with a live queued mutation for one entity.
    /// This is the protected set a cache reconcile must not drop.
    pub fn pending_entity_ids(
        &self,
        entity: &str,
    ) -> Result<std::collections::HashSet<String>, SyncError> {
        let mut ids = std::collections::HashSet::new();
        for item in self.mutations.iter() {
            let (_, value) = item?;
            let mutation = decode_mutation(&value)?;
            if !mutation.dead && mutation.entity == entity {
                ids.insert(mutation.entity_id);
            }
        }
        Ok(ids)
    }

    /// Remove a mutation once its replay against the backend succeeded.
    pub async fn dequeue_on_confirmed_sync(&self, id: &str) -> Result<bool, SyncError> {
        let _guard = self.write_lock.lock().await;

        let removed = match self.ids.get(id.as_bytes())? {
            Some(seq) => {
                self.mutations.remove(&seq)?;
                self.ids.remove(id.as_bytes())?;
                true
            }
            None => false,
        };

        if removed {
            self.db.flush_async().await?;
            debug!(id = %id, "Mutation dequeued after confirmed sync");
        }
        Ok(removed)
    }

    /// Record a connectivity failure during replay; the mutation stays
    /// queued for the next pass.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;

        let (seq, mut mutation) = self.load_by_id(id)?;
        mutation.retry_count += 1;
        mutation.last_error = Some(error.to_string());
        self.mutations.insert(&seq, encode_mutation(&mutation)?)?;

        debug!(id = %id, retry_count = mutation.retry_count, "Mutation replay failed");
        Ok(())
    }

    /// Mark a mutation dead after a non-connectivity failure. It is
    /// excluded from replay and surfaced to the operator.
    pub async fn mark_dead(&self, id: &str, error: &str) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;

        let (seq, mut mutation) = self.load_by_id(id)?;
        mutation.dead = true;
        mutation.last_error = Some(error.to_string());
        self.mutations.insert(&seq, encode_mutation(&mutation)?)?;
        self.db.flush_async().await?;

        warn!(
            id = %id,
            entity = %mutation.entity,
            entity_id = %mutation.entity_id,
            error = %error,
            "Mutation marked dead"
        );
        Ok(())
    }

    /// Number of live queued mutations
    pub fn len(&self) -> Result<usize, SyncError> {
        Ok(self.pending_mutations()?.len())
    }

    /// Whether the live queue is empty
    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }

    fn load_by_id(&self, id: &str) -> Result<(sled::IVec, PendingMutation), SyncError> {
        let seq = self
            .ids
            .get(id.as_bytes())?
            .ok_or_else(|| SyncError::NotFound(format!("mutation {}", id)))?;
        let value = self
            .mutations
            .get(&seq)?
            .ok_or_else(|| SyncError::NotFound(format!("mutation {}", id)))?;
        Ok((seq, decode_mutation(&value)?))
    }

    fn next_seq(&self) -> Result<u64, SyncError> {
        match self.mutations.last()? {
            Some((key, _)) => {
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| SyncError::Serialization("malformed queue sequence key".into()))?;
                Ok(u64::from_be_bytes(bytes) + 1)
            }
            None => Ok(0),
        }
    }
}

fn encode_mutation(mutation: &PendingMutation) -> Result<Vec<u8>, SyncError> {
    rmp_serde::to_vec(mutation).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn decode_mutation(bytes: &[u8]) -> Result<PendingMutation, SyncError> {
    rmp_serde::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}
