//! Optimistic local cache
//!
//! Per-entity read models representing what the UI should currently
//! show: the last successful server fetch merged with unsynced local
//! writes. Reconcile is a merge, not a replace — a record still
//! referenced by a pending mutation survives a fresh server fetch, which
//! is the single most important correctness property of the offline
//! path.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Implemented by records held in a cache collection.
pub trait CacheRecord {
    /// Stable record id
    fn record_id(&self) -> &str;
    /// Whether this record is an unconfirmed optimistic write
    fn is_offline(&self) -> bool;
    /// Tag or untag the record as an unconfirmed optimistic write
    fn set_offline(&mut self, offline: bool);
}

/// Ordered, id-unique collection for one entity type.
#[derive(Debug, Clone)]
pub struct CacheCollection<T> {
    records: Vec<T>,
    stale: bool,
}

impl<T: CacheRecord + Clone> CacheCollection<T> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            stale: true,
        }
    }

    /// Append a record if its id is not already present.
    pub fn add(&mut self, record: T) -> bool {
        if self.contains(record.record_id()) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Replace the record matching the same id. If no record matches,
    /// the collection is unchanged; the caller sees `false`, not an
    /// error.
    pub fn update(&mut self, record: T) -> bool {
        match self
            .records
            .iter_mut()
            .find(|r| r.record_id() == record.record_id())
        {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }

    /// Remove the record with the given id.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.record_id() != id);
        self.records.len() < before
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.records.iter().find(|r| r.record_id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge a fresh server fetch with unsynced local state.
    ///
    /// The server collection becomes the base truth. For every id in
    /// `pending` (ids with a live queued mutation) the local state wins:
    /// a locally present record is re-merged on top of the server's
    /// version, a locally absent one stays absent even if the server
    /// still lists it (the queued delete has not reached the backend
    /// yet). Clears the stale flag.
    pub fn reconcile(&mut self, server: Vec<T>, pending: &HashSet<String>) {
        let local: HashMap<String, T> = self
            .records
            .iter()
            .map(|r| (r.record_id().to_string(), r.clone()))
            .collect();

        let mut merged: Vec<T> = Vec::with_capacity(server.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(server.len());

        for record in server {
            let id = record.record_id().to_string();
            if pending.contains(&id) {
                if let Some(ours) = local.get(&id) {
                    merged.push(ours.clone());
                }
            } else {
                merged.push(record);
            }
            seen.insert(id);
        }

        // Unsynced optimistic adds the server does not know about yet.
        for record in &self.records {
            let id = record.record_id();
            if pending.contains(id) && !seen.contains(id) {
                merged.push(record.clone());
            }
        }

        self.records = merged;
        self.stale = false;
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

impl<T: CacheRecord + Clone> Default for CacheCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, lock-guarded cache collection for one entity type.
pub struct EntityCache<T> {
    entity: String,
    inner: RwLock<CacheCollection<T>>,
}

impl<T: CacheRecord + Clone + Send + Sync> EntityCache<T> {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            inner: RwLock::new(CacheCollection::new()),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub async fn add(&self, record: T) -> bool {
        self.inner.write().await.add(record)
    }

    pub async fn update(&self, record: T) -> bool {
        self.inner.write().await.update(record)
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<T> {
        self.inner.read().await.records().to_vec()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn reconcile(&self, server: Vec<T>, pending: &HashSet<String>) {
        self.inner.write().await.reconcile(server, pending);
    }

    pub async fn mark_stale(&self) {
        self.inner.write().await.mark_stale();
    }

    pub async fn is_stale(&self) -> bool {
        self.inner.read().await.is_stale()
    }
}

/// Anything the change-feed listener can invalidate.
#[async_trait]
pub trait InvalidationTarget: Send + Sync {
    async fn invalidate(&self);
}

#[async_trait]
impl<T: CacheRecord + Clone + Send + Sync> InvalidationTarget for EntityCache<T> {
    async fn invalidate(&self) {
        self.mark_stale().await;
    }
}

/// Registry of entity caches, keyed by entity tag, for feed-driven
/// invalidation.
pub struct CacheRegistry {
    targets: DashMap<String, Arc<dyn InvalidationTarget>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
        }
    }

    /// Track an entity cache under its tag.
    pub fn register(&self, entity: &str, target: Arc<dyn InvalidationTarget>) {
        self.targets.insert(entity.to_string(), target);
    }

    /// Invalidate one entity's cache. Returns false for untracked tags.
    pub async fn invalidate(&self, entity: &str) -> bool {
        let target = self.targets.get(entity).map(|t| t.value().clone());
        match target {
            Some(target) => {
                target.invalidate().await;
                debug!(entity = %entity, "Cache invalidated");
                true
            }
            None => false,
        }
    }

    /// Invalidate every tracked cache.
    pub async fn invalidate_all(&self) {
        let targets: Vec<Arc<dyn InvalidationTarget>> = self
            .targets
            .iter()
            .map(|item| item.value().clone())
            .collect();
        for target in targets {
            target.invalidate().await;
        }
        debug!(count = self.targets.len(), "All caches invalidated");
    }

    /// Tags currently tracked
    pub fn tracked(&self) -> Vec<String> {
        self.targets.iter().map(|item| item.key().clone()).collect()
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}
