//! Change-feed listener
//!
//! Consumes backend row-change notifications and invalidates the
//! matching entity cache, so the next read triggers a fresh fetch and
//! goes through the reconcile merge.
//!
//! Missed events are never individually replayed: a lagged receiver and
//! a connectivity offline→online transition both invalidate every
//! tracked cache, and the next full refetch is the reconciliation
//! mechanism. That is an accepted weaker-consistency tradeoff.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{ChangeFeedHub, ConnectivityMonitor};
use crate::cache::CacheRegistry;

/// Background task wiring the change feed to cache invalidation.
pub struct ChangeFeedListener;

impl ChangeFeedListener {
    /// Spawn the listener. It runs until the hub is dropped.
    pub fn spawn(
        hub: &ChangeFeedHub,
        registry: Arc<CacheRegistry>,
        connectivity: &ConnectivityMonitor,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = hub.subscribe();
        let mut online = connectivity.subscribe();
        let mut was_online = *online.borrow();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            debug!(
                                entity = %event.entity,
                                kind = ?event.kind,
                                entity_id = %event.entity_id,
                                "Change event received"
                            );
                            registry.invalidate(&event.entity).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Change feed lagged, invalidating all caches");
                            registry.invalidate_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Change feed closed, stopping listener");
                            break;
                        }
                    },
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_online = *online.borrow();
                        if now_online && !was_online {
                            info!("Connectivity restored, invalidating caches for refetch");
                            registry.invalidate_all().await;
                        }
                        was_online = now_online;
                    }
                }
            }
        })
    }
}
