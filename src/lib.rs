//! Till Sync - offline-first write path for point-of-sale clients
//!
//! Staff keep billing while disconnected; no write is silently lost or
//! duplicated; and the record of when a transaction actually happened is
//! kept apart from when it reached the backend.
//!
//! ## Architecture
//!
//! ```text
//! UI write
//!    ↓
//! MutationDispatcher ──online──→ backend ──→ refetch → EntityCache
//!    └─offline─→ MutationQueue (durable) + optimistic EntityCache write
//!
//! Critical writes (completed sales) → Ledger: append-only, hash-chained
//!
//! SyncWorker        replays Ledger + MutationQueue on reconnect/interval
//! ChangeFeedListener backend row changes → cache invalidation → refetch
//! ```
//!
//! Reads flow one way (backend → cache → UI); writes flow through the
//! dispatcher, which is the only component touching both the queue and
//! the caches.
//!
//! ## Storage layout
//!
//! ```text
//! <data_dir>/
//! ├── ledger.sled   # chained ledger entries, chain head
//! ├── queue.sled    # pending mutations, FIFO
//! └── config.toml   # configuration
//! ```
//!
//! ## Integrity guarantee
//!
//! The ledger chain detects accidental corruption of stored entries. It
//! is not cryptographic and does not resist deliberate tampering; see
//! the [`ledger`] module docs.

pub mod backend;
pub mod cache;
pub mod canonical;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod queue;
pub mod replay;

// Re-exports
pub use backend::{ChangeEvent, ChangeFeedHub, ChangeKind, ConnectivityMonitor, EntityBackend};
pub use cache::{CacheCollection, CacheRecord, CacheRegistry, EntityCache, InvalidationTarget};
pub use canonical::{canonical_bytes, canonical_json};
pub use config::Config;
pub use dispatch::{
    CriticalBackend, CriticalDispatchResult, CriticalDispatcher, DispatchResult, EntityStrategy,
    MutationDispatcher,
};
pub use error::SyncError;
pub use feed::ChangeFeedListener;
pub use ledger::{Ledger, LedgerEntry, LedgerStats, GENESIS_HASH};
pub use queue::{MutationOp, MutationQueue, PendingMutation};
pub use replay::{
    LedgerSink, MutationReplayer, SyncEvent, SyncPassSummary, SyncWorker,
};
