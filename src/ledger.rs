//! Integrity-chained ledger for critical writes
//!
//! Durable append-only log of the writes that must never be lost
//! (completed sales). Each entry is hash-linked to its predecessor, so
//! the record of when a transaction actually happened can be checked for
//! corruption after the fact.
//!
//! ## Guarantee
//!
//! The chain uses a fast CRC checksum, not a cryptographic hash. It
//! detects accidental corruption of a stored entry; it does not resist a
//! deliberate attacker, who could rewrite an entry and its checksum
//! together. Deleting or reordering whole entries, or rewriting the
//! store consistently, is likewise not detected. This is a known,
//! accepted limitation.
//!
//! ## Storage layout
//!
//! ```text
//! ledger.sled
//! ├── entries   seq (u64 BE) -> LedgerEntry (rmp)
//! ├── ids       entry id -> seq
//! ├── gaps      seq -> predecessor hash, for entries whose physical
//! │             predecessor was purged
//! └── meta      "chain_head" -> hash of the newest entry
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::canonical::canonical_json;
use crate::error::SyncError;

/// Chain pointer value before any entry exists.
pub const GENESIS_HASH: &str = "genesis";

const KEY_CHAIN_HEAD: &[u8] = b"chain_head";

/// One critical write, recorded at its true origination time.
///
/// Once appended, `payload`, `offline_created_at` and `integrity_hash`
/// are immutable; only the sync bookkeeping fields change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id (uuid v4)
    pub id: String,
    /// Opaque record payload
    pub payload: Value,
    /// Device-clock timestamp at creation
    pub offline_created_at: DateTime<Utc>,
    /// Checksum over predecessor hash, id, timestamp and payload
    pub integrity_hash: String,
    /// Whether the entry reached the backend
    pub synced: bool,
    /// Server timestamp of the confirmed sync
    pub synced_at: Option<DateTime<Utc>>,
    /// Sync attempts so far
    pub retry_count: u32,
    /// Last sync failure, if any
    pub last_error: Option<String>,
}

/// Ledger statistics
#[derive(Debug, Clone)]
pub struct LedgerStats {
    pub total: u64,
    pub pending: u64,
    pub synced: u64,
}

/// Chain checksum: `H(prev | id | created-at millis | canonical payload)`.
fn chain_hash(prev: &str, id: &str, created_at: DateTime<Utc>, payload: &Value) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(prev.as_bytes());
    hasher.update(b"|");
    hasher.update(id.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.timestamp_millis().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize().to_be_bytes())
}

/// Append-only hash-chained ledger backed by sled.
pub struct Ledger {
    db: sled::Db,
    entries: sled::Tree,
    ids: sled::Tree,
    gaps: sled::Tree,
    meta: sled::Tree,
    /// Serializes every read-compute-write of the chain pointer and of
    /// entry rows. Appends from concurrent call sites must not
    /// interleave here.
    write_lock: Mutex<()>,
}

impl Ledger {
    /// Open or create the ledger database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(path.as_ref())?;
        let entries = db.open_tree("entries")?;
        let ids = db.open_tree("ids")?;
        let gaps = db.open_tree("gaps")?;
        let meta = db.open_tree("meta")?;

        info!(path = %path.as_ref().display(), "Opened ledger database");

        Ok(Self {
            db,
            entries,
            ids,
            gaps,
            meta,
            write_lock: Mutex::new(()),
        })
    }

    /// Append a critical write.
    ///
    /// Stamps the device-clock creation time, chains the entry to the
    /// current head and durably commits both the entry and the advanced
    /// chain pointer before returning.
    pub async fn append(&self, payload: Value) -> Result<LedgerEntry, SyncError> {
        let _guard = self.write_lock.lock().await;

        let prev = self.chain_head()?;
        let id = uuid::Uuid::new_v4().to_string();
        let offline_created_at = Utc::now();
        let integrity_hash = chain_hash(&prev, &id, offline_created_at, &payload);

        let entry = LedgerEntry {
            id: id.clone(),
            payload,
            offline_created_at,
            integrity_hash: integrity_hash.clone(),
            synced: false,
            synced_at: None,
            retry_count: 0,
            last_error: None,
        };

        let seq = self.next_seq()?;
        let bytes = encode_entry(&entry)?;
        self.entries.insert(seq.to_be_bytes(), bytes)?;
        self.ids.insert(id.as_bytes(), &seq.to_be_bytes()[..])?;
        self.meta.insert(KEY_CHAIN_HEAD, integrity_hash.as_bytes())?;
        self.db.flush_async().await?;

        debug!(id = %entry.id, hash = %entry.integrity_hash, "Ledger entry appended");
        Ok(entry)
    }

    /// Current chain pointer: hash of the newest entry, or the genesis
    /// sentinel if none exist.
    pub fn chain_head(&self) -> Result<String, SyncError> {
        match self.meta.get(KEY_CHAIN_HEAD)? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| SyncError::Serialization(format!("chain head: {}", e))),
            None => Ok(GENESIS_HASH.to_string()),
        }
    }

    /// Entries not yet confirmed by the backend, oldest first.
    pub fn list_pending(&self) -> Result<Vec<LedgerEntry>, SyncError> {
        let mut pending = Vec::new();
        for item in self.entries.iter() {
            let (_, value) = item?;
            let entry = decode_entry(&value)?;
            if !entry.synced {
                pending.push(entry);
            }
        }
        Ok(pending)
    }

    /// Get an entry by id
    pub fn get(&self, id: &str) -> Result<Option<LedgerEntry>, SyncError> {
        match self.ids.get(id.as_bytes())? {
            Some(seq) => match self.entries.get(&seq)? {
                Some(value) => Ok(Some(decode_entry(&value)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Record a confirmed sync. The hash fields are not touched.
    pub async fn mark_synced(
        &self,
        id: &str,
        server_timestamp: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;

        let (seq, mut entry) = self.load_by_id(id)?;
        entry.synced = true;
        entry.synced_at = Some(server_timestamp);
        self.entries.insert(&seq, encode_entry(&entry)?)?;
        self.db.flush_async().await?;

        debug!(id = %id, synced_at = %server_timestamp, "Ledger entry synced");
        Ok(())
    }

    /// Record a failed sync attempt. The entry stays pending: there is no
    /// maximum retry count, a critical write is never dropped.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;

        let (seq, mut entry) = self.load_by_id(id)?;
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        self.entries.insert(&seq, encode_entry(&entry)?)?;

        debug!(id = %id, retry_count = entry.retry_count, "Ledger entry sync failed");
        Ok(())
    }

    /// Walk the chain in append order and return the ids of corrupted
    /// entries.
    ///
    /// Each entry is checked against its predecessor's *stored* hash, not
    /// a freshly recomputed one, so corrupting a single entry's payload
    /// flags exactly that entry and does not cascade to every later one.
    pub fn verify_chain(&self) -> Result<Vec<String>, SyncError> {
        let mut corrupted = Vec::new();
        let mut prev = GENESIS_HASH.to_string();

        for item in self.entries.iter() {
            let (key, value) = item?;
            let entry = decode_entry(&value)?;

            // A purged physical predecessor leaves its hash behind as a
            // gap marker; the walk resumes from it.
            if let Some(gap) = self.gaps.get(&key)? {
                prev = String::from_utf8(gap.to_vec())
                    .map_err(|e| SyncError::Serialization(format!("gap marker: {}", e)))?;
            }

            let expected = chain_hash(&prev, &entry.id, entry.offline_created_at, &entry.payload);
            if expected != entry.integrity_hash {
                corrupted.push(entry.id.clone());
            }

            prev = entry.integrity_hash;
        }

        Ok(corrupted)
    }

    /// [`verify_chain`](Self::verify_chain) as an audit gate: error if
    /// anything is corrupted.
    pub fn ensure_intact(&self) -> Result<(), SyncError> {
        let corrupted = self.verify_chain()?;
        if corrupted.is_empty() {
            Ok(())
        } else {
            Err(SyncError::ChainIntegrity { entries: corrupted })
        }
    }

    /// Delete synced entries whose confirmed sync is older than `cutoff`.
    ///
    /// Unsynced entries are never removed, regardless of age. When an
    /// entry with a surviving successor is purged, its hash is recorded
    /// as a gap marker so the verify walk stays coherent.
    pub async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize, SyncError> {
        let _guard = self.write_lock.lock().await;

        let mut scan = Vec::new();
        for item in self.entries.iter() {
            let (key, value) = item?;
            scan.push((key, decode_entry(&value)?));
        }

        let mut removed = 0usize;
        let mut pending_gap: Option<String> = None;

        for (key, entry) in scan {
            let purge = entry.synced && entry.synced_at.map(|t| t < cutoff).unwrap_or(false);
            if purge {
                self.entries.remove(&key)?;
                self.ids.remove(entry.id.as_bytes())?;
                self.gaps.remove(&key)?;
                pending_gap = Some(entry.integrity_hash);
                removed += 1;
            } else if let Some(hash) = pending_gap.take() {
                self.gaps.insert(&key, hash.as_bytes())?;
            }
        }

        if removed > 0 {
            self.db.flush_async().await?;
            info!(removed = removed, cutoff = %cutoff, "Purged synced ledger entries");
        }

        Ok(removed)
    }

    /// Get ledger statistics
    pub fn stats(&self) -> Result<LedgerStats, SyncError> {
        let mut total = 0u64;
        let mut pending = 0u64;

        for item in self.entries.iter() {
            let (_, value) = item?;
            let entry = decode_entry(&value)?;
            total += 1;
            if !entry.synced {
                pending += 1;
            }
        }

        Ok(LedgerStats {
            total,
            pending,
            synced: total - pending,
        })
    }

    /// Flush changes to disk
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn load_by_id(&self, id: &str) -> Result<(sled::IVec, LedgerEntry), SyncError> {
        let seq = self
            .ids
            .get(id.as_bytes())?
            .ok_or_else(|| SyncError::NotFound(format!("ledger entry {}", id)))?;
        let value = self
            .entries
            .get(&seq)?
            .ok_or_else(|| SyncError::NotFound(format!("ledger entry {}", id)))?;
        Ok((seq, decode_entry(&value)?))
    }

    fn next_seq(&self) -> Result<u64, SyncError> {
        match self.entries.last()? {
            Some((key, _)) => Ok(parse_seq(&key)? + 1),
            None => Ok(0),
        }
    }
}

fn parse_seq(key: &[u8]) -> Result<u64, SyncError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| SyncError::Serialization("malformed ledger sequence key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode_entry(entry: &LedgerEntry) -> Result<Vec<u8>, SyncError> {
    rmp_serde::to_vec(entry).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn decode_entry(bytes: &[u8]) -> Result<LedgerEntry, SyncError> {
    rmp_serde::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}
