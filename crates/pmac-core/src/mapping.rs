//! Mapping table -- plan entity ↔ remote id per tracker, with the hash both
//! sides agreed on at the last successful sync.
//!
//! Persists a JSON document (default `.pmac/mapping.json`). Writes use the
//! `.tmp` + rename pattern so a crash never leaves a half-written file.
//!
//! Writers hold a [`PairClaim`] for the (entity, tracker) pair they touch.
//! A second claim on the same pair fails fast with
//! [`MappingError::SyncInProgress`]; there is no table-wide lock.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::ContentHash;
use crate::plan::{EntityKey, EntityKind};
use crate::tracker::TrackerKind;

const FILE_VERSION: u32 = 1;

/// One (entity, tracker) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub entity: EntityKey,
    pub tracker: TrackerKind,
}

impl PairKey {
    pub fn new(entity: EntityKey, tracker: TrackerKind) -> Self {
        Self { entity, tracker }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity, self.tracker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub remote_id: String,
    /// Hash both sides agreed on at the last successful sync.
    pub base_hash: ContentHash,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to access mapping file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize mapping table: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("sync already in progress for {0}")]
    SyncInProgress(PairKey),
}

// ---------------------------------------------------------------------------
// On-disk format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct MappingFile {
    version: u32,
    #[serde(default)]
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    kind: EntityKind,
    id: String,
    tracker: TrackerKind,
    remote_id: String,
    base_hash: ContentHash,
    last_synced_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

type ClaimSet = Arc<Mutex<HashSet<PairKey>>>;

/// Exclusive right to write one pair's mapping entry. Released on drop.
#[derive(Debug)]
pub struct PairClaim {
    key: PairKey,
    claims: ClaimSet,
}

impl PairClaim {
    pub fn key(&self) -> &PairKey {
        &self.key
    }
}

impl Drop for PairClaim {
    fn drop(&mut self) {
        lock(&self.claims).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MappingTable {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<PairKey, MappingEntry>>,
    claims: ClaimSet,
    /// Serializes file writes so the last write always holds every commit.
    io: Mutex<()>,
}

impl MappingTable {
    /// A table that is never written to disk (dry runs, tests).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the table at `path`, or start empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MappingError> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| MappingError::Io {
                path: path.clone(),
                source,
            })?;
            let file: MappingFile =
                serde_json::from_str(&contents).map_err(|source| MappingError::Malformed {
                    path: path.clone(),
                    source,
                })?;
            file.entries
                .into_iter()
                .map(|e| {
                    (
                        PairKey::new(EntityKey::new(e.kind, e.id), e.tracker),
                        MappingEntry {
                            remote_id: e.remote_id,
                            base_hash: e.base_hash,
                            last_synced_at: e.last_synced_at,
                        },
                    )
                })
                .collect()
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "opened mapping table");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
            ..Self::default()
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &PairKey) -> Option<MappingEntry> {
        lock(&self.entries).get(key).cloned()
    }

    /// Copy of every entry, ordered by (entity, tracker).
    pub fn snapshot(&self) -> BTreeMap<PairKey, MappingEntry> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Claim `key` for writing.
    pub fn claim(&self, key: PairKey) -> Result<PairClaim, MappingError> {
        let mut claims = lock(&self.claims);
        if !claims.insert(key.clone()) {
            return Err(MappingError::SyncInProgress(key));
        }
        Ok(PairClaim {
            key,
            claims: Arc::clone(&self.claims),
        })
    }

    /// Record a successful sync for the claimed pair and persist.
    ///
    /// If the file cannot be written the in-memory entry is rolled back, so
    /// memory never runs ahead of disk.
    pub fn commit(&self, claim: &PairClaim, entry: MappingEntry) -> Result<(), MappingError> {
        let previous = lock(&self.entries).insert(claim.key.clone(), entry);
        if let Err(err) = self.persist() {
            let mut entries = lock(&self.entries);
            match previous {
                Some(prev) => entries.insert(claim.key.clone(), prev),
                None => entries.remove(&claim.key),
            };
            return Err(err);
        }
        tracing::debug!(pair = %claim.key, "committed mapping entry");
        Ok(())
    }

    /// Remove the claimed pair's entry and persist. Returns the removed entry.
    pub fn unlink(&self, claim: &PairClaim) -> Result<Option<MappingEntry>, MappingError> {
        let removed = lock(&self.entries).remove(&claim.key);
        if removed.is_some() {
            if let Err(err) = self.persist() {
                if let Some(prev) = removed {
                    lock(&self.entries).insert(claim.key.clone(), prev);
                }
                return Err(err);
            }
            tracing::info!(pair = %claim.key, "unlinked mapping entry");
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), MappingError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _io = lock(&self.io);
        let file = MappingFile {
            version: FILE_VERSION,
            entries: lock(&self.entries)
                .iter()
                .map(|(key, entry)| StoredEntry {
                    kind: key.entity.kind,
                    id: key.entity.id.clone(),
                    tracker: key.tracker,
                    remote_id: entry.remote_id.clone(),
                    base_hash: entry.base_hash.clone(),
                    last_synced_at: entry.last_synced_at,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(MappingError::Serialize)?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| MappingError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| MappingError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| MappingError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }
}
