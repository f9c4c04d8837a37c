//! ConflictVersion bookkeeping for the external conflict-detection consumer.
//!
//! Versions are recorded opportunistically: whenever a read or write through
//! this layer already has the range contents in hand, the checksum is computed
//! and stored. Nothing here ever blocks on the consumer. The registry is
//! bounded: least recently recorded versions are evicted past
//! `conflicts.max_entries`, and versions older than `conflicts.ttl_ms` are
//! dropped.

use crate::config::ConflictConfig;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sheetgate_common::{Grid, GridRange};
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictVersion {
    pub last_modified: DateTime<Utc>,
    pub modifier_id: String,
    pub checksum: String,
}

/// Hex SHA-256 over the rendered values of `grid`, row by row.
///
/// Trailing empty cells and rows do not affect the checksum, so a backend that
/// trims them produces the same value as one that does not.
pub fn checksum_grid(grid: &Grid) -> String {
    let mut hasher = Sha256::new();
    let rows = grid
        .rows
        .iter()
        .rposition(|row| row.iter().any(|v| !v.is_empty()))
        .map_or(0, |last| last + 1);
    for row in &grid.rows[..rows] {
        let len = row
            .iter()
            .rposition(|v| !v.is_empty())
            .map_or(0, |last| last + 1);
        for value in &row[..len] {
            let rendered = value.rendered();
            hasher.update((rendered.len() as u64).to_le_bytes());
            hasher.update(rendered.as_bytes());
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

struct Registry {
    versions: LruCache<(String, GridRange), (ConflictVersion, Instant)>,
    epochs: FxHashMap<String, u64>,
}

impl Registry {
    fn bump(&mut self, object_id: &str) {
        *self.epochs.entry(object_id.to_string()).or_insert(0) += 1;
    }

    fn remove_where(&mut self, mut doomed: impl FnMut(&(String, GridRange)) -> bool) -> usize {
        let keys: Vec<_> = self
            .versions
            .iter()
            .filter(|(k, _)| doomed(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.versions.pop(key);
        }
        keys.len()
    }
}

/// Per-range versions keyed by object, bounded by entry count and age.
///
/// Forgetting a range bumps the object's epoch, and
/// [`ConflictRegistry::record_read`] refuses versions read under an older one.
pub struct ConflictRegistry {
    state: Mutex<Registry>,
    ttl: Duration,
}

impl fmt::Debug for ConflictRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictRegistry")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for ConflictRegistry {
    fn default() -> Self {
        Self::new(&ConflictConfig::default())
    }
}

impl ConflictRegistry {
    pub fn new(config: &ConflictConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(Registry {
                versions: LruCache::new(cap),
                epochs: FxHashMap::default(),
            }),
            ttl: config.ttl(),
        }
    }

    pub fn epoch(&self, object_id: &str) -> u64 {
        self.state.lock().epochs.get(object_id).copied().unwrap_or(0)
    }

    pub fn record(&self, object_id: &str, range: GridRange, version: ConflictVersion) {
        self.state
            .lock()
            .versions
            .put((object_id.to_string(), range), (version, Instant::now()));
    }

    /// Record a version taken from a read issued at `epoch`. Nothing is stored
    /// if a write to the object has been applied since.
    pub fn record_read(
        &self,
        object_id: &str,
        range: GridRange,
        version: ConflictVersion,
        epoch: u64,
    ) -> bool {
        let mut state = self.state.lock();
        if state.epochs.get(object_id).copied().unwrap_or(0) != epoch {
            return false;
        }
        state
            .versions
            .put((object_id.to_string(), range), (version, Instant::now()));
        true
    }

    pub fn get(&self, object_id: &str, range: &GridRange) -> Option<ConflictVersion> {
        let key = (object_id.to_string(), *range);
        let mut state = self.state.lock();
        let fresh = state.versions.get(&key)?.1.elapsed() < self.ttl;
        if fresh {
            state.versions.peek(&key).map(|(v, _)| v.clone())
        } else {
            state.versions.pop(&key);
            None
        }
    }

    /// All live versions recorded for `object_id`, ordered by range.
    pub fn for_object(&self, object_id: &str) -> Vec<(GridRange, ConflictVersion)> {
        let state = self.state.lock();
        let mut out: Vec<_> = state
            .versions
            .iter()
            .filter(|((obj, _), (_, at))| obj == object_id && at.elapsed() < self.ttl)
            .map(|((_, range), (v, _))| (*range, v.clone()))
            .collect();
        out.sort_by_key(|(r, _)| *r);
        out
    }

    /// Drop versions whose range overlaps `written`; they no longer describe
    /// the backend contents. Returns how many were dropped.
    pub fn forget_overlapping(&self, object_id: &str, written: &GridRange) -> usize {
        let mut state = self.state.lock();
        state.bump(object_id);
        state.remove_where(|(obj, range)| obj == object_id && range.intersects(written))
    }

    pub fn forget_object(&self, object_id: &str) {
        let mut state = self.state.lock();
        state.bump(object_id);
        state.remove_where(|(obj, _)| obj == object_id);
    }

    /// Remove versions older than the retention window.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut state = self.state.lock();
        let expired: Vec<_> = state
            .versions
            .iter()
            .filter(|(_, (_, at))| at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.versions.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
