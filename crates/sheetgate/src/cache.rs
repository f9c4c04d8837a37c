//! Range cache with TTL expiry, rectangle-precise invalidation and global LRU
//! eviction under a memory ceiling.
//!
//! Entries are sharded per object id, each shard an unbounded [`LruCache`]
//! behind its own mutex. A process-wide access tick stamped on every hit lets
//! eviction find the least recently used entry across all shards, so eviction
//! order is strict LRU even though locking is per object.
//!
//! Every invalidation bumps a per-object write epoch before it removes
//! anything. A reader takes [`RangeCache::write_epoch`] before it goes to the
//! backend and stores with [`RangeCache::put_if_unchanged`], which refuses the
//! values if a write landed in between.

use crate::config::CacheConfig;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sheetgate_common::{Grid, GridRange, RenderMode, SheetId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub range: GridRange,
    pub render: RenderMode,
}

#[derive(Debug)]
struct Entry {
    values: Arc<Grid>,
    inserted_at: Instant,
    ttl: Duration,
    bytes: usize,
    tick: u64,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

type Shard = Mutex<LruCache<CacheKey, Entry>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub entry_count: usize,
    pub bytes: usize,
    pub hit_rate: f64,
}

#[derive(Debug)]
pub struct RangeCache {
    shards: DashMap<String, Shard>,
    epochs: DashMap<String, u64>,
    config: CacheConfig,
    tick: AtomicU64,
    entries: AtomicUsize,
    bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl RangeCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shards: DashMap::new(),
            epochs: DashMap::new(),
            config,
            tick: AtomicU64::new(0),
            entries: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn forget(&self, entry: &Entry) {
        self.entries.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
    }

    /// Fresh values for `range`. An exact entry is preferred; otherwise a fresh
    /// entry whose range contains `range` is sliced. Never blocks on I/O.
    pub fn get(&self, object_id: &str, range: &GridRange, render: RenderMode) -> Option<Arc<Grid>> {
        let now = Instant::now();
        let key = CacheKey {
            range: *range,
            render,
        };
        let Some(shard) = self.shards.get(object_id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let mut lru = shard.lock();

        if let Some(entry) = lru.peek(&key) {
            if entry.is_fresh(now) {
                let tick = self.next_tick();
                if let Some(entry) = lru.get_mut(&key) {
                    entry.tick = tick;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.values.clone());
                }
            } else if let Some(stale) = lru.pop(&key) {
                self.forget(&stale);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        let covering = lru
            .iter()
            .find(|(k, e)| k.render == render && k.range.contains(range) && e.is_fresh(now))
            .map(|(k, _)| *k);
        if let Some(outer) = covering {
            let tick = self.next_tick();
            if let Some(entry) = lru.get_mut(&outer) {
                entry.tick = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                let sliced = entry.values.slice(
                    (range.start_row - outer.range.start_row) as usize,
                    (range.start_col - outer.range.start_col) as usize,
                    range.height() as usize,
                    range.width() as usize,
                );
                return Some(Arc::new(sliced));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, object_id: &str, range: GridRange, render: RenderMode, values: Grid) {
        self.put_with_ttl(object_id, range, render, values, self.config.default_ttl());
    }

    pub fn put_with_ttl(
        &self,
        object_id: &str,
        range: GridRange,
        render: RenderMode,
        values: Grid,
        ttl: Duration,
    ) {
        self.insert(object_id, CacheKey { range, render }, values, ttl, None);
    }

    /// Invalidations seen so far for `object_id`.
    pub fn write_epoch(&self, object_id: &str) -> u64 {
        self.epochs.get(object_id).map(|e| *e).unwrap_or(0)
    }

    /// Store values read while the object's write epoch was `epoch`. Returns
    /// false, storing nothing, if the object was invalidated since.
    pub fn put_if_unchanged(
        &self,
        object_id: &str,
        range: GridRange,
        render: RenderMode,
        values: Grid,
        epoch: u64,
    ) -> bool {
        let ttl = self.config.default_ttl();
        self.insert(object_id, CacheKey { range, render }, values, ttl, Some(epoch))
    }

    fn insert(
        &self,
        object_id: &str,
        key: CacheKey,
        values: Grid,
        ttl: Duration,
        epoch: Option<u64>,
    ) -> bool {
        let bytes = values.approx_bytes() + std::mem::size_of::<Entry>();
        let entry = Entry {
            values: Arc::new(values),
            inserted_at: Instant::now(),
            ttl,
            bytes,
            tick: self.next_tick(),
        };
        let stored = {
            let shard = self
                .shards
                .entry(object_id.to_string())
                .or_insert_with(|| Mutex::new(LruCache::unbounded()));
            let mut lru = shard.lock();
            // Checked under the shard lock: an invalidation bumps the epoch
            // before it takes this lock to remove entries.
            if epoch.is_some_and(|e| e != self.write_epoch(object_id)) {
                false
            } else {
                if let Some(old) = lru.put(key, entry) {
                    self.forget(&old);
                }
                self.entries.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(bytes, Ordering::Relaxed);
                true
            }
        };
        if stored {
            self.evict_to_fit();
        } else {
            self.drop_if_empty(object_id);
        }
        stored
    }

    fn drop_if_empty(&self, object_id: &str) {
        self.shards.remove_if(object_id, |_, shard| shard.lock().is_empty());
    }

    fn over_budget(&self) -> bool {
        self.bytes.load(Ordering::Relaxed) > self.config.max_bytes
            || self
                .config
                .max_entries
                .is_some_and(|max| self.entries.load(Ordering::Relaxed) > max)
    }

    /// Pop globally least recently used entries until under budget.
    fn evict_to_fit(&self) {
        while self.over_budget() {
            let oldest = self
                .shards
                .iter()
                .filter_map(|shard| {
                    let lru = shard.value().lock();
                    lru.peek_lru().map(|(_, e)| (shard.key().clone(), e.tick))
                })
                .min_by_key(|(_, tick)| *tick);
            let Some((object_id, tick)) = oldest else {
                return;
            };
            if let Some(shard) = self.shards.get(&object_id) {
                let mut lru = shard.lock();
                if lru.peek_lru().is_some_and(|(_, e)| e.tick == tick) {
                    if let Some((_, evicted)) = lru.pop_lru() {
                        self.forget(&evicted);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            self.drop_if_empty(&object_id);
        }
    }

    fn invalidate_where(&self, object_id: &str, mut stale: impl FnMut(&CacheKey) -> bool) -> usize {
        *self.epochs.entry(object_id.to_string()).or_insert(0) += 1;
        let removed = {
            let Some(shard) = self.shards.get(object_id) else {
                return 0;
            };
            let mut lru = shard.lock();
            let doomed: Vec<CacheKey> = lru.iter().map(|(k, _)| *k).filter(|k| stale(k)).collect();
            for key in &doomed {
                if let Some(entry) = lru.pop(key) {
                    self.forget(&entry);
                }
            }
            doomed.len()
        };
        self.drop_if_empty(object_id);
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop entries on `object_id` whose rectangle intersects `written` on both
    /// axes. Entries that merely share the sheet survive.
    pub fn invalidate_overlapping(&self, object_id: &str, written: &GridRange) -> usize {
        let n = self.invalidate_where(object_id, |k| k.range.intersects(written));
        #[cfg(feature = "tracing")]
        tracing::debug!(object_id, range = %written, invalidated = n, "cache invalidation");
        n
    }

    /// Drop every entry on one sheet (structural changes shift coordinates).
    pub fn invalidate_sheet(&self, object_id: &str, sheet_id: SheetId) -> usize {
        self.invalidate_where(object_id, |k| k.range.sheet_id == sheet_id)
    }

    pub fn invalidate_object(&self, object_id: &str) -> usize {
        self.invalidate_where(object_id, |_| true)
    }

    /// Remove expired entries without waiting for a lookup to find them.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        let mut emptied = Vec::new();
        for shard in self.shards.iter() {
            let mut lru = shard.value().lock();
            let expired: Vec<CacheKey> = lru
                .iter()
                .filter(|(_, e)| !e.is_fresh(now))
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(entry) = lru.pop(&key) {
                    self.forget(&entry);
                    purged += 1;
                }
            }
            if lru.is_empty() {
                emptied.push(shard.key().clone());
            }
        }
        for object_id in emptied {
            self.drop_if_empty(&object_id);
        }
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Cached ranges for `object_id`, most recently used first.
    pub fn ranges(&self, object_id: &str) -> Vec<GridRange> {
        self.shards
            .get(object_id)
            .map(|shard| shard.lock().iter().map(|(k, _)| k.range).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, object_id: &str, range: &GridRange, render: RenderMode) -> bool {
        self.shards.get(object_id).is_some_and(|shard| {
            shard.lock().contains(&CacheKey {
                range: *range,
                render,
            })
        })
    }

    /// Objects with at least one cached entry.
    pub fn object_count(&self) -> usize {
        self.shards.len()
    }

    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entry_count: self.len(),
            bytes: self.bytes.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetgate_common::CellValue;

    const F: RenderMode = RenderMode::Formatted;

    fn a1(sr: u32, sc: u32, er: u32, ec: u32) -> GridRange {
        GridRange::new(0, sr, sc, er, ec).unwrap()
    }

    fn grid(h: usize, w: usize) -> Grid {
        Grid::filled(h, w, CellValue::Int(1))
    }

    fn cache() -> RangeCache {
        RangeCache::new(CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_instead_of_going_stale() {
        let c = cache();
        c.put_with_ttl("o", a1(0, 0, 0, 0), F, grid(1, 1), Duration::from_secs(10));
        assert!(c.get("o", &a1(0, 0, 0, 0), F).is_some());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(c.get("o", &a1(0, 0, 0, 0), F).is_none());
        let s = c.stats();
        assert_eq!((s.hits, s.misses, s.expirations, s.entry_count), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn render_mode_is_part_of_the_key() {
        let c = cache();
        c.put("o", a1(0, 0, 0, 0), F, grid(1, 1));
        assert!(c.get("o", &a1(0, 0, 0, 0), RenderMode::Formula).is_none());
    }

    #[tokio::test]
    async fn sub_ranges_are_sliced_from_covering_entries() {
        let c = cache();
        let mut values = grid(3, 3);
        values.set(2, 1, CellValue::Int(42));
        c.put("o", a1(0, 0, 2, 2), F, values);
        let got = c.get("o", &a1(2, 1, 2, 1), F).unwrap();
        assert_eq!(got.get(0, 0), &CellValue::Int(42));
        assert_eq!(c.stats().hits, 1);
    }

    #[tokio::test]
    async fn invalidation_is_rectangle_precise() {
        let c = cache();
        // A1:B10 and D1:E10, then write A1:A10.
        c.put("o", a1(0, 0, 9, 1), F, grid(10, 2));
        c.put("o", a1(0, 3, 9, 4), F, grid(10, 2));
        assert_eq!(c.invalidate_overlapping("o", &a1(0, 0, 9, 0)), 1);
        assert!(!c.contains("o", &a1(0, 0, 9, 1), F));
        assert!(c.contains("o", &a1(0, 3, 9, 4), F));
        assert_eq!(c.stats().entry_count, 1);
    }

    #[tokio::test]
    async fn partial_overlap_on_either_side_is_evicted() {
        let c = cache();
        c.put("o", a1(0, 0, 4, 1), F, grid(5, 2)); // A1:B5
        c.put("o", a1(0, 2, 4, 3), F, grid(5, 2)); // C1:D5
        c.put("o", a1(0, 4, 10, 5), F, grid(11, 2)); // E1:F11
        assert_eq!(c.invalidate_overlapping("o", &a1(2, 1, 7, 2)), 2); // B3:C8
        assert_eq!(c.ranges("o"), vec![a1(0, 4, 10, 5)]);
        assert_eq!(c.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn other_objects_and_sheets_are_untouched() {
        let c = cache();
        c.put("o", a1(0, 0, 9, 1), F, grid(10, 2));
        c.put("p", a1(0, 0, 9, 1), F, grid(10, 2));
        c.put("o", GridRange::new(1, 0, 0, 9, 1).unwrap(), F, grid(10, 2));
        assert_eq!(c.invalidate_overlapping("o", &a1(0, 0, 0, 0)), 1);
        assert_eq!(c.len(), 2);
        assert_eq!(c.invalidate_sheet("o", 1), 1);
        assert_eq!(c.invalidate_object("p"), 1);
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn reads_started_before_a_write_are_not_stored() {
        let c = cache();
        let epoch = c.write_epoch("o");
        c.invalidate_overlapping("o", &a1(5, 5, 5, 5));
        assert!(!c.put_if_unchanged("o", a1(0, 0, 0, 0), F, grid(1, 1), epoch));
        assert!(c.is_empty());
        assert_eq!(c.object_count(), 0);
        // Writes to other objects do not count.
        let epoch = c.write_epoch("o");
        c.invalidate_object("p");
        assert!(c.put_if_unchanged("o", a1(0, 0, 0, 0), F, grid(1, 1), epoch));
        assert!(c.contains("o", &a1(0, 0, 0, 0), F));
    }

    #[tokio::test(start_paused = true)]
    async fn emptied_objects_release_their_shard() {
        let c = cache();
        c.put("o", a1(0, 0, 0, 0), F, grid(1, 1));
        c.put_with_ttl("p", a1(0, 0, 0, 0), F, grid(1, 1), Duration::from_secs(1));
        c.put("q", a1(0, 0, 0, 0), F, grid(1, 1));
        assert_eq!(c.object_count(), 3);
        c.invalidate_object("o");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(c.purge_expired(), 1);
        assert_eq!(c.object_count(), 1);
        assert_eq!(c.ranges("q"), vec![a1(0, 0, 0, 0)]);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_across_objects() {
        let c = RangeCache::new(CacheConfig {
            max_entries: Some(2),
            ..Default::default()
        });
        c.put("o", a1(0, 0, 0, 0), F, grid(1, 1));
        c.put("p", a1(0, 0, 0, 0), F, grid(1, 1));
        // Touch the older entry so the other becomes LRU.
        assert!(c.get("o", &a1(0, 0, 0, 0), F).is_some());
        c.put("q", a1(0, 0, 0, 0), F, grid(1, 1));
        assert!(c.contains("o", &a1(0, 0, 0, 0), F));
        assert!(!c.contains("p", &a1(0, 0, 0, 0), F));
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test]
    async fn memory_ceiling_is_enforced() {
        let c = RangeCache::new(CacheConfig {
            max_bytes: 4096,
            ..Default::default()
        });
        for row in 0..50 {
            c.put("o", a1(row, 0, row, 9), F, grid(1, 10));
        }
        let s = c.stats();
        assert!(s.bytes <= 4096, "{s:?}");
        assert!(s.evictions > 0);
        // Newest entry survives.
        assert!(c.contains("o", &a1(49, 0, 49, 9), F));
    }
}
