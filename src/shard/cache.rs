//! Per-shard query result cache
//!
//! Keyed by a fingerprint of the normalized query plus the requested
//! amount. Entries remember the snapshot version they were computed
//! against; a lookup against a newer version misses, so a commit lazily
//! invalidates everything cached for the shard without a sweep. Pinned
//! entries (warming searches, known-hot queries) sit outside the LRU and
//! are never evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use moka::sync::Cache;

use crate::types::{SearchQuery, ShardQueryResult};

/// Fingerprint of everything that affects a query's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryCacheKey {
    fingerprint: u64,
    pinned: bool,
}

impl QueryCacheKey {
    /// Fingerprint the canonical serialization of the query. Every result
    /// -affecting request field lives in `SearchQuery`, so two requests
    /// with equal fingerprints are interchangeable.
    pub fn new(query: &SearchQuery, amount: usize, pinned: bool) -> Self {
        let canonical =
            serde_json::to_vec(&(query, amount)).expect("search query serializes");
        Self {
            fingerprint: seahash::hash(&canonical),
            pinned,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

struct CachedEntry {
    snapshot_version: u64,
    result: ShardQueryResult,
}

pub struct QueryResultCache {
    cache: Cache<QueryCacheKey, Arc<CachedEntry>>,
    pinned: DashMap<QueryCacheKey, Arc<CachedEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryResultCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            cache: Cache::new(max_entries),
            pinned: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached result valid for `snapshot_version`.
    pub fn get(&self, key: &QueryCacheKey, snapshot_version: u64) -> Option<ShardQueryResult> {
        let entry = self
            .pinned
            .get(key)
            .map(|e| e.value().clone())
            .or_else(|| self.cache.get(key));

        match entry {
            Some(entry) if entry.snapshot_version == snapshot_version => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: QueryCacheKey, snapshot_version: u64, result: ShardQueryResult) {
        let entry = Arc::new(CachedEntry {
            snapshot_version,
            result,
        });
        if key.is_pinned() {
            self.pinned.insert(key, entry);
        } else {
            self.cache.insert(key, entry);
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.pinned.clear();
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
