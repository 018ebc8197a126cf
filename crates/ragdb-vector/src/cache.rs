use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use ragdb_core::config::CacheConfig;
use ragdb_core::types::Meta;
use ragdb_core::{Error, Result};

pub type CacheKey = blake3::Hash;

/// Lower-case, trim and collapse runs of whitespace.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Key over everything that changes the answer to a query.
pub fn cache_key(query: &str, collection: &str, k: usize, filters: Option<&Meta>, model: &str) -> CacheKey {
    let mut h = blake3::Hasher::new();
    for part in [normalize_query(query).as_str(), collection, model] {
        h.update(&(part.len() as u64).to_le_bytes());
        h.update(part.as_bytes());
    }
    h.update(&(k as u64).to_le_bytes());
    // Meta is a BTreeMap, so iteration order is already canonical.
    for (key, value) in filters.into_iter().flatten() {
        h.update(&(key.len() as u64).to_le_bytes());
        h.update(key.as_bytes());
        h.update(&(value.len() as u64).to_le_bytes());
        h.update(value.as_bytes());
    }
    h.finalize()
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Partition<V> {
    generation: AtomicU64,
    entries: Mutex<LruCache<CacheKey, Entry<V>>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub conflicts: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    conflicts: AtomicU64,
}

/// Per-collection LRU query cache with optional TTL.
///
/// Each collection owns a partition with its own lock and a generation
/// counter. `invalidate` bumps the generation and empties the partition; a
/// `put` made with an older generation is refused, so a result computed
/// against a pre-ingestion index never lands in the cache.
pub struct RetrievalCache<V> {
    partitions: DashMap<String, Arc<Partition<V>>>,
    capacity: NonZeroUsize,
    ttl: Option<Duration>,
    counters: Counters,
}

impl<V: Clone> RetrievalCache<V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            partitions: DashMap::new(),
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            ttl,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.ttl())
    }

    fn partition(&self, collection: &str) -> Arc<Partition<V>> {
        if let Some(p) = self.partitions.get(collection) {
            return p.clone();
        }
        self.partitions
            .entry(collection.to_string())
            .or_insert_with(|| {
                Arc::new(Partition { generation: AtomicU64::new(0), entries: Mutex::new(LruCache::new(self.capacity)) })
            })
            .clone()
    }

    /// Current generation of the collection's partition. Read it before
    /// computing a result and hand it back to `put`.
    pub fn generation(&self, collection: &str) -> u64 {
        self.partition(collection).generation.load(Ordering::Acquire)
    }

    pub fn get(&self, collection: &str, key: &CacheKey) -> Option<V> {
        let partition = self.partition(collection);
        let mut entries = partition.entries.lock();
        let expired = match entries.get(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(e) => self.ttl.is_some_and(|ttl| e.inserted_at.elapsed() >= ttl),
        };
        if expired {
            entries.pop(key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(key).map(|e| e.value.clone())
    }

    /// Store `value` if the partition is still at `generation`.
    pub fn put(&self, collection: &str, key: CacheKey, value: V, generation: u64) -> Result<()> {
        let partition = self.partition(collection);
        let mut entries = partition.entries.lock();
        let current = partition.generation.load(Ordering::Acquire);
        if current != generation {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::CacheInvalidationConflict { collection: collection.to_string() });
        }
        if let Some((old_key, _)) = entries.push(key, Entry { value, inserted_at: Instant::now() }) {
            if old_key != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Drop every entry for `collection` and move its generation forward.
    pub fn invalidate(&self, collection: &str) {
        let partition = self.partition(collection);
        let mut entries = partition.entries.lock();
        let generation = partition.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let dropped = entries.len();
        entries.clear();
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(collection, generation, dropped, "cache partition invalidated");
    }

    /// Invalidate and forget the partition entirely.
    pub fn remove_partition(&self, collection: &str) {
        self.invalidate(collection);
        self.partitions.remove(collection);
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.partitions.iter().map(|p| p.value().entries.lock().len()).sum();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            entries,
        }
    }
}
