//! Local coherent cache
//!
//! ## Design
//!
//! Each `(thread, namespace)` pair gets its own in-memory map of opaque keys
//! to JSON values. Reads revalidate lazily: at most once per
//! `check_interval`, the cache compares its remembered version against the
//! namespace's row in `beaver_manager_versions` and clears itself on drift.
//! The interval check runs under a short mutex so a burst of reads on one
//! thread does a single registry round-trip.
//!
//! Writers always bump the registry (the bump is not delegated to the
//! cache, so cross-process invalidation works even with caching disabled)
//! and then call [`Cache::sync`] with the fresh version so their own cache
//! survives their own write.
//!
//! A [`DummyCache`] stands in when caching is disabled; it satisfies the
//! same interface and never stores anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

use beaver_core::Result;
use beaver_storage::Storage;

/// Performance counters for a cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from the map.
    pub hits: u64,
    /// Reads that fell through to the database.
    pub misses: u64,
    /// Times the map was discarded due to version drift or an explicit
    /// invalidation.
    pub invalidations: u64,
    /// Values stored.
    pub sets: u64,
    /// Values removed individually.
    pub pops: u64,
}

impl CacheStats {
    /// Total reads (hits + misses).
    pub fn reads(&self) -> u64 {
        self.hits + self.misses
    }

    /// Total operations against the map.
    pub fn operations(&self) -> u64 {
        self.hits + self.misses + self.sets + self.pops
    }

    /// Fraction of reads served from memory, 0.0 when no reads happened.
    pub fn hit_rate(&self) -> f64 {
        if self.reads() == 0 {
            return 0.0;
        }
        self.hits as f64 / self.reads() as f64
    }

    /// Invalidations per operation, 0.0 when idle.
    pub fn invalidation_rate(&self) -> f64 {
        if self.reads() == 0 {
            return 0.0;
        }
        self.invalidations as f64 / self.operations() as f64
    }
}

/// Interface shared by the real and the disabled cache.
pub trait Cache: Send + Sync {
    /// Look up a key, revalidating against the registry first.
    fn get(&self, key: &str) -> Result<Option<Value>>;
    /// Store a computed value.
    fn set(&self, key: &str, value: Value);
    /// Drop a single key.
    fn pop(&self, key: &str);
    /// Discard the whole map and force a registry re-check on next read.
    fn invalidate(&self);
    /// Adopt a registry version just produced by this caller's own write,
    /// keeping the map warm (self-invalidation avoidance).
    fn sync(&self, version: u64);
    /// Current counters.
    fn stats(&self) -> CacheStats;
}

struct LocalCacheInner {
    data: HashMap<String, Value>,
    local_version: i64,
    last_check: Option<Instant>,
    stats: CacheStats,
}

/// The real per-thread, per-namespace cache.
pub struct LocalCache {
    storage: Arc<Storage>,
    namespace: String,
    check_interval: f64,
    inner: Mutex<LocalCacheInner>,
}

impl LocalCache {
    /// Create a cache bound to one namespace of the version registry.
    pub fn new(storage: Arc<Storage>, namespace: &str, check_interval: f64) -> Self {
        LocalCache {
            storage,
            namespace: namespace.to_string(),
            check_interval,
            inner: Mutex::new(LocalCacheInner {
                data: HashMap::new(),
                local_version: -1,
                last_check: None,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Clear the map if the registry has moved past our remembered version.
    /// Hits the database at most once per `check_interval`.
    fn check_and_invalidate(&self, inner: &mut LocalCacheInner) -> Result<()> {
        if let Some(last) = inner.last_check {
            if last.elapsed().as_secs_f64() < self.check_interval {
                return Ok(());
            }
        }

        let global = self.storage.read_version(&self.namespace)? as i64;
        inner.last_check = Some(Instant::now());

        if global != inner.local_version {
            inner.data.clear();
            inner.local_version = global;
            inner.stats.invalidations += 1;
            tracing::debug!(namespace = %self.namespace, version = global, "cache invalidated");
        }
        Ok(())
    }
}

impl Cache for LocalCache {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock();
        self.check_and_invalidate(&mut inner)?;

        match inner.data.get(key).cloned() {
            Some(value) => {
                inner.stats.hits += 1;
                Ok(Some(value))
            }
            None => {
                inner.stats.misses += 1;
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock();
        inner.data.insert(key.to_string(), value);
        inner.stats.sets += 1;
    }

    fn pop(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.data.remove(key);
        inner.stats.pops += 1;
    }

    fn invalidate(&self) {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.local_version = 0;
        inner.last_check = None;
        inner.stats.invalidations += 1;
    }

    fn sync(&self, version: u64) {
        let mut inner = self.inner.lock();
        inner.local_version = version as i64;
        inner.last_check = Some(Instant::now());
    }

    fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

/// A cache that does nothing; used when caching is disabled.
#[derive(Debug, Default)]
pub struct DummyCache;

impl Cache for DummyCache {
    fn get(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: Value) {}

    fn pop(&self, _key: &str) {}

    fn invalidate(&self) {}

    fn sync(&self, _version: u64) {}

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Hands out the cache instance for the calling thread and a namespace.
///
/// Caches are confined to the thread that created them (mirroring the
/// per-thread substrate connections), so a thread never observes another
/// thread's partially-updated map.
pub struct CacheRegistry {
    storage: Arc<Storage>,
    enabled: bool,
    check_interval: f64,
    caches: Mutex<HashMap<(ThreadId, String), Arc<LocalCache>>>,
    dummy: Arc<DummyCache>,
}

impl CacheRegistry {
    /// Default revalidation interval in seconds.
    pub const DEFAULT_CHECK_INTERVAL: f64 = 0.1;

    /// Create the registry. When `enabled` is false every lookup returns
    /// the shared [`DummyCache`].
    pub fn new(storage: Arc<Storage>, enabled: bool, check_interval: f64) -> Self {
        CacheRegistry {
            storage,
            enabled,
            check_interval,
            caches: Mutex::new(HashMap::new()),
            dummy: Arc::new(DummyCache),
        }
    }

    /// The cache for `namespace` on the calling thread.
    pub fn cache(&self, namespace: &str) -> Arc<dyn Cache> {
        if !self.enabled {
            return Arc::clone(&self.dummy) as Arc<dyn Cache>;
        }

        let key = (thread::current().id(), namespace.to_string());
        let mut caches = self.caches.lock();
        let cache = caches.entry(key).or_insert_with(|| {
            Arc::new(LocalCache::new(
                Arc::clone(&self.storage),
                namespace,
                self.check_interval,
            ))
        });
        Arc::clone(cache) as Arc<dyn Cache>
    }

    /// Whether caching is enabled for this database handle.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
