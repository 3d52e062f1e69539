use std::any::Any;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::capacity::CacheCapacityConfig;
use crate::error::{CacheError, Result};
use crate::lock::LockStateToken;
use crate::worker::LockListener;

const MAX_SHARDS: usize = 16;
/// Caches smaller than this per shard keep a single shard and evict in exact LRU order.
const MIN_SHARD_CAPACITY: usize = 1_024;

type Shard<V> = Mutex<LruCache<String, Option<Arc<V>>>>;

/// A bounded in-process map for one logical cache.
///
/// Keys are spread over independently locked LRU shards, so lookups of unrelated keys do not
/// contend. Absent keys are memoized as `None` so a miss is only loaded from the store once.
pub struct OverlayCache<V> {
    name: String,
    capacity: usize,
    hasher: RandomState,
    shards: Box<[Shard<V>]>,
}

impl<V> OverlayCache<V> {
    fn new(name: String, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let shard_count = (capacity / MIN_SHARD_CAPACITY).clamp(1, MAX_SHARDS);
        let per_shard = NonZeroUsize::new(capacity.div_ceil(shard_count)).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            capacity,
            hasher: RandomState::new(),
            shards: (0..shard_count).map(|_| Mutex::new(LruCache::new(per_shard))).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Shard<V> {
        let idx = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` if the key is not memoized; `Some(None)` if it is known to be absent.
    pub fn get(&self, key: &str) -> Option<Option<Arc<V>>> {
        self.shard(key).lock().get(key).cloned()
    }

    /// Returns the memoized value, or runs `load` and memoizes its result.
    ///
    /// A value inserted concurrently while `load` ran wins over the loaded one.
    pub fn get_or_load(&self, key: &str, load: impl FnOnce() -> Result<Option<V>>) -> Result<Option<Arc<V>>> {
        if let Some(memoized) = self.get(key) {
            return Ok(memoized);
        }
        let loaded = load()?.map(Arc::new);
        let mut entries = self.shard(key).lock();
        if let Some(raced) = entries.get(key) {
            return Ok(raced.clone());
        }
        entries.put(key.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn insert(&self, key: impl Into<String>, value: Arc<V>) {
        let key = key.into();
        self.shard(&key).lock().put(key, Some(value));
    }

    /// Records that `key` has no value.
    pub fn insert_absent(&self, key: impl Into<String>) {
        let key = key.into();
        self.shard(&key).lock().put(key, None);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    /// The configured entry limit. Sharded caches round it up to a multiple of the shard count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }
}

trait ErasedCache: Send + Sync {
    fn clear(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V: Send + Sync + 'static> ErasedCache for OverlayCache<V> {
    fn clear(&self) {
        OverlayCache::clear(self);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The in-memory layer in front of the persistent store.
///
/// Registered as the worker's [`LockListener`]: whenever the worker takes the store lock and the
/// lock's state token differs from the one this process last observed for a cache, that cache is
/// cleared before any queued work runs.
pub struct InMemoryCacheOverlay {
    capacities: CacheCapacityConfig,
    caches: Mutex<HashMap<String, Arc<dyn ErasedCache>>>,
    last_observed: Mutex<HashMap<String, LockStateToken>>,
}

impl InMemoryCacheOverlay {
    pub fn new(capacities: CacheCapacityConfig) -> Self {
        Self {
            capacities,
            caches: Mutex::new(HashMap::new()),
            last_observed: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the overlay for `name`, creating it with its configured capacity on first use.
    pub fn cache<V: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<OverlayCache<V>>> {
        let erased = self
            .caches
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| -> Arc<dyn ErasedCache> {
                let capacity = self.capacities.capacity_for(name);
                tracing::debug!(target = "keel.cache", cache = name, capacity, "created in-memory cache");
                Arc::new(OverlayCache::<V>::new(name.to_string(), capacity))
            })
            .clone();
        erased
            .as_any()
            .downcast::<OverlayCache<V>>()
            .map_err(|_| CacheError::CacheTypeMismatch { name: name.to_string() })
    }

    pub fn capacities(&self) -> &CacheCapacityConfig {
        &self.capacities
    }

    pub fn clear(&self) {
        for cache in self.caches.lock().values() {
            cache.clear();
        }
    }
}

impl LockListener for InMemoryCacheOverlay {
    fn on_start_work(&self, token: Option<LockStateToken>) {
        let caches: Vec<(String, Arc<dyn ErasedCache>)> = self
            .caches
            .lock()
            .iter()
            .map(|(name, cache)| (name.clone(), cache.clone()))
            .collect();
        let stale: Vec<Arc<dyn ErasedCache>> = {
            let observed = self.last_observed.lock();
            caches
                .into_iter()
                .filter(|(name, _)| token.is_none() || observed.get(name) != token.as_ref())
                .map(|(name, cache)| {
                    tracing::debug!(target = "keel.cache", cache = %name, "store changed by another process; clearing in-memory cache");
                    cache
                })
                .collect()
        };
        for cache in stale {
            cache.clear();
        }
    }

    fn on_end_work(&self, token: Option<LockStateToken>) {
        let names: Vec<String> = self.caches.lock().keys().cloned().collect();
        let mut observed = self.last_observed.lock();
        match token {
            Some(token) => {
                for name in names {
                    observed.insert(name, token);
                }
            }
            None => observed.clear(),
        }
    }
}
