//! In-memory cache tiers.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::image::CloseableImage;
use crate::memory::PooledBuffer;

/// Thread-safe key/value cache. Values are shared handles: `get` hands out a
/// new reference and `cache` keeps one.
pub trait MemoryCache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Store `value` under `key`. Returns whether it was retained.
    fn cache(&self, key: K, value: V) -> bool;

    fn contains(&self, key: &K) -> bool;

    /// Drop every entry whose key matches. Returns the number removed.
    fn remove_matching(&self, predicate: &dyn Fn(&K) -> bool) -> usize;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Size accounting for cached values.
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl CacheWeight for Arc<PooledBuffer> {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl CacheWeight for Arc<CloseableImage> {
    fn weight(&self) -> usize {
        self.size_in_bytes()
    }
}

/// LRU cache bounded by entry count and total weight.
pub struct LruMemoryCache<K: Hash + Eq, V> {
    name: &'static str,
    max_bytes: usize,
    state: Mutex<LruState<K, V>>,
}

struct LruState<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    bytes: usize,
}

impl<K, V> LruMemoryCache<K, V>
where
    K: Hash + Eq,
    V: Clone + CacheWeight,
{
    pub fn new(name: &'static str, max_entries: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            max_bytes,
            state: Mutex::new(LruState {
                entries: LruCache::new(capacity),
                bytes: 0,
            }),
        }
    }

    /// Total weight currently held.
    pub fn size_in_bytes(&self) -> usize {
        self.lock().bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> MemoryCache<K, V> for LruMemoryCache<K, V>
where
    K: Hash + Eq + Send,
    V: Clone + CacheWeight + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.lock().entries.get(key).cloned()
    }

    fn cache(&self, key: K, value: V) -> bool {
        let weight = value.weight();
        if weight > self.max_bytes {
            tracing::debug!(
                "{} cache: entry of {} bytes exceeds budget of {}",
                self.name,
                weight,
                self.max_bytes
            );
            return false;
        }
        // Evicted values are dropped after the lock is released.
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            if let Some((_, old)) = state.entries.push(key, value) {
                state.bytes -= old.weight();
                evicted.push(old);
            }
            state.bytes += weight;
            while state.bytes > self.max_bytes {
                match state.entries.pop_lru() {
                    Some((_, old)) => {
                        state.bytes -= old.weight();
                        evicted.push(old);
                    }
                    None => break,
                }
            }
        }
        tracing::trace!("{} cache: stored entry, evicted {}", self.name, evicted.len());
        true
    }

    fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains(key)
    }

    fn remove_matching(&self, predicate: &dyn Fn(&K) -> bool) -> usize {
        let mut removed = Vec::new();
        {
            let mut state = self.lock();
            let mut kept = LruCache::new(state.entries.cap());
            // Popping from the LRU end and re-pushing preserves recency order.
            while let Some((k, v)) = state.entries.pop_lru() {
                if predicate(&k) {
                    state.bytes -= v.weight();
                    removed.push(v);
                } else {
                    kept.push(k, v);
                }
            }
            state.entries = kept;
        }
        removed.len()
    }

    fn clear(&self) {
        let drained: Vec<V> = {
            let mut state = self.lock();
            state.bytes = 0;
            let mut drained = Vec::with_capacity(state.entries.len());
            while let Some((_, v)) = state.entries.pop_lru() {
                drained.push(v);
            }
            drained
        };
        drop(drained);
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PooledBufferFactory, SharedBufferPool};

    fn buffer(factory: &PooledBufferFactory, len: usize) -> Arc<PooledBuffer> {
        factory.from_slice(&vec![0u8; len])
    }

    fn factory() -> PooledBufferFactory {
        PooledBufferFactory::new(Arc::new(SharedBufferPool::default()))
    }

    #[test]
    fn test_get_returns_cached_reference() {
        let factory = factory();
        let cache = LruMemoryCache::new("encoded", 4, 1024);
        let value = buffer(&factory, 10);
        assert!(cache.cache("a", Arc::clone(&value)));
        let hit = cache.get(&"a").unwrap();
        assert!(Arc::ptr_eq(&hit, &value));
        assert!(cache.get(&"b").is_none());
    }

    #[test]
    fn test_evicts_by_weight() {
        let factory = factory();
        let cache = LruMemoryCache::new("encoded", 10, 100);
        cache.cache("a", buffer(&factory, 60));
        cache.cache("b", buffer(&factory, 60));
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert_eq!(cache.size_in_bytes(), 60);
    }

    #[test]
    fn test_rejects_oversized_entry() {
        let factory = factory();
        let cache = LruMemoryCache::new("encoded", 10, 100);
        assert!(!cache.cache("big", buffer(&factory, 101)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replacing_key_updates_weight() {
        let factory = factory();
        let cache = LruMemoryCache::new("encoded", 10, 100);
        cache.cache("a", buffer(&factory, 30));
        cache.cache("a", buffer(&factory, 20));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_in_bytes(), 20);
    }

    #[test]
    fn test_remove_matching_and_clear() {
        let factory = factory();
        let cache = LruMemoryCache::new("encoded", 10, 1000);
        cache.cache("x1", buffer(&factory, 10));
        cache.cache("x2", buffer(&factory, 10));
        cache.cache("y1", buffer(&factory, 10));
        assert_eq!(cache.remove_matching(&|k: &&str| k.starts_with('x')), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_in_bytes(), 10);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size_in_bytes(), 0);
    }
}
