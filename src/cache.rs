use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

const BACKGROUND_CACHE_CAPACITY: usize = 24;
const AVATAR_CACHE_CAPACITY: usize = 48;

/// Recency-ordered byte cache. `get` refreshes recency; `put` beyond
/// capacity evicts exactly the least-recently-used entry.
///
/// LRU operations need mutable access, so the cache sits behind a coarse
/// mutex; critical sections are a map lookup and a pointer clone.
pub struct ByteCache {
    inner: Mutex<LruCache<String, Arc<Vec<u8>>>>,
}

impl ByteCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut cache = self.inner.lock().ok()?;
        cache.get(key).cloned()
    }

    pub fn put(&self, key: String, value: Arc<Vec<u8>>) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, value);
        }
    }

    /// Fetches from the cache or computes, stores, and returns the value.
    /// The computation runs outside the lock.
    pub fn get_or_try_insert<F>(&self, key: &str, compute: F) -> anyhow::Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> anyhow::Result<Vec<u8>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = Arc::new(compute()?);
        self.put(key.to_owned(), value.clone());
        Ok(value)
    }
}

/// The two in-memory caches every composer shares: resized backgrounds and
/// pre-rendered avatar badges. Constructed once at startup and injected;
/// lifetime equals the hosting process.
pub struct AssetCaches {
    pub backgrounds: ByteCache,
    pub badges: ByteCache,
}

impl AssetCaches {
    pub fn new() -> Self {
        Self {
            backgrounds: ByteCache::new(BACKGROUND_CACHE_CAPACITY),
            badges: ByteCache::new(AVATAR_CACHE_CAPACITY),
        }
    }
}

impl Default for AssetCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![n])
    }

    #[test]
    fn overflow_evicts_exactly_the_least_recently_used_key() {
        let cache = ByteCache::new(3);
        cache.put("a".into(), bytes(1));
        cache.put("b".into(), bytes(2));
        cache.put("c".into(), bytes(3));
        cache.put("d".into(), bytes(4));

        assert!(cache.get("a").is_none());
        for key in ["b", "c", "d"] {
            assert!(cache.get(key).is_some(), "{key} should survive");
        }
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = ByteCache::new(2);
        cache.put("a".into(), bytes(1));
        cache.put("b".into(), bytes(2));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.put("c".into(), bytes(3));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn get_or_try_insert_computes_once() {
        let cache = ByteCache::new(4);
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert("k", || {
                    calls += 1;
                    Ok(vec![9, 9])
                })
                .unwrap();
            assert_eq!(value.as_slice(), &[9, 9]);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn compute_failure_caches_nothing() {
        let cache = ByteCache::new(4);
        let err = cache.get_or_try_insert("k", || anyhow::bail!("download failed"));
        assert!(err.is_err());
        assert!(cache.get("k").is_none());
    }
}
