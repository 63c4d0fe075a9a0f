//! Time-bounded memoization of voxel lookups.
//!
//! Entries live for a fixed TTL and the table is capped by an LRU, so a
//! hot coordinate is answered without a worker round trip.

use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use nsweb_core::{Error, Result, VoxelValue};

/// Cache key: coordinate, reference and whether posteriors were requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub reference: String,
    pub include_posterior: bool,
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

struct Entry {
    stored_at: Instant,
    rows: Arc<Vec<VoxelValue>>,
}

/// LRU + TTL cache in front of the dispatcher's voxel lookups.
pub struct VoxelCache {
    entries: Mutex<LruCache<VoxelKey, Entry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl VoxelCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<VoxelKey, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Internal("voxel cache lock poisoned".to_string()))
    }

    /// Fresh entry for `key`, dropping it if expired.
    pub fn get(&self, key: &VoxelKey) -> Result<Option<Arc<Vec<VoxelValue>>>> {
        let mut entries = self.lock()?;
        let fresh = match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.rows.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(fresh)
    }

    pub fn insert(&self, key: VoxelKey, rows: Arc<Vec<VoxelValue>>) -> Result<()> {
        self.lock()?.put(
            key,
            Entry {
                stored_at: Instant::now(),
                rows,
            },
        );
        Ok(())
    }

    /// Cached rows for `key`, or the result of `fetch` stored on success.
    ///
    /// Errors are not cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: VoxelKey,
        fetch: F,
    ) -> Result<Arc<Vec<VoxelValue>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<VoxelValue>>>,
    {
        if let Some(rows) = self.get(&key)? {
            debug!(
                subsystem = "api",
                component = "voxel_cache",
                x = key.x,
                y = key.y,
                z = key.z,
                "Voxel cache hit"
            );
            return Ok(rows);
        }
        let rows = Arc::new(fetch().await?);
        self.insert(key, rows.clone())?;
        Ok(rows)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(x: i32) -> VoxelKey {
        VoxelKey {
            x,
            y: 0,
            z: 0,
            reference: "terms".into(),
            include_posterior: true,
        }
    }

    fn rows() -> Vec<VoxelValue> {
        vec![VoxelValue {
            analysis: "pain".into(),
            z: 1.5,
            pp: Some(0.7),
        }]
    }

    #[tokio::test]
    async fn test_second_lookup_is_served_from_cache() {
        let cache = VoxelCache::new(8, Duration::from_secs(3600));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let result = cache
                .get_or_fetch(key(1), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(rows())
                })
                .await
                .unwrap();
            assert_eq!(result.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 2, misses: 1 });
    }

    #[tokio::test]
    async fn test_expired_entries_refetch() {
        let cache = VoxelCache::new(8, Duration::from_millis(10));
        cache.insert(key(1), Arc::new(rows())).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key(1)).unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = VoxelCache::new(8, Duration::from_secs(60));
        let err = cache
            .get_or_fetch(key(1), || async { Err(Error::Computation("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Computation(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache = VoxelCache::new(2, Duration::from_secs(60));
        for x in 0..3 {
            cache.insert(key(x), Arc::new(rows())).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(0)).unwrap().is_none());
        assert!(cache.get(&key(2)).unwrap().is_some());
    }

    #[test]
    fn test_key_distinguishes_posterior_flag() {
        let cache = VoxelCache::new(8, Duration::from_secs(60));
        cache.insert(key(1), Arc::new(rows())).unwrap();
        let mut other = key(1);
        other.include_posterior = false;
        assert!(cache.get(&other).unwrap().is_none());
    }
}
