//! Resource Cache
//!
//! Thread-safe TTL cache with compute-once semantics. Reads take the shared
//! lock; writes, sweeps and `get_or_compute` misses take the exclusive lock.
//! A failing compute callback never installs an entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

struct CacheEntry<V> {
    value: V,
    /// Millis since the cache epoch; 0 means no expiry
    expires_at: AtomicU64,
    ttl_millis: u64,
}

/// TTL cache keyed by `K`
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    default_ttl: Option<Duration>,
    epoch: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `default_ttl = None` keeps entries until deleted or cleared
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn expiry_for(&self, ttl: Option<Duration>) -> (u64, u64) {
        match ttl.or(self.default_ttl) {
            Some(ttl) => {
                let millis = ttl.as_millis() as u64;
                (self.now_millis().saturating_add(millis).max(1), millis)
            }
            None => (0, 0),
        }
    }

    fn is_live(&self, entry: &CacheEntry<V>) -> bool {
        let expires = entry.expires_at.load(Ordering::Relaxed);
        expires == 0 || expires > self.now_millis()
    }

    /// Get a value; expired entries read as absent
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if self.is_live(entry) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Get a value and push its expiry out by its TTL
    pub fn get_touch(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if !self.is_live(entry) {
            return None;
        }
        if entry.ttl_millis > 0 {
            entry.expires_at.store(
                self.now_millis().saturating_add(entry.ttl_millis).max(1),
                Ordering::Relaxed,
            );
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: K, value: V) {
        self.set_entry(key, value, None);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.set_entry(key, value, Some(ttl));
    }

    fn set_entry(&self, key: K, value: V, ttl: Option<Duration>) {
        let (expires_at, ttl_millis) = self.expiry_for(ttl);
        self.entries.write().insert(
            key,
            CacheEntry {
                value,
                expires_at: AtomicU64::new(expires_at),
                ttl_millis,
            },
        );
    }

    pub fn delete(&self, key: &K) {
        self.entries.write().remove(key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached value or compute and cache it.
    ///
    /// The compute callback runs under the exclusive lock after a re-check,
    /// so at most one caller computes a given key per clear cycle. Errors are
    /// returned without installing anything.
    pub fn get_or_compute<E>(
        &self,
        key: K,
        compute: impl FnOnce() -> std::result::Result<V, E>,
    ) -> std::result::Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(&key) {
            if self.is_live(entry) {
                return Ok(entry.value.clone());
            }
        }

        let value = compute()?;
        let (expires_at, ttl_millis) = self.expiry_for(None);
        entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: AtomicU64::new(expires_at),
                ttl_millis,
            },
        );
        Ok(value)
    }

    /// Drop expired entries
    pub fn sweep(&self) -> usize {
        let now = self.now_millis();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            let expires = entry.expires_at.load(Ordering::Relaxed);
            expires == 0 || expires > now
        });
        before - entries.len()
    }
}

/// Run [`TtlCache::sweep`] on a fixed interval until the cache is dropped
pub fn spawn_sweeper<K, V>(cache: Arc<TtlCache<K, V>>, interval: Duration) -> tokio::task::JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = cache.sweep();
            if swept > 0 {
                tracing::debug!(swept = swept, "cache sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache: TtlCache<String, i32> = TtlCache::new(None);
        cache.set("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));
        cache.delete(&"a".into());
        assert_eq!(cache.get(&"a".into()), None);
    }

    #[test]
    fn test_expiry() {
        let cache: TtlCache<String, i32> = TtlCache::new(None);
        cache.set_with_ttl("a".into(), 1, Duration::from_millis(10));
        assert_eq!(cache.get(&"a".into()), Some(1));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_touch_extends_expiry() {
        let cache: TtlCache<String, i32> = TtlCache::new(Some(Duration::from_millis(40)));
        cache.set("a".into(), 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get_touch(&"a".into()), Some(1));
        std::thread::sleep(Duration::from_millis(25));
        // Still live because the touch pushed the expiry out.
        assert_eq!(cache.get(&"a".into()), Some(1));
    }

    #[test]
    fn test_get_or_compute_computes_once() {
        let cache: TtlCache<String, i32> = TtlCache::new(None);
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_compute("k".into(), || -> Result<i32, ()> {
                    calls += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_get_or_compute_error_not_cached() {
        let cache: TtlCache<String, i32> = TtlCache::new(None);
        let result: Result<i32, String> =
            cache.get_or_compute("k".into(), || Err("boom".to_string()));
        assert!(result.is_err());
        assert_eq!(cache.len(), 0);

        let value = cache
            .get_or_compute("k".into(), || -> Result<i32, String> { Ok(1) })
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_concurrent_compute_once() {
        let cache: Arc<TtlCache<String, i32>> = Arc::new(TtlCache::new(None));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_compute("k".to_string(), || -> Result<i32, ()> {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(5));
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
