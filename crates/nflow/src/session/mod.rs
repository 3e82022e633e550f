//! Session Layer
//!
//! Namespaced key/value sessions keyed by the request's session cookie, with
//! a TTL cache in front of the backing store. Readers ride the cache's shared
//! lock; writers hold an exclusive write guard across the backing-store save
//! and the cache refresh so the two stay atomic for other observers of the
//! same entry. Isolated (fan-out) contexts operate on a local overlay and
//! never touch the shared locks.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::TtlCache;
use crate::types::Result;

/// Session values for one namespace
pub type SessionValues = BTreeMap<String, Value>;

/// Durable session storage (cookie store, Redis, SQL live outside the core)
pub trait SessionBackend: Send + Sync {
    fn load(&self, session: &str, cookie: &str) -> Result<SessionValues>;
    fn save(&self, session: &str, cookie: &str, values: &SessionValues) -> Result<()>;
    fn delete(&self, session: &str, cookie: &str) -> Result<()>;
}

/// In-memory backend
#[derive(Default)]
pub struct MemoryBackend {
    sessions: DashMap<(String, String), SessionValues>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for MemoryBackend {
    fn load(&self, session: &str, cookie: &str) -> Result<SessionValues> {
        Ok(self
            .sessions
            .get(&(session.to_string(), cookie.to_string()))
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    fn save(&self, session: &str, cookie: &str, values: &SessionValues) -> Result<()> {
        self.sessions
            .insert((session.to_string(), cookie.to_string()), values.clone());
        Ok(())
    }

    fn delete(&self, session: &str, cookie: &str) -> Result<()> {
        self.sessions
            .remove(&(session.to_string(), cookie.to_string()));
        Ok(())
    }
}

/// Per-request session scope: the cookie plus, for fan-out branches, the
/// local overlay that replaces shared session state.
#[derive(Clone, Default)]
pub struct SessionScope {
    pub cookie: String,
    overlay: Option<Arc<Mutex<BTreeMap<String, SessionValues>>>>,
}

impl SessionScope {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            overlay: None,
        }
    }

    /// Isolated scope for a fan-out branch. Reads seed the overlay from the
    /// real session; writes stay in the overlay.
    pub fn isolated(&self) -> Self {
        Self {
            cookie: self.cookie.clone(),
            overlay: Some(Arc::new(Mutex::new(BTreeMap::new()))),
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.overlay.is_some()
    }
}

/// TTL-cached session store.
///
/// A cache entry is one namespace's value map; the namespace name and cookie
/// are folded into the key hash, and the TTL cache supplies the last-access
/// bookkeeping.
pub struct SessionLayer {
    backend: Arc<dyn SessionBackend>,
    cache: Arc<TtlCache<u64, SessionValues>>,
    /// Serialises backing-store save + cache refresh for writers
    write_lock: Mutex<()>,
}

impl SessionLayer {
    pub fn new(backend: Arc<dyn SessionBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            cache: Arc::new(TtlCache::new(Some(ttl))),
            write_lock: Mutex::new(()),
        }
    }

    fn cache_key(session: &str, cookie: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        session.hash(&mut hasher);
        cookie.hash(&mut hasher);
        hasher.finish()
    }

    /// All values of a session namespace
    pub fn get_session(&self, session: &str, scope: &SessionScope) -> Result<SessionValues> {
        if let Some(overlay) = &scope.overlay {
            let mut overlay = overlay.lock();
            if let Some(values) = overlay.get(session) {
                return Ok(values.clone());
            }
            let values = self.backend.load(session, &scope.cookie)?;
            overlay.insert(session.to_string(), values.clone());
            return Ok(values);
        }

        let key = Self::cache_key(session, &scope.cookie);
        if let Some(values) = self.cache.get_touch(&key) {
            return Ok(values);
        }

        self.cache.get_or_compute(key, || {
            Ok::<_, crate::types::Error>(self.backend.load(session, &scope.cookie)?)
        })
    }

    /// One value of a session namespace
    pub fn get_value(&self, session: &str, key: &str, scope: &SessionScope) -> Result<Option<Value>> {
        Ok(self.get_session(session, scope)?.get(key).cloned())
    }

    /// Set one value
    pub fn set_value(
        &self,
        session: &str,
        key: &str,
        value: Value,
        scope: &SessionScope,
    ) -> Result<()> {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), value);
        self.set_many(session, map, scope)
    }

    /// Merge several values into a session
    pub fn set_many(
        &self,
        session: &str,
        updates: BTreeMap<String, Value>,
        scope: &SessionScope,
    ) -> Result<()> {
        if let Some(overlay) = &scope.overlay {
            let mut overlay = overlay.lock();
            let values = overlay.entry(session.to_string()).or_default();
            values.extend(updates);
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let key = Self::cache_key(session, &scope.cookie);
        let mut values = self
            .cache
            .get(&key)
            .map(Ok)
            .unwrap_or_else(|| self.backend.load(session, &scope.cookie))?;
        values.extend(updates);
        self.backend.save(session, &scope.cookie, &values)?;
        self.cache.set(key, values);
        Ok(())
    }

    /// Replace a session wholesale
    pub fn save_session(
        &self,
        session: &str,
        values: SessionValues,
        scope: &SessionScope,
    ) -> Result<()> {
        if let Some(overlay) = &scope.overlay {
            overlay.lock().insert(session.to_string(), values);
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        self.backend.save(session, &scope.cookie, &values)?;
        self.cache.set(Self::cache_key(session, &scope.cookie), values);
        Ok(())
    }

    /// Drop a whole session namespace
    pub fn delete_session(&self, session: &str, scope: &SessionScope) -> Result<()> {
        if let Some(overlay) = &scope.overlay {
            overlay.lock().remove(session);
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        self.backend.delete(session, &scope.cookie)?;
        self.cache.delete(&Self::cache_key(session, &scope.cookie));
        Ok(())
    }

    /// Evict idle cache entries; runs from a periodic task
    pub fn sweep(&self) -> usize {
        self.cache.sweep()
    }

    /// Spawn the periodic idle sweep
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let layer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = layer.sweep();
                if swept > 0 {
                    tracing::debug!(swept = swept, "session cache sweep");
                }
            }
        })
    }
}
