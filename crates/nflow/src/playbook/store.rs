//! Playbook Store
//!
//! Per-app cache of sanitised workflow graphs. Reads hand out deep copies so
//! runs can never mutate the published snapshot; misses deserialise the raw
//! document under a process-wide lock and sweep out corrupted starters before
//! caching.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::store::AppStore;
use crate::types::{Error, Result};

use super::{deep_copy_set, sanitize, FlowDocument, PlaybookSet};

/// A loaded app: a private deep copy of the graph plus the shared default JS
#[derive(Clone)]
pub struct LoadedApp {
    pub playbooks: PlaybookSet,
    pub default_js: Arc<String>,
}

struct CachedApp {
    playbooks: PlaybookSet,
    default_js: Arc<String>,
}

/// Cache of sanitised playbooks keyed by app name
pub struct PlaybookStore {
    store: Arc<dyn AppStore>,
    cache: RwLock<BTreeMap<String, Arc<CachedApp>>>,
    /// app name → needs-reload; absent reads as true
    reload: DashMap<String, bool>,
    /// Deserialisation of deeply nested shared structures is serialised
    /// process-wide; the decoder is not safe for concurrent use on shared
    /// nested targets.
    decode_lock: Mutex<()>,
}

impl PlaybookStore {
    pub fn new(store: Arc<dyn AppStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(BTreeMap::new()),
            reload: DashMap::new(),
            decode_lock: Mutex::new(()),
        }
    }

    /// Load an app's playbooks.
    ///
    /// Returns a deep copy of the cached snapshot; on miss (or after
    /// [`invalidate`](Self::invalidate)) the raw document is fetched,
    /// deserialised, sanitised and cached first.
    pub async fn load(&self, app: &str) -> Result<LoadedApp> {
        let needs_reload = self.reload.get(app).map(|v| *v).unwrap_or(true);
        if !needs_reload {
            if let Some(cached) = self.cache.read().get(app).cloned() {
                return Ok(LoadedApp {
                    playbooks: deep_copy_set(&cached.playbooks),
                    default_js: cached.default_js.clone(),
                });
            }
        }

        let record = self.store.fetch_app(app).await?;

        let mut set = {
            let _guard = self.decode_lock.lock();
            let doc: FlowDocument = serde_json::from_str(&record.flow_json)
                .map_err(|e| Error::Malformed {
                    message: format!("invalid playbook document for app {}: {}", app, e),
                    node_type: None,
                })?;
            doc.drawflow
        };

        let removed = sanitize(&mut set, app);
        if removed > 0 {
            tracing::warn!(app = app, removed = removed, "sanitised corrupted starters");
        }

        let cached = Arc::new(CachedApp {
            playbooks: set,
            default_js: Arc::new(record.default_js),
        });
        self.cache.write().insert(app.to_string(), cached.clone());
        self.reload.insert(app.to_string(), false);

        tracing::info!(app = app, flows = cached.playbooks.len(), "playbooks loaded");

        Ok(LoadedApp {
            playbooks: deep_copy_set(&cached.playbooks),
            default_js: cached.default_js.clone(),
        })
    }

    /// Mark one app for reload on its next read
    pub fn invalidate(&self, app: &str) {
        self.reload.insert(app.to_string(), true);
    }

    /// Mark every cached app for reload
    pub fn invalidate_all(&self) {
        for name in self.cache.read().keys() {
            self.reload.insert(name.clone(), true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn demo_flow(target: &str) -> serde_json::Value {
        json!({
            "home": {
                "data": {
                    "1": {
                        "id": 1,
                        "data": { "type": "starter", "method": "GET", "urlpattern": "/x" },
                        "outputs": { "output_1": { "connections": [ { "node": target, "output": "input_1" } ] } }
                    },
                    "2": { "id": 2, "data": { "type": "js", "code": "" }, "outputs": {} }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_load_and_cache() {
        let backing = Arc::new(MemoryStore::new());
        backing.insert_app("demo", demo_flow("2"), "function auth(){}");
        let store = PlaybookStore::new(backing.clone());

        let loaded = store.load("demo").await.unwrap();
        assert_eq!(loaded.playbooks["home"]["data"].len(), 2);
        assert_eq!(loaded.default_js.as_str(), "function auth(){}");

        // Backing change is invisible until invalidated.
        backing.insert_app("demo", demo_flow("3"), "");
        let cached = store.load("demo").await.unwrap();
        assert_eq!(
            cached.playbooks["home"]["data"]["1"].first_target("output_1"),
            Some("2")
        );

        store.invalidate("demo");
        let reloaded = store.load("demo").await.unwrap();
        assert_eq!(
            reloaded.playbooks["home"]["data"]["1"].first_target("output_1"),
            Some("3")
        );
    }

    #[tokio::test]
    async fn test_read_returns_deep_copies() {
        let backing = Arc::new(MemoryStore::new());
        backing.insert_app("demo", demo_flow("2"), "");
        let store = PlaybookStore::new(backing);

        let mut first = store.load("demo").await.unwrap();
        first.playbooks.get_mut("home").unwrap().clear();

        let second = store.load("demo").await.unwrap();
        assert!(!second.playbooks["home"].is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_starter_never_served() {
        let backing = Arc::new(MemoryStore::new());
        backing.insert_app(
            "demo",
            json!({
                "home": {
                    "data": {
                        "1": {
                            "id": 1,
                            "data": { "type": "starter", "method": "GET", "urlpattern": "/x" },
                            "outputs": { "output_1": { "connections": [] } }
                        }
                    }
                }
            }),
            "",
        );
        let store = PlaybookStore::new(backing);

        let loaded = store.load("demo").await.unwrap();
        assert!(loaded.playbooks["home"]["data"].is_empty());
    }

    #[tokio::test]
    async fn test_missing_app() {
        let store = PlaybookStore::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            store.load("ghost").await,
            Err(Error::NotFound(_))
        ));
    }
}
