//! Shared harness for the end-to-end scenarios: an engine wired onto an
//! in-memory store, a collecting log sink and a small-footprint VM pool.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use nflow::cache::ScriptCache;
use nflow::config::{TrackerConfig, VmPoolConfig};
use nflow::engine::{Engine, RequestContext, StepRegistry};
use nflow::playbook::PlaybookStore;
use nflow::plugin::PluginRegistry;
use nflow::process::ProcessRegistry;
use nflow::router::{match_starter, StarterMatch};
use nflow::session::{MemoryBackend, SessionLayer, SessionScope};
use nflow::store::MemoryStore;
use nflow::tracker::{LogSink, LogTracker, TrackerEntry};
use nflow::types::Result;
use nflow::vm::VmPool;

pub const APP: &str = "testapp";

/// Sink collecting every written row
pub struct CollectSink {
    pub rows: Mutex<Vec<TrackerEntry>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LogSink for CollectSink {
    async fn write_batch(&self, rows: &[TrackerEntry]) -> Result<()> {
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<SessionLayer>,
    pub scripts: Arc<ScriptCache>,
    pub processes: Arc<ProcessRegistry>,
    pub plugins: Arc<PluginRegistry>,
    pub tracker: Arc<LogTracker>,
    pub sink: Arc<CollectSink>,
}

/// Build a harness serving one app document
pub fn build(app_drawflow: Value, default_js: &str, vm_config: VmPoolConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.insert_app(APP, app_drawflow, default_js);

    let playbooks = Arc::new(PlaybookStore::new(store.clone()));
    let sessions = Arc::new(SessionLayer::new(
        Arc::new(MemoryBackend::new()),
        Duration::from_secs(300),
    ));
    let scripts = Arc::new(ScriptCache::new(64));
    let processes = Arc::new(ProcessRegistry::new());
    let plugins = Arc::new(PluginRegistry::new());

    let sink = CollectSink::new();
    let tracker = LogTracker::new(
        &TrackerConfig {
            workers: 1,
            batch_size: 10,
            flush_interval: 20,
            channel_buffer: 1000,
            stats_interval: 0,
            ..TrackerConfig::default()
        },
        sink.clone(),
    );

    let max_size = vm_config.max_size;
    let vm_pool = VmPool::new(vm_config, serde_json::json!({}));

    let engine = Engine::new(
        playbooks,
        sessions.clone(),
        scripts.clone(),
        vm_pool,
        Arc::new(StepRegistry::new()),
        processes.clone(),
        tracker.clone(),
        plugins.clone(),
        store.clone(),
        max_size,
        "test-host".to_string(),
    );

    Harness {
        engine,
        store,
        sessions,
        scripts,
        processes,
        plugins,
        tracker,
        sink,
    }
}

pub fn default_vm_config() -> VmPoolConfig {
    VmPoolConfig {
        max_size: 4,
        preload_size: 0,
        ..VmPoolConfig::default()
    }
}

/// A request context with its own session cookie
pub fn ctx(method: &str, path: &str, cookie: &str) -> RequestContext {
    let mut ctx = RequestContext::bare(method, path);
    ctx.scope = SessionScope::new(cookie);
    ctx
}

impl Harness {
    /// Load the app and route a request
    pub async fn route(&self, method: &str, path: &str) -> Option<(StarterMatch, String)> {
        let loaded = self.engine.playbooks.load(APP).await.ok()?;
        let matched = match_starter(APP, method, path, &loaded.playbooks)?;
        Some((matched, loaded.default_js.as_str().to_string()))
    }

    /// Route and execute one request; panics when no starter matches
    pub async fn run(&self, ctx: &RequestContext) -> Result<()> {
        let (matched, default_js) = self
            .route(&ctx.method, &ctx.path)
            .await
            .expect("no starter matched");
        self.engine.handle(&matched, None, &default_js, ctx).await
    }
}

/// A starter node JSON fragment
pub fn starter_node(id: &str, method: &str, pattern: &str, target: &str) -> Value {
    serde_json::json!({
        "id": id,
        "data": { "type": "starter", "name": "start", "method": method, "urlpattern": pattern },
        "outputs": { "output_1": { "connections": [ { "node": target, "output": "input_1" } ] } }
    })
}

/// A js node JSON fragment with one optional output
pub fn js_node(id: &str, code: &str, target: Option<&str>) -> Value {
    let outputs = match target {
        Some(target) => serde_json::json!({
            "output_1": { "connections": [ { "node": target, "output": "input_1" } ] }
        }),
        None => serde_json::json!({}),
    };
    serde_json::json!({
        "id": id,
        "data": { "type": "js", "name": format!("js-{}", id), "code": code },
        "outputs": outputs
    })
}

/// Wrap nodes into the drawflow document shape
pub fn drawflow(nodes: Vec<Value>) -> Value {
    let mut data = serde_json::Map::new();
    for node in nodes {
        let id = node["id"].as_str().expect("node id").to_string();
        data.insert(id, node);
    }
    serde_json::json!({ "home": { "data": data } })
}

/// Convenience: run until a condition holds or the deadline passes
pub async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Form values as a map for assertions
pub fn session_map(values: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    values
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
