//! Backing Store Boundary
//!
//! Workflow graphs, default auth scripts and the script-module repository are
//! loaded through [`AppStore`]. SQL-backed stores live outside the core (the
//! `[database_nflow]` templates are parsed for them); the runtime ships a
//! file-backed store for the `-a file.json` CLI mode and an in-memory store
//! for tests and embedding.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::types::{Error, Result};

/// Raw app row: the drawflow document text plus the app's default JS blob
#[derive(Debug, Clone, Default)]
pub struct AppRecord {
    pub flow_json: String,
    pub default_js: String,
}

/// Source of apps and script modules
#[async_trait]
pub trait AppStore: Send + Sync {
    /// Fetch the raw graph document and default JS for an app
    async fn fetch_app(&self, name: &str) -> Result<AppRecord>;

    /// Fetch a script from the module repository
    async fn fetch_module(&self, name: &str) -> Result<String>;
}

/// On-disk app document.
///
/// Either a bare drawflow document or a wrapper carrying `default_js` and a
/// `modules` map next to it.
#[derive(Debug, Clone, Default, Deserialize)]
struct AppDocument {
    #[serde(default)]
    drawflow: serde_json::Value,
    #[serde(default)]
    default_js: String,
    #[serde(default)]
    modules: std::collections::BTreeMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// File store
// ─────────────────────────────────────────────────────────────────────────────

/// Reads `<name>.json` app documents from a directory, or a single pinned
/// file registered under its stem.
pub struct FileStore {
    root: PathBuf,
    /// app name → pinned file path
    pinned: DashMap<String, PathBuf>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pinned: DashMap::new(),
        }
    }

    /// Register a single app file; the app name is the file stem.
    /// Returns the registered name.
    pub fn pin_file(&self, path: &Path) -> Result<String> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config(format!("not an app file: {}", path.display())))?
            .to_string();
        self.pinned.insert(name.clone(), path.to_path_buf());
        Ok(name)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.pinned
            .get(name)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.root.join(format!("{}.json", name)))
    }

    async fn read_document(&self, name: &str) -> Result<AppDocument> {
        let path = self.path_for(name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::NotFound(format!("app {} ({}): {}", name, path.display(), e)))?;
        parse_document(&text)
    }
}

#[async_trait]
impl AppStore for FileStore {
    async fn fetch_app(&self, name: &str) -> Result<AppRecord> {
        let doc = self.read_document(name).await?;
        Ok(AppRecord {
            flow_json: serde_json::to_string(&serde_json::json!({ "drawflow": doc.drawflow }))?,
            default_js: doc.default_js,
        })
    }

    async fn fetch_module(&self, name: &str) -> Result<String> {
        // Modules are looked up across every pinned document first, then a
        // sibling `<name>.js` file under the root.
        for entry in self.pinned.iter() {
            if let Ok(doc) = self.read_document(entry.key()).await {
                if let Some(code) = doc.modules.get(name) {
                    return Ok(code.clone());
                }
            }
        }
        let path = self.root.join(format!("{}.js", name));
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::NotFound(format!("module {}: {}", name, e)))
    }
}

fn parse_document(text: &str) -> Result<AppDocument> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("drawflow").is_some() {
        Ok(serde_json::from_value(value)?)
    } else {
        // Bare drawflow body without the wrapper keys
        Ok(AppDocument {
            drawflow: value,
            ..Default::default()
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory app registry for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    apps: DashMap<String, AppRecord>,
    modules: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an app from its drawflow document value
    pub fn insert_app(&self, name: &str, drawflow: serde_json::Value, default_js: &str) {
        let flow_json = if drawflow.get("drawflow").is_some() {
            drawflow.to_string()
        } else {
            serde_json::json!({ "drawflow": drawflow }).to_string()
        };
        self.apps.insert(
            name.to_string(),
            AppRecord {
                flow_json,
                default_js: default_js.to_string(),
            },
        );
    }

    pub fn insert_module(&self, name: &str, code: &str) {
        self.modules.insert(name.to_string(), code.to_string());
    }
}

#[async_trait]
impl AppStore for MemoryStore {
    async fn fetch_app(&self, name: &str) -> Result<AppRecord> {
        self.apps
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| Error::NotFound(format!("app {}", name)))
    }

    async fn fetch_module(&self, name: &str) -> Result<String> {
        self.modules
            .get(name)
            .map(|m| m.clone())
            .ok_or_else(|| Error::NotFound(format!("module {}", name)))
    }
}
