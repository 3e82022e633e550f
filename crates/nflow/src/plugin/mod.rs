//! Plugin Boundary
//!
//! Nodes of type `dromedary` call a named [`Plugin`]; nodes of type
//! `dromedary_callback` hand a [`CallbackPlugin`] an outbound mailbox and
//! react to its messages. Plugin business logic (SMTP, HTTP clients, rules,
//! LLM) lives outside the core; the bundled `template` plugin exists so the
//! plugin path is exercised end to end.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::engine::context::RequestContext;
use crate::playbook::Vars;
use crate::types::{Error, Result};

/// Result of a synchronous plugin invocation
#[derive(Debug, Clone)]
pub struct PluginOutput {
    /// Port name to continue on, mapped through the node's outputs
    pub next_port: Option<String>,
    pub payload: Value,
}

/// A synchronous plugin (the `dromedary` step)
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        ctx: &RequestContext,
        vars: &Vars,
        payload: Value,
        node_data: &Value,
    ) -> Result<PluginOutput>;
}

/// A callback-driven plugin (the `dromedary_callback` step).
///
/// The plugin runs in a background task and emits JSON messages on the
/// outbound mailbox; a message carrying `error_exit` ends the subprocess.
#[async_trait]
pub trait CallbackPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn start(
        &self,
        ctx: RequestContext,
        vars: Vars,
        payload: Value,
        node_data: Value,
        outbound: mpsc::Sender<String>,
    ) -> Result<()>;
}

/// Name → plugin registry, filtered by the configured plugin list
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn Plugin>>,
    callback_plugins: DashMap<String, Arc<dyn CallbackPlugin>>,
    /// Names admitted by configuration; empty admits everything registered
    enabled: parking_lot::RwLock<Vec<String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(TemplatePlugin));
        registry
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_callback(&self, plugin: Arc<dyn CallbackPlugin>) {
        self.callback_plugins
            .insert(plugin.name().to_string(), plugin);
    }

    /// Restrict lookups to the configured names
    pub fn set_enabled(&self, names: Vec<String>) {
        *self.enabled.write() = names;
    }

    fn admitted(&self, name: &str) -> bool {
        let enabled = self.enabled.read();
        enabled.is_empty() || enabled.iter().any(|n| n == name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        if !self.admitted(name) {
            return Err(Error::Backend(format!("plugin {} not enabled", name)));
        }
        self.plugins
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Backend(format!("plugin {} not registered", name)))
    }

    pub fn get_callback(&self, name: &str) -> Result<Arc<dyn CallbackPlugin>> {
        if !self.admitted(name) {
            return Err(Error::Backend(format!("plugin {} not enabled", name)));
        }
        self.callback_plugins
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Backend(format!("callback plugin {} not registered", name)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Template plugin
// ─────────────────────────────────────────────────────────────────────────────

/// Renders `data.template` with `{{key}}` substitution from the payload and
/// vars, writes the result to the response, and continues on `output_1`.
pub struct TemplatePlugin;

#[async_trait]
impl Plugin for TemplatePlugin {
    fn name(&self) -> &str {
        "template"
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        vars: &Vars,
        payload: Value,
        node_data: &Value,
    ) -> Result<PluginOutput> {
        let template = node_data
            .get("template")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let rendered = render_template(template, &payload, vars);

        {
            let mut response = ctx.response.lock();
            response.set_status(200);
            response.set_header("Content-Type", "text/html; charset=utf-8");
            response.write_body(rendered.as_bytes());
        }

        Ok(PluginOutput {
            next_port: Some(crate::playbook::PORT_MAIN.to_string()),
            payload,
        })
    }
}

/// `{{key}}` substitution; payload keys win over path variables, unknown keys
/// render empty.
pub fn render_template(template: &str, payload: &Value, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        if let Some(value) = payload.get(key) {
            match value {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        } else if let Some(value) = vars.get(key) {
            out.push_str(value);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}
