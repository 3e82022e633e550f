//! Step Registry
//!
//! Dispatch of node execution by `node.data.type`. Each strategy consumes the
//! per-step actor copy and reports the resolved continuation (port and target
//! node) plus the outgoing payload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::context::RequestContext;
use crate::engine::executor::Engine;
use crate::playbook::{Controller, Node, Vars};
use crate::process::Process;
use crate::types::Result;
use crate::vm::VmGuard;

use super::steps::{CallbackStep, FanOutStep, JsStep, PluginStep};

/// Everything one step invocation sees
pub struct StepExecution<'a> {
    pub controller: &'a Controller,
    /// Per-step deep copy; mutations never reach the cached graph
    pub actor: &'a mut Node,
    pub ctx: &'a RequestContext,
    pub vm: &'a VmGuard,
    /// Port the run arrived on
    pub in_port: &'a str,
    pub vars: &'a Vars,
    pub process: &'a Arc<Process>,
    pub payload: Value,
}

/// Continuation reported by a step
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Resolved output port, for the tracker record
    pub next_port: Option<String>,
    /// Target node id to continue on; `None` ends the workflow
    pub next_node: Option<String>,
    pub payload: Value,
}

impl StepOutcome {
    /// End the workflow with a final payload
    pub fn terminal(payload: Value) -> Self {
        Self {
            next_port: None,
            next_node: None,
            payload,
        }
    }

    /// Continue through one of the actor's ports, when it is connected
    pub fn through_port(actor: &Node, port: &str, payload: Value) -> Self {
        match actor.first_target(port) {
            Some(node) => Self {
                next_port: Some(port.to_string()),
                next_node: Some(node.to_string()),
                payload,
            },
            None => Self::terminal(payload),
        }
    }
}

/// A node-execution strategy
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, engine: &Arc<Engine>, ex: &mut StepExecution<'_>) -> Result<StepOutcome>;
}

/// `node.data.type` → strategy
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Registry with the four built-in strategies
    pub fn new() -> Self {
        let mut registry = Self {
            steps: HashMap::new(),
        };
        registry.register("js", Arc::new(JsStep));
        registry.register("dromedary", Arc::new(PluginStep));
        registry.register("gorutine", Arc::new(FanOutStep));
        registry.register("dromedary_callback", Arc::new(CallbackStep));
        registry
    }

    pub fn register(&mut self, node_type: &str, step: Arc<dyn Step>) {
        self.steps.insert(node_type.to_string(), step);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(node_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types_registered() {
        let registry = StepRegistry::new();
        for node_type in ["js", "dromedary", "gorutine", "dromedary_callback"] {
            assert!(registry.get(node_type).is_some(), "{} missing", node_type);
        }
        assert!(registry.get("starter").is_none());
        assert!(registry.get("mystery").is_none());
    }

    #[test]
    fn test_outcome_through_port() {
        let actor: Node = serde_json::from_value(serde_json::json!({
            "id": "1",
            "data": { "type": "js" },
            "outputs": { "output_1": { "connections": [ { "node": "7", "output": "input_1" } ] } }
        }))
        .unwrap();

        let outcome = StepOutcome::through_port(&actor, "output_1", Value::Null);
        assert_eq!(outcome.next_node.as_deref(), Some("7"));
        assert_eq!(outcome.next_port.as_deref(), Some("output_1"));

        let outcome = StepOutcome::through_port(&actor, "output_9", Value::Null);
        assert!(outcome.next_node.is_none());
    }
}
