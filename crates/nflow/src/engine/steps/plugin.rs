//! Plugin Step
//!
//! Invokes the named synchronous plugin with the request context, path
//! variables, payload and the serialised node data, then maps the returned
//! port name through the actor's outputs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::executor::Engine;
use crate::types::{Error, Result};

use super::super::registry::{Step, StepExecution, StepOutcome};

/// Plugin name from node data: `plugin` field, falling back to `name`
pub fn plugin_name(actor: &crate::playbook::Node) -> Result<String> {
    actor
        .data_str("plugin")
        .or_else(|| actor.data_str("name"))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Malformed {
            message: format!("plugin node {} has no plugin name", actor.id),
            node_type: Some(actor.node_type().to_string()),
        })
}

pub struct PluginStep;

#[async_trait]
impl Step for PluginStep {
    async fn run(&self, engine: &Arc<Engine>, ex: &mut StepExecution<'_>) -> Result<StepOutcome> {
        let name = plugin_name(ex.actor)?;
        let plugin = engine.plugins.get(&name)?;

        let node_data = serde_json::to_value(&ex.actor.data)?;
        let payload = std::mem::take(&mut ex.payload);

        let output = plugin.run(ex.ctx, ex.vars, payload, &node_data).await?;

        match output.next_port {
            Some(port) if !port.is_empty() => {
                Ok(StepOutcome::through_port(ex.actor, &port, output.payload))
            }
            _ => Ok(StepOutcome::terminal(output.payload)),
        }
    }
}
