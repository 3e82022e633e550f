//! JavaScript Step
//!
//! Resolves the node's script (compile slot → module repository → inline
//! code), prepares it through the script cache, binds the step globals and
//! runs the program under the VM-concurrency semaphore. The `next` the script
//! sets is a port name and is remapped through the actor's outputs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::engine::executor::Engine;
use crate::types::{Error, Result};

use super::super::registry::{Step, StepExecution, StepOutcome};

pub struct JsStep;

#[async_trait]
impl Step for JsStep {
    async fn run(&self, engine: &Arc<Engine>, ex: &mut StepExecution<'_>) -> Result<StepOutcome> {
        // Resolve the transformed source, preferring the per-copy compile
        // slot so repeated visits of one node skip the lookup.
        let prepared: Arc<String> = if let Some(compiled) = ex.actor.data_str("compile") {
            Arc::new(compiled.to_string())
        } else if let Some(script) = ex.actor.data_str("script").filter(|s| !s.is_empty()) {
            let source = engine.store.fetch_module(script).await?;
            let transformed = engine.scripts.get_or_transform(&source);
            ex.actor
                .data
                .insert("compile".into(), json!(transformed.as_str()));
            transformed
        } else if let Some(code) = ex.actor.data_str("code") {
            let transformed = engine.scripts.get_or_transform(code);
            ex.actor
                .data
                .insert("compile".into(), json!(transformed.as_str()));
            transformed
        } else {
            return Err(Error::Malformed {
                message: format!("js node {} has no script or code", ex.actor.id),
                node_type: Some("js".into()),
            });
        };

        let program = engine.scripts.get_or_compile(&prepared);

        // Step-scoped storage id on the copy, never on the cached graph.
        ex.actor
            .data
            .insert("storage_id".into(), json!(uuid::Uuid::new_v4().to_string()));

        let node_data = serde_json::to_value(&ex.actor.data)?;
        let outputs: serde_json::Value = ex
            .actor
            .outputs
            .iter()
            .filter_map(|(port, output)| {
                output
                    .connections
                    .first()
                    .map(|c| (port.clone(), json!(c.node)))
            })
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into();

        let vm = ex.vm;
        vm.set_global_json("payload", &ex.payload)?;
        vm.set_global_str("next", "")?;
        vm.set_global_json("nflow_data", &node_data)?;
        vm.set_global_json("dromedary_data", &node_data)?;
        vm.set_global_json("__outputs", &outputs)?;
        vm.set_global_str("__flow_name", &ex.controller.flow)?;
        vm.set_global_str("__flow_app", &ex.controller.app)?;

        // Bound the number of concurrently executing programs.
        let permit = engine
            .run_semaphore
            .acquire()
            .await
            .map_err(|e| Error::Backend(format!("run semaphore closed: {}", e)))?;
        let run_result = vm.eval_program(&program.source);
        drop(permit);
        run_result?;

        let payload = vm.get_global_json("payload")?;
        let next_port = vm.get_global_str("next");

        if next_port.is_empty() {
            return Ok(StepOutcome::terminal(payload));
        }
        Ok(StepOutcome::through_port(ex.actor, &next_port, payload))
    }
}
