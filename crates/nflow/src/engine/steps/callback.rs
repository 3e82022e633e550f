//! Callback-Plugin Step
//!
//! Starts the named callback plugin in a background task and drives the step
//! loop once per callback message, on a plugin-owned subprocess. A message
//! selects its continuation port via a `next` key (falling back to the port
//! the run arrived on); a message carrying `error_exit` ends the subprocess.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::executor::Engine;
use crate::process::Process;
use crate::types::{Result, RunState};

use super::super::registry::{Step, StepExecution, StepOutcome};
use super::plugin::plugin_name;

pub struct CallbackStep;

#[async_trait]
impl Step for CallbackStep {
    async fn run(&self, engine: &Arc<Engine>, ex: &mut StepExecution<'_>) -> Result<StepOutcome> {
        let name = plugin_name(ex.actor)?;
        let plugin = engine.plugins.get_callback(&name)?;

        let (subprocess, mut inbound) = Process::new("dromedary_callback", true);
        subprocess.set_current_node(&ex.actor.id);
        subprocess.set_state(RunState::Wait);
        engine.processes.register(subprocess.clone());

        // The plugin owns the outbound mailbox; it runs until it emits
        // `error_exit` or fails.
        {
            let plugin = plugin.clone();
            let ctx = ex.ctx.clone();
            let vars = ex.vars.clone();
            let payload = ex.payload.clone();
            let node_data = serde_json::to_value(&ex.actor.data)?;
            let outbound = subprocess.callback();
            let wid = subprocess.uuid;
            tokio::spawn(async move {
                if let Err(e) = plugin.start(ctx, vars, payload, node_data, outbound).await {
                    tracing::warn!(wid = %wid, error = %e, "callback plugin failed");
                }
            });
        }

        let mut payload = std::mem::take(&mut ex.payload);
        let drive_result: Result<()> = async {
            while let Some(message) = inbound.recv().await {
                if subprocess.exit_requested() {
                    break;
                }
                let parsed: Value = match serde_json::from_str(&message) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(wid = %subprocess.uuid, error = %e, "invalid callback message");
                        continue;
                    }
                };
                if parsed.get("error_exit").is_some() {
                    break;
                }

                merge_callback_payload(&mut payload, &parsed);

                let port = parsed
                    .get("next")
                    .and_then(|v| v.as_str())
                    .filter(|p| !p.is_empty())
                    .unwrap_or(ex.in_port);
                let Some(node) = ex.actor.first_target(port).map(str::to_string) else {
                    tracing::warn!(
                        wid = %subprocess.uuid,
                        port = port,
                        "callback port has no connection"
                    );
                    continue;
                };

                subprocess.set_state(RunState::Run);
                payload = engine
                    .drive(
                        ex.controller,
                        ex.ctx,
                        ex.vars,
                        &subprocess,
                        ex.vm,
                        node,
                        port.to_string(),
                        payload.clone(),
                    )
                    .await?;
                subprocess.set_state(RunState::Wait);
            }
            Ok(())
        }
        .await;

        subprocess.set_state(match &drive_result {
            Ok(()) => RunState::End,
            Err(_) => RunState::Error,
        });
        engine.processes.remove(&subprocess.uuid);
        drive_result?;

        Ok(StepOutcome::terminal(payload))
    }
}

/// Merge a callback message into the payload; control keys stay out
fn merge_callback_payload(payload: &mut Value, message: &Value) {
    let Value::Object(incoming) = message else {
        return;
    };
    if !payload.is_object() {
        *payload = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = payload {
        for (key, value) in incoming {
            if key == "next" || key == "error_exit" {
                continue;
            }
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_skips_control_keys() {
        let mut payload = json!({ "a": 1 });
        merge_callback_payload(&mut payload, &json!({ "x": 2, "next": "output_1" }));
        assert_eq!(payload, json!({ "a": 1, "x": 2 }));
    }

    #[test]
    fn test_merge_coerces_non_object_payload() {
        let mut payload = Value::Null;
        merge_callback_payload(&mut payload, &json!({ "x": 1 }));
        assert_eq!(payload, json!({ "x": 1 }));
    }
}
