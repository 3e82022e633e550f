//! Fan-out Step
//!
//! Clones the payload into two independent values, spawns a parallel run on
//! the `output_2` branch under an isolated request context, and continues
//! synchronously on `output_1`. The branch's run id is surfaced to the caller
//! through the `Dromedary-Wid-2` response header; its errors never reach the
//! parent response.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::executor::Engine;
use crate::playbook::{PORT_FORK, PORT_MAIN};
use crate::types::Result;

use super::super::registry::{Step, StepExecution, StepOutcome};

/// Response header carrying the fan-out branch run id
pub const FORK_WID_HEADER: &str = "Dromedary-Wid-2";

pub struct FanOutStep;

#[async_trait]
impl Step for FanOutStep {
    async fn run(&self, engine: &Arc<Engine>, ex: &mut StepExecution<'_>) -> Result<StepOutcome> {
        let payload = std::mem::take(&mut ex.payload);
        // Two independent values; the branch must never alias the parent's.
        let main_payload = payload.clone();
        let branch_payload = payload;

        if let Some(fork_target) = ex.actor.first_target(PORT_FORK).map(str::to_string) {
            let branch_wid = Uuid::new_v4();
            ex.ctx
                .response
                .lock()
                .set_header(FORK_WID_HEADER, &branch_wid.to_string());

            let branch_ctx = ex.ctx.isolated_clone();
            let controller = ex.controller.clone();
            let vars = ex.vars.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine
                    .run_branch(
                        branch_wid,
                        controller,
                        vars,
                        fork_target,
                        branch_payload,
                        branch_ctx,
                    )
                    .await
                {
                    tracing::warn!(wid = %branch_wid, error = %e, "fan-out branch failed");
                }
            });
        }

        Ok(StepOutcome::through_port(ex.actor, PORT_MAIN, main_payload))
    }
}
