//! Execution Engine
//!
//! Per-request workflow driver: process lifecycle, the run-id header, VM
//! acquisition and binding, the auth preamble, and the node-by-node step loop
//! with payload propagation and tracker emission. Fan-out branches re-enter
//! through [`Engine::run_branch`]; callback plugins re-enter through
//! [`Engine::drive`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cache::ScriptCache;
use crate::playbook::{Controller, PlaybookStore, Vars, PORT_MAIN};
use crate::plugin::PluginRegistry;
use crate::process::{Process, ProcessRegistry};
use crate::router::StarterMatch;
use crate::session::SessionLayer;
use crate::store::AppStore;
use crate::tracker::{LogTracker, TrackerEntry};
use crate::types::{is_truthy_flag, Error, Result, RunState};
use crate::vm::{RequestBindings, VmGuard, VmPool};

use super::context::RequestContext;
use super::registry::{StepExecution, StepRegistry};

/// Response header carrying the run id, set exactly once per request
pub const WID_HEADER: &str = "Nflow-Wid-1";
/// Session holding form values merged into every step's payload
pub const FORM_SESSION: &str = "nflow_form";
/// Session holding the per-request step counter
pub const LOG_SESSION: &str = "log-session";
/// Session holding the authenticated profile
pub const AUTH_SESSION: &str = "auth-session";
/// Redirect target when the auth preamble asks for a login
pub const LOGIN_PATH: &str = "/nflow_login";

/// The workflow execution engine
pub struct Engine {
    pub playbooks: Arc<PlaybookStore>,
    pub sessions: Arc<SessionLayer>,
    pub scripts: Arc<ScriptCache>,
    pub vm_pool: Arc<VmPool>,
    pub steps: Arc<StepRegistry>,
    pub processes: Arc<ProcessRegistry>,
    pub tracker: Arc<LogTracker>,
    pub plugins: Arc<PluginRegistry>,
    pub store: Arc<dyn AppStore>,
    /// Bounds concurrently executing programs across all runs
    pub run_semaphore: Arc<Semaphore>,
    hostname: String,
}

/// Removes the process row and nudges its callback mailbox when a run ends,
/// whichever way it ends.
struct ProcessGuard {
    processes: Arc<ProcessRegistry>,
    process: Arc<Process>,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.process.notify_exit();
        self.processes.remove(&self.process.uuid);
    }
}

#[allow(clippy::too_many_arguments)]
impl Engine {
    pub fn new(
        playbooks: Arc<PlaybookStore>,
        sessions: Arc<SessionLayer>,
        scripts: Arc<ScriptCache>,
        vm_pool: Arc<VmPool>,
        steps: Arc<StepRegistry>,
        processes: Arc<ProcessRegistry>,
        tracker: Arc<LogTracker>,
        plugins: Arc<PluginRegistry>,
        store: Arc<dyn AppStore>,
        max_concurrent_runs: usize,
        hostname: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            playbooks,
            sessions,
            scripts,
            vm_pool,
            steps,
            processes,
            tracker,
            plugins,
            store,
            run_semaphore: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            hostname,
        })
    }

    /// Execute a routed request to completion.
    ///
    /// The response is written into the context's buffer; the returned error,
    /// if any, is mapped to a status by the HTTP layer.
    pub async fn handle(
        self: &Arc<Self>,
        matched: &StarterMatch,
        explicit_next: Option<String>,
        default_js: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        let controller = &matched.controller;
        let (process, _callback_rx) = Process::new("http", true);
        self.processes.register(process.clone());
        let _guard = ProcessGuard {
            processes: self.processes.clone(),
            process: process.clone(),
        };

        ctx.response
            .lock()
            .set_header_once(WID_HEADER, &process.uuid.to_string());

        let vm = self.vm_pool.acquire().await?;
        self.bind_request(&vm, ctx, &matched.vars, &process.uuid)?;

        // Entry node: explicit override, else the starter's first connection.
        let mut entry = match explicit_next
            .filter(|n| !n.is_empty())
            .or_else(|| controller.starter.first_target(PORT_MAIN).map(str::to_string))
        {
            Some(entry) => entry,
            None => {
                return Err(Error::Malformed {
                    message: "No output connections for starter node".into(),
                    node_type: Some(controller.starter.node_type().to_string()),
                })
            }
        };

        // Auth preamble.
        if let Some(entry_node) = controller.playbook.get(&entry) {
            if is_truthy_flag(entry_node.data.get("nflow_auth")) {
                match self
                    .auth_preamble(&vm, ctx, controller, entry_node, &entry, default_js)
                    .await?
                {
                    AuthVerdict::Login => {
                        let mut response = ctx.response.lock();
                        response.set_status(307);
                        response.set_header("Location", LOGIN_PATH);
                        return Ok(());
                    }
                    AuthVerdict::Break => return Ok(()),
                    AuthVerdict::Continue(next) => entry = next,
                }
            }
        }

        let initial = initial_payload(&ctx.post_data);
        process.set_state(RunState::Run);
        let result = self
            .drive(
                controller,
                ctx,
                &matched.vars,
                &process,
                &vm,
                entry,
                PORT_MAIN.to_string(),
                initial,
            )
            .await;

        match &result {
            Ok(_) => process.set_state(RunState::End),
            Err(_) => process.set_state(RunState::Error),
        }
        result?;

        // Form state is request-scoped; a finished run leaves none behind.
        if !ctx.isolated {
            self.sessions.delete_session(FORM_SESSION, &ctx.scope)?;
        }
        Ok(())
    }

    /// Execute a fan-out branch under its pre-assigned run id.
    ///
    /// Branch errors are logged by the caller and never reach the parent
    /// response.
    pub async fn run_branch(
        self: &Arc<Self>,
        wid: Uuid,
        controller: Controller,
        vars: Vars,
        start_node: String,
        payload: Value,
        ctx: RequestContext,
    ) -> Result<()> {
        let (process, _callback_rx) = Process::with_uuid(wid, "gorutine", true);
        self.processes.register(process.clone());
        let _guard = ProcessGuard {
            processes: self.processes.clone(),
            process: process.clone(),
        };

        let vm = self.vm_pool.acquire().await?;
        self.bind_request(&vm, &ctx, &vars, &wid)?;

        process.set_state(RunState::Run);
        let result = self
            .drive(
                &controller,
                &ctx,
                &vars,
                &process,
                &vm,
                start_node,
                PORT_MAIN.to_string(),
                payload,
            )
            .await;
        match &result {
            Ok(_) => process.set_state(RunState::End),
            Err(_) => process.set_state(RunState::Error),
        }
        result.map(|_| ())
    }

    /// The step loop: dispatch node by node until no successor remains, a
    /// `break` flag appears, an error aborts the run, or the process is
    /// killed. Returns the final payload.
    pub async fn drive(
        self: &Arc<Self>,
        controller: &Controller,
        ctx: &RequestContext,
        vars: &Vars,
        process: &Arc<Process>,
        vm: &VmGuard,
        start_node: String,
        start_port: String,
        payload: Value,
    ) -> Result<Value> {
        let username = self.session_username(ctx);
        let mut payload = payload;
        let mut current = start_node;
        let mut in_port = start_port;
        let mut prev = String::new();

        while !current.is_empty() {
            if process.exit_requested() {
                tracing::debug!(wid = %process.uuid, "run aborted by kill flag");
                break;
            }

            let Some(node) = controller.playbook.get(&current) else {
                return Err(Error::Malformed {
                    message: "Type node not found".into(),
                    node_type: None,
                });
            };
            let mut actor = node.deep_copy();
            let node_type = actor.node_type().to_string();
            let Some(step) = self.steps.get(&node_type) else {
                return Err(Error::Malformed {
                    message: "Type node not found".into(),
                    node_type: Some(node_type),
                });
            };

            process.set_current_node(&current);
            vm.set_global_str("current_box", &current)?;
            vm.set_global_str("prev_box", &prev)?;

            if !ctx.isolated {
                self.merge_form_into_payload(&mut payload, ctx)?;
            }

            let started = Instant::now();
            let result = {
                let mut ex = StepExecution {
                    controller,
                    actor: &mut actor,
                    ctx,
                    vm,
                    in_port: &in_port,
                    vars,
                    process,
                    payload: std::mem::take(&mut payload),
                };
                step.run(self, &mut ex).await
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.emit_entry(ctx, process, &actor, "", duration_ms, &Value::Null, &username);
                    return Err(e);
                }
            };
            payload = outcome.payload;
            let next_port = outcome.next_port.unwrap_or_default();

            if !ctx.isolated {
                self.persist_form_payload(&payload, ctx)?;
            }

            self.emit_entry(
                ctx,
                process,
                &actor,
                &next_port,
                duration_ms,
                &payload,
                &username,
            );

            if is_truthy_flag(payload.get("break")) || payload.get("error_exit").is_some() {
                break;
            }

            prev = std::mem::take(&mut current);
            current = outcome.next_node.unwrap_or_default();
            in_port = if next_port.is_empty() {
                PORT_MAIN.to_string()
            } else {
                next_port
            };
        }

        Ok(payload)
    }

    /// Bind the request-scoped globals for one run
    fn bind_request(
        &self,
        vm: &VmGuard,
        ctx: &RequestContext,
        vars: &Vars,
        wid: &Uuid,
    ) -> Result<()> {
        let profile = if ctx.isolated {
            Value::Null
        } else {
            self.sessions
                .get_value(AUTH_SESSION, "profile", &ctx.scope)?
                .unwrap_or(Value::Null)
        };
        let form = self
            .sessions
            .get_session(FORM_SESSION, &ctx.scope)
            .map(|values| Value::Object(values.into_iter().collect()))
            .unwrap_or(Value::Null);

        let bindings = RequestBindings {
            wid: wid.to_string(),
            post_data: ctx.post_data.clone(),
            vars: json!(vars),
            payload: initial_payload(&ctx.post_data),
            header: ctx.headers_json(),
            form,
            profile,
            endpoint: json!({
                "path": ctx.path,
                "method": ctx.method,
                "token": ctx.token,
            }),
            sessions: self.sessions.clone(),
            scope: ctx.scope.clone(),
            response: ctx.response.clone(),
        };
        bindings.install(vm)
    }

    /// Run the app's default JS blob followed by `auth()` and read the
    /// updated `next`.
    async fn auth_preamble(
        &self,
        vm: &VmGuard,
        ctx: &RequestContext,
        _controller: &Controller,
        entry_node: &crate::playbook::Node,
        entry: &str,
        default_js: &str,
    ) -> Result<AuthVerdict> {
        let profile = if ctx.isolated {
            Value::Null
        } else {
            self.sessions
                .get_value(AUTH_SESSION, "profile", &ctx.scope)?
                .unwrap_or(Value::Null)
        };
        vm.set_global_json("profile", &profile)?;
        vm.set_global_str("next", entry)?;
        vm.set_global_json(
            "auth_flag",
            entry_node.data.get("nflow_auth").unwrap_or(&Value::Bool(true)),
        )?;
        vm.set_global_str("url_access", &ctx.path)?;

        vm.eval_program(&format!("{}\nauth()", default_js))?;

        let next = vm.get_global_str("next");
        Ok(match next.as_str() {
            "login" => AuthVerdict::Login,
            "break" => AuthVerdict::Break,
            "" => AuthVerdict::Continue(entry.to_string()),
            other => AuthVerdict::Continue(other.to_string()),
        })
    }

    fn merge_form_into_payload(&self, payload: &mut Value, ctx: &RequestContext) -> Result<()> {
        let form = self.sessions.get_session(FORM_SESSION, &ctx.scope)?;
        if form.is_empty() {
            return Ok(());
        }
        if !payload.is_object() {
            *payload = json!({});
        }
        if let Value::Object(target) = payload {
            for (key, value) in form {
                target.entry(key).or_insert(value);
            }
        }
        Ok(())
    }

    fn persist_form_payload(&self, payload: &Value, ctx: &RequestContext) -> Result<()> {
        let Value::Object(map) = payload else {
            return Ok(());
        };
        if map.is_empty() {
            return Ok(());
        }
        let updates: BTreeMap<String, Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.sessions.set_many(FORM_SESSION, updates, &ctx.scope)
    }

    /// Username from the authenticated profile, for tracker rows
    fn session_username(&self, ctx: &RequestContext) -> String {
        self.sessions
            .get_value(AUTH_SESSION, "profile", &ctx.scope)
            .ok()
            .flatten()
            .and_then(|profile| {
                profile
                    .get("username")
                    .or_else(|| profile.get("name"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or_default()
    }

    /// Per-request step counter kept in `log-session.order_box`
    fn next_order_box(&self, ctx: &RequestContext) -> i64 {
        let current = self
            .sessions
            .get_value(LOG_SESSION, "order_box", &ctx.scope)
            .ok()
            .flatten()
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let next = current + 1;
        if let Err(e) = self
            .sessions
            .set_value(LOG_SESSION, "order_box", json!(next), &ctx.scope)
        {
            tracing::warn!(error = %e, "failed to persist order_box");
        }
        next
    }

    /// Non-blocking tracker emission; a full channel or open breaker counts
    /// the record as dropped and the loop proceeds.
    #[allow(clippy::too_many_arguments)]
    fn emit_entry(
        &self,
        ctx: &RequestContext,
        process: &Arc<Process>,
        actor: &crate::playbook::Node,
        next_connection: &str,
        duration_ms: u64,
        payload: &Value,
        username: &str,
    ) {
        let order_box = self.next_order_box(ctx);
        self.tracker.track(TrackerEntry {
            log_id: process.uuid.to_string(),
            box_id: actor.id.clone(),
            box_name: actor.name().to_string(),
            box_type: actor.node_type().to_string(),
            username: username.to_string(),
            ip: ctx.remote_addr.clone(),
            real_ip: ctx.real_ip().to_string(),
            url: ctx.raw_path.clone(),
            user_agent: ctx.user_agent().to_string(),
            query_string: ctx.query_string.clone(),
            hostname: self.hostname.clone(),
            host: ctx.host.clone(),
            next_connection: next_connection.to_string(),
            duration_ms,
            order_box,
            json_payload: payload.to_string(),
        });
    }
}

enum AuthVerdict {
    Login,
    Break,
    Continue(String),
}

/// A JSON body seeds the payload; anything else starts from an empty object
fn initial_payload(post_data: &Value) -> Value {
    if post_data.is_object() {
        post_data.clone()
    } else {
        json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_payload() {
        assert_eq!(
            initial_payload(&json!({ "a": 1 })),
            json!({ "a": 1 })
        );
        assert_eq!(initial_payload(&Value::Null), json!({}));
        assert_eq!(initial_payload(&json!("raw body")), json!({}));
    }
}
