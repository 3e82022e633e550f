//! VM Sandbox
//!
//! Best-effort hardening of a VM: strips dynamic-code globals, installs a
//! length-capped console, and decides which host capability groups scripts
//! may see. This guards against accidents, not a hostile host escape.

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Function, Object};

use crate::config::VmPoolConfig;
use crate::types::{Error, Result};

use super::runtime::JsVm;

/// Capability groups always available to scripts
pub const BASE_WHITELIST: &[&str] = &["crypto", "querystring", "url", "util", "path"];

/// Maximum characters a single console call may emit
pub const CONSOLE_CAP: usize = 4096;

/// Init script removing dynamic code evaluation from the global scope
const SANDBOX_JS: &str = r#"
(function () {
    globalThis.eval = undefined;
    globalThis.Function = undefined;
    try {
        // The constructor stays reachable through instances; neuter it there.
        var proto = Object.getPrototypeOf(function () {});
        Object.defineProperty(proto, "constructor", { value: undefined });
    } catch (e) {}
})();
"#;

/// Module/capability whitelist for a configuration.
///
/// `fs` and `http`/`https` only appear when explicitly enabled.
pub fn whitelist(config: &VmPoolConfig) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BASE_WHITELIST.to_vec();
    if config.enable_filesystem {
        names.push("fs");
    }
    if config.enable_network {
        names.push("http");
        names.push("https");
    }
    names
}

/// Apply the sandbox to a freshly created VM
pub fn install(vm: &JsVm) -> Result<()> {
    vm.eval_program(SANDBOX_JS)?;
    install_console(vm)
}

/// Install a console whose output is truncated to [`CONSOLE_CAP`] characters
pub fn install_console(vm: &JsVm) -> Result<()> {
    vm.with_context(|ctx| {
        let conv = |e: rquickjs::Error| Error::Script(format!("console install: {}", e));

        let console = Object::new(ctx.clone()).map_err(conv)?;

        console
            .set(
                "log",
                Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
                    tracing::info!(target: "nflow.js", "{}", capped(args));
                })
                .map_err(conv)?,
            )
            .map_err(conv)?;

        console
            .set(
                "info",
                Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
                    tracing::info!(target: "nflow.js", "{}", capped(args));
                })
                .map_err(conv)?,
            )
            .map_err(conv)?;

        console
            .set(
                "warn",
                Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
                    tracing::warn!(target: "nflow.js", "{}", capped(args));
                })
                .map_err(conv)?,
            )
            .map_err(conv)?;

        console
            .set(
                "error",
                Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
                    tracing::error!(target: "nflow.js", "{}", capped(args));
                })
                .map_err(conv)?,
            )
            .map_err(conv)?;

        console
            .set(
                "debug",
                Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
                    tracing::debug!(target: "nflow.js", "{}", capped(args));
                })
                .map_err(conv)?,
            )
            .map_err(conv)?;

        ctx.globals().set("console", console).map_err(conv)?;
        Ok(())
    })
}

fn capped(args: Rest<Coerced<String>>) -> String {
    let mut message = args
        .0
        .into_iter()
        .map(|c| c.0)
        .collect::<Vec<_>>()
        .join(" ");
    if message.len() > CONSOLE_CAP {
        let mut cut = CONSOLE_CAP;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("…");
    }
    message
}
