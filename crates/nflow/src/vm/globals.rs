//! Request-Scoped VM Globals
//!
//! Typed registry of the names a workflow script sees. Data globals and host
//! functions are re-bound on every pool acquire and the reserved names are
//! blanked on release, because a returned VM keeps whatever a previous run
//! set. Host functions cross the boundary as `__`-prefixed primitives taking
//! and returning JSON strings; a small shim presents the public API.

use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::{Function, Object};
use serde_json::Value;

use crate::config::VmPoolConfig;
use crate::engine::context::ResponseBuffer;
use crate::session::{SessionLayer, SessionScope};
use crate::types::{Error, Result};

use super::runtime::JsVm;
use super::sandbox;

/// Names blanked on every VM release.
///
/// Every request-scoped global must appear here; anything else a script sets
/// survives in the pooled VM on purpose (warm helper state).
pub const RESERVED_NAMES: &[&str] = &[
    "post_data",
    "vars",
    "path_vars",
    "wid",
    "current_box",
    "prev_box",
    "profile",
    "next",
    "auth_flag",
    "url_access",
    "nflow_endpoint",
    "payload",
    "header",
    "form",
    "nflow_data",
    "dromedary_data",
    "__outputs",
    "__flow_name",
    "__flow_app",
];

/// Pure-JS helper namespaces installed once per VM
const STATIC_HELPERS_JS: &str = r##"
var querystring = {
    parse: function (s) {
        var out = {};
        if (!s) return out;
        var pairs = String(s).replace(/^\?/, "").split("&");
        for (var i = 0; i < pairs.length; i++) {
            if (!pairs[i]) continue;
            var kv = pairs[i].split("=");
            out[decodeURIComponent(kv[0])] = kv.length > 1 ? decodeURIComponent(kv.slice(1).join("=")) : "";
        }
        return out;
    },
    stringify: function (o) {
        var parts = [];
        for (var k in o) {
            parts.push(encodeURIComponent(k) + "=" + encodeURIComponent(o[k]));
        }
        return parts.join("&");
    }
};
var url = {
    parse: function (u) {
        var m = String(u).match(/^([a-z][a-z0-9+.-]*):\/\/([^\/?#:]*)(?::(\d+))?([^?#]*)(?:\?([^#]*))?(?:#(.*))?$/i);
        if (!m) return { href: String(u) };
        return {
            href: String(u),
            protocol: m[1] + ":",
            hostname: m[2],
            port: m[3] || "",
            pathname: m[4] || "/",
            search: m[5] ? "?" + m[5] : "",
            query: querystring.parse(m[5] || ""),
            hash: m[6] ? "#" + m[6] : ""
        };
    }
};
var util = {
    format: function () {
        var args = Array.prototype.slice.call(arguments);
        var fmt = String(args.shift() || "");
        return fmt.replace(/%[sdj%]/g, function (m) {
            if (m === "%%") return "%";
            if (!args.length) return m;
            var v = args.shift();
            if (m === "%j") { try { return JSON.stringify(v); } catch (e) { return "[circular]"; } }
            if (m === "%d") return Number(v);
            return String(v);
        });
    }
};
var path = {
    join: function () {
        var parts = Array.prototype.slice.call(arguments).filter(function (p) { return p !== ""; });
        return parts.join("/").replace(/\/+/g, "/");
    },
    basename: function (p) {
        var parts = String(p).split("/");
        return parts[parts.length - 1];
    },
    dirname: function (p) {
        var parts = String(p).split("/");
        parts.pop();
        return parts.join("/") || "/";
    }
};
"##;

/// Shim translating the public script API onto the `__` host primitives
const REQUEST_SHIM_JS: &str = r##"
function get_session(name, key) {
    var raw = __session_get(name, key);
    return raw === "" ? null : JSON.parse(raw);
}
function set_session(name, key, value) {
    __session_set(name, key, JSON.stringify(value === undefined ? null : value));
}
function delete_session(name) {
    __session_delete(name);
}
function rsp(body, code) {
    __rsp(typeof body === "string" ? body : JSON.stringify(body), code === undefined ? 200 : code);
}
function set_header(name, value) {
    __set_header(String(name), String(value));
}
function redirect(location) {
    __redirect(String(location));
}
function get_token() {
    return nflow_endpoint && nflow_endpoint.token ? nflow_endpoint.token : "";
}
"##;

/// Install the once-per-VM helpers: sandbox (when enabled), console, static
/// namespaces, `env`, and the whitelisted capability groups.
pub fn install_static(vm: &JsVm, config: &VmPoolConfig, env: &Value) -> Result<()> {
    if config.enable_sandbox {
        sandbox::install(vm)?;
    } else {
        sandbox::install_console(vm)?;
    }

    vm.eval_program(STATIC_HELPERS_JS)?;
    vm.set_global_json("env", env)?;

    install_crypto(vm)?;
    if config.enable_filesystem {
        install_fs(vm)?;
    }
    Ok(())
}

fn install_crypto(vm: &JsVm) -> Result<()> {
    vm.with_context(|ctx| {
        let conv = |e: rquickjs::Error| Error::Script(format!("crypto install: {}", e));
        let crypto = Object::new(ctx.clone()).map_err(conv)?;
        crypto
            .set(
                "randomUUID",
                Function::new(ctx.clone(), || uuid::Uuid::new_v4().to_string()).map_err(conv)?,
            )
            .map_err(conv)?;
        crypto
            .set(
                "random",
                Function::new(ctx.clone(), || rand::random::<f64>()).map_err(conv)?,
            )
            .map_err(conv)?;
        ctx.globals().set("crypto", crypto).map_err(conv)?;
        Ok(())
    })
}

/// Filesystem helpers, only present when `vm_pool.enable_filesystem`
fn install_fs(vm: &JsVm) -> Result<()> {
    vm.with_context(|ctx| {
        let conv = |e: rquickjs::Error| Error::Script(format!("fs install: {}", e));
        let fs = Object::new(ctx.clone()).map_err(conv)?;
        fs.set(
            "readFile",
            Function::new(ctx.clone(), |path: String| -> String {
                std::fs::read_to_string(&path).unwrap_or_default()
            })
            .map_err(conv)?,
        )
        .map_err(conv)?;
        fs.set(
            "writeFile",
            Function::new(ctx.clone(), |path: String, contents: String| -> bool {
                std::fs::write(&path, contents).is_ok()
            })
            .map_err(conv)?,
        )
        .map_err(conv)?;
        ctx.globals().set("fs", fs).map_err(conv)?;
        Ok(())
    })
}

/// Everything a run binds into its VM before the first step
pub struct RequestBindings {
    pub wid: String,
    pub post_data: Value,
    pub vars: Value,
    pub payload: Value,
    pub header: Value,
    pub form: Value,
    pub profile: Value,
    /// `{ path, method, token }` exposed as `nflow_endpoint`
    pub endpoint: Value,
    pub sessions: Arc<SessionLayer>,
    pub scope: SessionScope,
    pub response: Arc<Mutex<ResponseBuffer>>,
}

impl RequestBindings {
    /// Bind the data globals and host functions for one run
    pub fn install(&self, vm: &JsVm) -> Result<()> {
        vm.set_global_str("wid", &self.wid)?;
        vm.set_global_json("post_data", &self.post_data)?;
        vm.set_global_json("vars", &self.vars)?;
        vm.set_global_json("path_vars", &self.vars)?;
        vm.set_global_json("payload", &self.payload)?;
        vm.set_global_json("header", &self.header)?;
        vm.set_global_json("form", &self.form)?;
        vm.set_global_json("profile", &self.profile)?;
        vm.set_global_json("nflow_endpoint", &self.endpoint)?;
        vm.set_global_str("next", "")?;
        vm.set_global_str("current_box", "")?;
        vm.set_global_str("prev_box", "")?;

        self.install_session_fns(vm)?;
        self.install_http_fns(vm)?;
        vm.eval_program(REQUEST_SHIM_JS)
    }

    fn install_session_fns(&self, vm: &JsVm) -> Result<()> {
        let conv = |e: rquickjs::Error| Error::Script(format!("session install: {}", e));

        let get_sessions = self.sessions.clone();
        let get_scope = self.scope.clone();
        let set_sessions = self.sessions.clone();
        let set_scope = self.scope.clone();
        let del_sessions = self.sessions.clone();
        let del_scope = self.scope.clone();

        vm.with_context(|ctx| {
            let globals = ctx.globals();
            globals
                .set(
                    "__session_get",
                    Function::new(ctx.clone(), move |name: String, key: String| -> String {
                        match get_sessions.get_value(&name, &key, &get_scope) {
                            Ok(Some(value)) => value.to_string(),
                            Ok(None) => String::new(),
                            Err(e) => {
                                tracing::warn!(session = name.as_str(), error = %e, "session read failed");
                                String::new()
                            }
                        }
                    })
                    .map_err(conv)?,
                )
                .map_err(conv)?;

            globals
                .set(
                    "__session_set",
                    Function::new(
                        ctx.clone(),
                        move |name: String, key: String, raw: String| {
                            let value =
                                serde_json::from_str(&raw).unwrap_or(Value::Null);
                            if let Err(e) = set_sessions.set_value(&name, &key, value, &set_scope) {
                                tracing::warn!(session = name.as_str(), error = %e, "session write failed");
                            }
                        },
                    )
                    .map_err(conv)?,
                )
                .map_err(conv)?;

            globals
                .set(
                    "__session_delete",
                    Function::new(ctx.clone(), move |name: String| {
                        if let Err(e) = del_sessions.delete_session(&name, &del_scope) {
                            tracing::warn!(session = name.as_str(), error = %e, "session delete failed");
                        }
                    })
                    .map_err(conv)?,
                )
                .map_err(conv)?;
            Ok(())
        })
    }

    fn install_http_fns(&self, vm: &JsVm) -> Result<()> {
        let conv = |e: rquickjs::Error| Error::Script(format!("http install: {}", e));

        let rsp_buffer = self.response.clone();
        let header_buffer = self.response.clone();
        let redirect_buffer = self.response.clone();

        vm.with_context(|ctx| {
            let globals = ctx.globals();
            globals
                .set(
                    "__rsp",
                    Function::new(ctx.clone(), move |body: String, code: i32| {
                        let mut buffer = rsp_buffer.lock();
                        buffer.set_status(code.clamp(100, 599) as u16);
                        buffer.write_body(body.as_bytes());
                    })
                    .map_err(conv)?,
                )
                .map_err(conv)?;

            globals
                .set(
                    "__set_header",
                    Function::new(ctx.clone(), move |name: String, value: String| {
                        header_buffer.lock().set_header(&name, &value);
                    })
                    .map_err(conv)?,
                )
                .map_err(conv)?;

            globals
                .set(
                    "__redirect",
                    Function::new(ctx.clone(), move |location: String| {
                        let mut buffer = redirect_buffer.lock();
                        buffer.set_status(307);
                        buffer.set_header("Location", &location);
                    })
                    .map_err(conv)?,
                )
                .map_err(conv)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryBackend;
    use crate::vm::tracker::VmLimits;
    use serde_json::json;
    use std::time::Duration;

    fn vm() -> JsVm {
        JsVm::new(
            0,
            VmLimits {
                memory_bytes: 64 * 1024 * 1024,
                time: Duration::from_secs(5),
                operations: u64::MAX,
                check_interval: 10,
            },
        )
        .unwrap()
    }

    fn bindings() -> (RequestBindings, Arc<Mutex<ResponseBuffer>>, Arc<SessionLayer>) {
        let sessions = Arc::new(SessionLayer::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(60),
        ));
        let response = Arc::new(Mutex::new(ResponseBuffer::new()));
        let bindings = RequestBindings {
            wid: "w-1".into(),
            post_data: json!({ "a": 1 }),
            vars: json!({ "id": "42" }),
            payload: json!({}),
            header: json!({}),
            form: json!({}),
            profile: Value::Null,
            endpoint: json!({ "path": "/x", "method": "GET", "token": "tk" }),
            sessions: sessions.clone(),
            scope: SessionScope::new("cookie-1"),
            response: response.clone(),
        };
        (bindings, response, sessions)
    }

    #[test]
    fn test_static_helpers() {
        let vm = vm();
        install_static(&vm, &VmPoolConfig::default(), &json!({ "stage": "test" })).unwrap();

        vm.eval_program("var q = querystring.parse('a=1&b=x%20y');").unwrap();
        assert_eq!(vm.get_global_json("q").unwrap(), json!({ "a": "1", "b": "x y" }));

        vm.eval_program("var u = url.parse('https://host:8080/p?a=1');").unwrap();
        let parsed = vm.get_global_json("u").unwrap();
        assert_eq!(parsed["hostname"], "host");
        assert_eq!(parsed["query"]["a"], "1");

        vm.eval_program("var uid = crypto.randomUUID();").unwrap();
        assert_eq!(vm.get_global_str("uid").len(), 36);

        assert_eq!(vm.get_global_json("env").unwrap()["stage"], "test");
    }

    #[test]
    fn test_request_bindings_roundtrip() {
        let vm = vm();
        install_static(&vm, &VmPoolConfig::default(), &json!({})).unwrap();
        let (bindings, response, _) = bindings();
        bindings.install(&vm).unwrap();

        vm.eval_program("rsp({ id: vars.id, a: post_data.a }, 201); set_header('X-Test', '1');")
            .unwrap();

        let buffer = response.lock();
        assert_eq!(buffer.status(), 201);
        assert_eq!(
            serde_json::from_slice::<Value>(buffer.body()).unwrap(),
            json!({ "id": "42", "a": 1 })
        );
        assert_eq!(buffer.header("X-Test").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_session_fns() {
        let vm = vm();
        install_static(&vm, &VmPoolConfig::default(), &json!({})).unwrap();
        let (bindings, _, sessions) = bindings();
        let scope = bindings.scope.clone();
        bindings.install(&vm).unwrap();

        vm.eval_program("set_session('s', 'k', { n: 5 }); var got = get_session('s', 'k');")
            .unwrap();
        assert_eq!(vm.get_global_json("got").unwrap(), json!({ "n": 5 }));
        assert_eq!(
            sessions.get_value("s", "k", &scope).unwrap(),
            Some(json!({ "n": 5 }))
        );

        vm.eval_program("delete_session('s'); var gone = get_session('s', 'k');")
            .unwrap();
        assert_eq!(vm.get_global_json("gone").unwrap(), Value::Null);
    }

    #[test]
    fn test_reserved_names_cleared() {
        let vm = vm();
        let (bindings, _, _) = bindings();
        bindings.install(&vm).unwrap();

        vm.clear_globals(RESERVED_NAMES).unwrap();
        assert_eq!(vm.get_global_json("post_data").unwrap(), Value::Null);
        assert_eq!(vm.get_global_json("wid").unwrap(), Value::Null);
    }
}
