//! QuickJS VM Wrapper
//!
//! Provides a safe wrapper around one embedded QuickJS runtime plus its
//! context, the JSON bridge between host values and the script world, and
//! the error classification that turns resource interrupts into the 408 path.

use std::sync::Arc;

use rquickjs::{CatchResultExt, Context, Runtime, Value as JsValue};

use crate::types::{Error, Result};

use super::tracker::{LimitKind, ResourceTracker, VmLimits};

/// A JavaScript VM instance
///
/// Wraps QuickJS and provides methods for evaluating programs and moving
/// JSON-shaped values in and out of the global scope. A VM is owned
/// exclusively by its acquirer until released back to the pool.
pub struct JsVm {
    id: u64,
    runtime: Runtime,
    context: Context,
    tracker: Arc<ResourceTracker>,
}

// QuickJS is single-threaded; the pool hands a VM to exactly one request at a
// time, so cross-thread moves between acquires are safe, and shared
// references only ever execute from the owning run.
unsafe impl Send for JsVm {}
unsafe impl Sync for JsVm {}

impl JsVm {
    /// Create a new VM with its resource tracker armed but idle
    pub fn new(id: u64, limits: VmLimits) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| Error::Backend(format!("vm create: {}", e)))?;
        runtime.set_max_stack_size(1024 * 1024);

        let tracker = Arc::new(ResourceTracker::new(limits));
        let handler_tracker = tracker.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || handler_tracker.tick_operation())));

        let context =
            Context::full(&runtime).map_err(|e| Error::Backend(format!("vm context: {}", e)))?;

        Ok(Self {
            id,
            runtime,
            context,
            tracker,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// Current allocator footprint in bytes
    pub fn memory_used(&self) -> usize {
        self.runtime.memory_usage().malloc_size.max(0) as usize
    }

    /// Arm the tracker and the allocator cap for a new run
    pub fn begin_run(&self) {
        let baseline = self.memory_used();
        self.tracker.begin(baseline);
        let cap = baseline.saturating_add(self.tracker.limits().memory_bytes);
        self.runtime.set_memory_limit(cap);
    }

    /// Drop the allocator cap and collect garbage after a run
    pub fn end_run(&self) {
        // usize::MAX maps onto the engine's "unlimited" sentinel.
        self.runtime.set_memory_limit(usize::MAX);
        self.runtime.run_gc();
    }

    /// Run a prepared program in the global scope.
    ///
    /// Resource interrupts and allocator failures classify as
    /// [`Error::ResourceLimit`]; everything else a script throws is
    /// [`Error::Script`].
    pub fn eval_program(&self, source: &str) -> Result<()> {
        let result = self.context.with(|ctx| {
            let mut options = rquickjs::context::EvalOptions::default();
            options.global = true;
            options.strict = false;
            options.backtrace_barrier = true;

            ctx.eval_with_options::<JsValue, _>(source, options)
                .catch(&ctx)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });

        match result {
            Ok(()) => Ok(()),
            Err(message) => Err(self.classify_error(message)),
        }
    }

    fn classify_error(&self, message: String) -> Error {
        if let Some(reason) = self.tracker.limit_message() {
            return Error::ResourceLimit(reason);
        }
        if message.contains("out of memory") {
            self.tracker.trip(LimitKind::Memory);
            return Error::ResourceLimit(format!(
                "memory growth exceeded {} bytes",
                self.tracker.limits().memory_bytes
            ));
        }
        Error::Script(message)
    }

    /// Set a global to a JSON value
    pub fn set_global_json(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        self.context.with(|ctx| {
            let js = json_to_js(&ctx, value)?;
            ctx.globals()
                .set(name, js)
                .map_err(|e| Error::Script(format!("set {}: {}", name, e)))
        })
    }

    /// Set a global string
    pub fn set_global_str(&self, name: &str, value: &str) -> Result<()> {
        self.set_global_json(name, &serde_json::Value::String(value.to_string()))
    }

    /// Read a global back as JSON; undefined reads as `Null`
    pub fn get_global_json(&self, name: &str) -> Result<serde_json::Value> {
        self.context.with(|ctx| {
            let value: JsValue = ctx
                .globals()
                .get(name)
                .map_err(|e| Error::Script(format!("get {}: {}", name, e)))?;
            js_to_json(&ctx, value)
        })
    }

    /// Read a global string; non-strings and undefined read as empty
    pub fn get_global_str(&self, name: &str) -> String {
        self.get_global_json(name)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default()
    }

    /// Blank a list of globals (used for the reserved names on release)
    pub fn clear_globals(&self, names: &[&str]) -> Result<()> {
        self.context.with(|ctx| {
            let globals = ctx.globals();
            for name in names {
                globals
                    .set(*name, rquickjs::Undefined)
                    .map_err(|e| Error::Script(format!("clear {}: {}", name, e)))?;
            }
            Ok(())
        })
    }

    /// Run host-side setup code with the raw context
    pub fn with_context<R>(&self, f: impl FnOnce(&rquickjs::Ctx<'_>) -> Result<R>) -> Result<R> {
        self.context.with(|ctx| f(&ctx))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a JSON value to a JavaScript value
pub fn json_to_js<'js>(
    ctx: &rquickjs::Ctx<'js>,
    json: &serde_json::Value,
) -> Result<JsValue<'js>> {
    use rquickjs::IntoJs;

    let conv = |e: rquickjs::Error| Error::Script(format!("into js: {}", e));

    match json {
        serde_json::Value::Null => Ok(JsValue::new_undefined(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Ok(JsValue::new_int(ctx.clone(), small))
                } else {
                    Ok(JsValue::new_float(ctx.clone(), i as f64))
                }
            } else if let Some(f) = n.as_f64() {
                Ok(JsValue::new_float(ctx.clone(), f))
            } else {
                Ok(JsValue::new_undefined(ctx.clone()))
            }
        }
        serde_json::Value::String(s) => s.as_str().into_js(ctx).map_err(conv),
        serde_json::Value::Array(items) => {
            let array = rquickjs::Array::new(ctx.clone()).map_err(conv)?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, json_to_js(ctx, item)?).map_err(conv)?;
            }
            Ok(array.into_value())
        }
        serde_json::Value::Object(map) => {
            let object = rquickjs::Object::new(ctx.clone()).map_err(conv)?;
            for (key, value) in map {
                object
                    .set(key.as_str(), json_to_js(ctx, value)?)
                    .map_err(conv)?;
            }
            Ok(object.into_value())
        }
    }
}

/// Convert a JavaScript value to JSON
pub fn js_to_json<'js>(ctx: &rquickjs::Ctx<'js>, value: JsValue<'js>) -> Result<serde_json::Value> {
    let conv = |e: rquickjs::Error| Error::Script(format!("from js: {}", e));

    match value.type_of() {
        rquickjs::Type::Undefined | rquickjs::Type::Null | rquickjs::Type::Uninitialized => {
            Ok(serde_json::Value::Null)
        }
        rquickjs::Type::Bool => {
            let b: bool = value.get().map_err(conv)?;
            Ok(serde_json::Value::Bool(b))
        }
        rquickjs::Type::Int => {
            let i: i32 = value.get().map_err(conv)?;
            Ok(serde_json::Value::from(i as i64))
        }
        rquickjs::Type::Float => {
            let f: f64 = value.get().map_err(conv)?;
            Ok(serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null))
        }
        rquickjs::Type::String => {
            let s: String = value.get().map_err(conv)?;
            Ok(serde_json::Value::String(s))
        }
        rquickjs::Type::Array => {
            let array: rquickjs::Array = value.get().map_err(conv)?;
            let mut items = Vec::with_capacity(array.len());
            for i in 0..array.len() {
                let item: JsValue = array.get(i).map_err(conv)?;
                items.push(js_to_json(ctx, item)?);
            }
            Ok(serde_json::Value::Array(items))
        }
        rquickjs::Type::Object => {
            let object: rquickjs::Object = value.get().map_err(conv)?;
            let mut map = serde_json::Map::new();
            for prop in object.props::<String, JsValue>() {
                let (key, value) = prop.map_err(conv)?;
                map.insert(key, js_to_json(ctx, value)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        _ => Ok(serde_json::Value::Null),
    }
}
