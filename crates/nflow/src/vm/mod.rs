//! Embedded JavaScript VMs
//!
//! QuickJS wrapper, per-run resource tracking, sandboxing, the host
//! capability registry and the bounded pool.

pub mod globals;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod tracker;

pub use globals::{RequestBindings, RESERVED_NAMES};
pub use pool::{PoolMetrics, VmGuard, VmPool, ACQUIRE_TIMEOUT};
pub use runtime::{js_to_json, json_to_js, JsVm};
pub use tracker::{ResourceTracker, VmLimits, WATCH_TICK};
