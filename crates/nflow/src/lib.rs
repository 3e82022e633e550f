//! nflow: multi-tenant workflow runtime
//!
//! Dispatches HTTP requests onto user-authored node graphs and executes them
//! node by node: starter routing over cached playbooks, pooled embedded
//! JavaScript VMs with resource limits, pluggable step strategies, an async
//! batched execution-log tracker, and TTL-cached sessions.

pub mod cache;
pub mod config;
pub mod engine;
pub mod playbook;
pub mod plugin;
pub mod process;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod tracker;
pub mod types;
pub mod vm;

pub use config::Config;
pub use engine::{Engine, RequestContext};
pub use playbook::{Controller, Node, Playbook, PlaybookStore, Vars};
pub use types::{Error, Result};
