//! Caches
//!
//! The shared TTL cache primitive and the script transform/program cache
//! built on top of it.

pub mod resource;
pub mod script;

pub use resource::{spawn_sweeper, TtlCache};
pub use script::{CompiledProgram, ScriptCache, MAIN_CALL};
