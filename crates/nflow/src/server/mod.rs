//! HTTP Surface
//!
//! Router, catch-all handler and shared state.

pub mod handler;
pub mod router;
pub mod state;

pub use handler::{NEXT_NODE_PARAM, SESSION_COOKIE};
pub use router::create_router;
pub use state::AppState;
