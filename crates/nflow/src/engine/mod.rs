//! Workflow Execution
//!
//! The request context, the step registry with its four strategies, and the
//! per-request execution engine.

pub mod context;
pub mod executor;
pub mod registry;
pub mod steps;

pub use context::{RequestContext, ResponseBuffer};
pub use executor::{Engine, AUTH_SESSION, FORM_SESSION, LOGIN_PATH, LOG_SESSION, WID_HEADER};
pub use registry::{Step, StepExecution, StepOutcome, StepRegistry};
pub use steps::FORK_WID_HEADER;
