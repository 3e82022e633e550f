//! Shared Types
//!
//! Error taxonomy and result alias used across the runtime.

use serde::{Deserialize, Serialize};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
///
/// Each variant maps onto one row of the user-visible error taxonomy:
/// `NotFound` → 404, `ResourceLimit` → 408, everything else that reaches the
/// HTTP layer → 500. `Transient` never leaves the tracker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Malformed {
        message: String,
        node_type: Option<String>,
    },

    #[error("Script execution exceeded resource limits: {0}")]
    ResourceLimit(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("vm pool exhausted")]
    PoolExhausted,

    #[error("process killed")]
    Killed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::ResourceLimit(_) => 408,
            _ => 500,
        }
    }

    /// JSON body for this error
    ///
    /// Always carries at least `message` plus either `code` or `error`.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            Error::Malformed { message, node_type } => serde_json::json!({
                "error": message,
                "type": node_type,
                "message": message,
            }),
            other => serde_json::json!({
                "message": other.to_string(),
                "code": other.status_code(),
            }),
        }
    }
}

/// Lifecycle state of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Wait,
    Run,
    End,
    Error,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Wait
    }
}

/// Interpret a node-data flag that may be stored as bool, number or string.
///
/// The strings `"false"` and `"0"`, empty strings, `false`, `0` and
/// null/absent all read as disabled; anything else is enabled.
pub fn is_truthy_flag(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(serde_json::Value::String(s)) => {
            !s.is_empty() && s != "false" && s != "0"
        }
        Some(_) => true,
    }
}
