//! Step Strategies
//!
//! One module per node type: `js`, `dromedary`, `gorutine` and
//! `dromedary_callback`.

mod callback;
mod fanout;
mod js;
mod plugin;

pub use callback::CallbackStep;
pub use fanout::{FanOutStep, FORK_WID_HEADER};
pub use js::JsStep;
pub use plugin::{plugin_name, PluginStep};
