//! Server Application State
//!
//! Shared state handed to every request handler: the engine, the served app
//! name and the loaded configuration.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::Engine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Arc<Engine>,
    app_name: String,
    config: Config,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, app_name: String, config: Config) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                app_name,
                config,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
