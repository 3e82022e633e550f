//! HTTP Router
//!
//! A health endpoint plus the catch-all workflow entry; everything else is
//! decided by starter matching inside the handler.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::tracker::TrackerSnapshot;
use crate::vm::PoolMetrics;

use super::handler::handle_any;
use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Every other path is a candidate workflow entry.
        .fallback(handle_any)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    app: String,
    processes: usize,
    vm_pool: PoolMetrics,
    tracker: TrackerSnapshot,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.engine();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        app: state.app_name().to_string(),
        processes: engine.processes.len(),
        vm_pool: engine.vm_pool.metrics(),
        tracker: engine.tracker.snapshot(),
    })
}
