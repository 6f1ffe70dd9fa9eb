//! HTTP API for the orchestration server.
//!
//! Provides endpoints for:
//! - Run lifecycle (`/v1/runs`, `/v1/runs/:run_id`, cancel, feedback and replay)
//! - Live progress over SSE (`/v1/runs/:run_id/events`)
//! - Team introspection (`/v1/team`)
//! - Health check (`/health`) and Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Browser dashboards poll and subscribe cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/v1/runs",
            post(handlers::create_run).get(handlers::list_runs),
        )
        .route("/v1/runs/:run_id", get(handlers::get_run))
        .route("/v1/runs/:run_id/outputs", get(handlers::get_outputs))
        .route("/v1/runs/:run_id/events", get(handlers::run_events))
        .route("/v1/runs/:run_id/cancel", post(handlers::cancel_run))
        .route("/v1/runs/:run_id/feedback", post(handlers::submit_feedback))
        .route("/v1/runs/:run_id/replay", post(handlers::replay_task))
        .route("/v1/team", get(handlers::get_team))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
