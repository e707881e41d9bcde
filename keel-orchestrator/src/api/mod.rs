//! API Module
//!
//! HTTP API layer for the master.
//! Each submodule handles endpoints for a specific domain.

pub mod action;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod worker;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::context::SchedulerContext;

/// Create the main API router with all endpoints
pub fn create_router(ctx: Arc<SchedulerContext>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .route("/queue", get(pipeline::get_queue))
        // Pipeline endpoints
        .route("/pipeline/launch", post(pipeline::launch_pipeline))
        .route("/pipeline-instance/{id}/tree", get(pipeline::get_tree))
        .route("/pipeline-instance/{id}/reset", post(pipeline::reset_pipeline))
        .route("/pipeline-instance/{id}/cancel", post(pipeline::cancel_pipeline))
        // Action-instance endpoints
        .route("/action-instance/{id}/complete", post(action::complete_action))
        .route("/action-instance/{id}/reset", post(action::reset_action))
        .route("/action-instance/{id}/cancel", post(action::cancel_action))
        .route(
            "/action-instance/{id}/completing",
            get(action::get_completing).delete(action::clear_completing),
        )
        // Worker endpoints
        .route("/worker/register", post(worker::register_worker))
        .route("/worker/{address}/heartbeat", post(worker::heartbeat))
        .route("/workers", get(worker::list_workers))
        // Add state and middleware
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
}
