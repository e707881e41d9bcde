//! Health Check API Handler

use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::context::SchedulerContext;

/// GET /health
/// Reports the registered queue handlers
pub async fn health_check(State(ctx): State<Arc<SchedulerContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "handlers": ctx.handlers.names(),
    }))
}
