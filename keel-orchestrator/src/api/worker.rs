//! Worker API Handlers
//!
//! HTTP endpoints for push-worker registration and heartbeats.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::domain::worker::Worker;
use keel_core::dto::worker::{RegisterWorker, WorkerSummary};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::context::SchedulerContext;
use crate::service::worker_service;

/// POST /worker/register
/// Register (or re-register) a push worker
pub async fn register_worker(
    State(ctx): State<Arc<SchedulerContext>>,
    Json(req): Json<RegisterWorker>,
) -> ApiResult<Json<Worker>> {
    let worker = worker_service::register_worker(&ctx, req).await?;
    Ok(Json(worker))
}

/// POST /worker/{address}/heartbeat
pub async fn heartbeat(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    worker_service::heartbeat(&ctx, &address).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /workers
pub async fn list_workers(
    State(ctx): State<Arc<SchedulerContext>>,
) -> ApiResult<Json<Vec<WorkerSummary>>> {
    tracing::debug!("Listing workers");

    let workers = worker_service::list_workers(&ctx).await?;
    Ok(Json(workers))
}
