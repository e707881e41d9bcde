//! Pipeline API Handlers
//!
//! HTTP endpoints for launching and steering pipeline-instances.

use axum::{
    Json,
    extract::{Path, State},
};
use keel_core::domain::instance::PipelineInstance;
use keel_core::domain::work::WorkRequest;
use keel_core::dto::pipeline::LaunchPipeline;
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::context::SchedulerContext;
use crate::service::pipeline_service;

/// POST /pipeline/launch
/// Launch a new pipeline-instance
pub async fn launch_pipeline(
    State(ctx): State<Arc<SchedulerContext>>,
    Json(req): Json<LaunchPipeline>,
) -> ApiResult<Json<PipelineInstance>> {
    tracing::info!("Launching pipeline {}", req.pipeline_id);

    let tree = pipeline_service::launch_pipeline(&ctx, req).await?;
    Ok(Json(tree))
}

/// GET /pipeline-instance/{id}/tree
/// Plain-text dump of the instance tree
pub async fn get_tree(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
) -> ApiResult<String> {
    Ok(pipeline_service::render_tree(&ctx, id).await?)
}

/// POST /pipeline-instance/{id}/reset
pub async fn reset_pipeline(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PipelineInstance>> {
    tracing::info!("Resetting pipeline-instance {}", id);

    let tree = pipeline_service::reset_pipeline_instance(&ctx, id).await?;
    Ok(Json(tree))
}

/// POST /pipeline-instance/{id}/cancel
pub async fn cancel_pipeline(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PipelineInstance>> {
    tracing::info!("Canceling pipeline-instance {}", id);

    let tree = pipeline_service::cancel_pipeline_instance(&ctx, id).await?;
    Ok(Json(tree))
}

/// GET /queue
/// The dispatch queue as the next cycle would see it
pub async fn get_queue(State(ctx): State<Arc<SchedulerContext>>) -> ApiResult<Json<Vec<WorkRequest>>> {
    tracing::debug!("Listing dispatch queue");

    let queue = pipeline_service::queue(&ctx).await?;
    Ok(Json(queue))
}
