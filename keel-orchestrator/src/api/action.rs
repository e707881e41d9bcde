//! Action-instance API Handlers
//!
//! The callback surface used by executors, plus operator controls.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use keel_core::domain::instance::ActionInstance;
use keel_core::dto::work::DoneCallback;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::context::SchedulerContext;
use crate::engine::Cascade;
use crate::service::action_service;

#[derive(Debug, Default, Deserialize)]
pub struct ResetParams {
    #[serde(default)]
    pub force_full: bool,
}

/// POST /action-instance/{id}/complete
/// Done callback from an executor
pub async fn complete_action(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
    Json(callback): Json<DoneCallback>,
) -> ApiResult<Json<Cascade>> {
    tracing::info!("Action-instance {} completed with {}", id, callback.status);

    let cascade = action_service::complete_action(&ctx, id, callback).await?;
    Ok(Json(cascade))
}

/// POST /action-instance/{id}/reset?force_full=
pub async fn reset_action(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
    Query(params): Query<ResetParams>,
) -> ApiResult<Json<ActionInstance>> {
    let action = action_service::reset_action_instance(&ctx, id, params.force_full).await?;
    Ok(Json(action))
}

/// POST /action-instance/{id}/cancel
pub async fn cancel_action(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Cascade>> {
    tracing::info!("Canceling action-instance {}", id);

    let cascade = action_service::cancel_action_instance(&ctx, id).await?;
    Ok(Json(cascade))
}

/// GET /action-instance/{id}/completing
pub async fn get_completing(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let completing = action_service::is_completing(&ctx, id).await?;
    Ok(Json(json!({ "completing": completing })))
}

/// DELETE /action-instance/{id}/completing
/// Clears a completing marker left behind by a crashed master
pub async fn clear_completing(
    State(ctx): State<Arc<SchedulerContext>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let cleared = action_service::clear_completing(&ctx, id).await?;
    Ok(Json(json!({ "cleared": cleared })))
}
