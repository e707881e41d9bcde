//! Pipeline Service
//!
//! Launching, resetting, canceling and inspecting pipeline-instances.

use chrono::Utc;
use keel_core::domain::instance::{ActionInstance, PipelineInstance, UNSAVED_ID};
use keel_core::domain::status::{NEW, StatusCatalog};
use keel_core::domain::template::PipelineTemplate;
use keel_core::domain::work::WorkRequest;
use keel_core::dto::pipeline::LaunchPipeline;
use std::collections::BTreeMap;

use super::{Result, ServiceError, cancel_workers, load_tree, save_recalculated};
use crate::context::SchedulerContext;
use crate::engine::{EngineError, WorkflowEngine};
use crate::selector;

/// Builds a started, unsaved pipeline-instance: only the first stage is
/// materialized and the first action-order group of each workflow is READY.
pub fn launch_tree(
    catalog: &StatusCatalog,
    template: &PipelineTemplate,
    priority: i32,
    parameters: BTreeMap<String, String>,
) -> std::result::Result<PipelineInstance, EngineError> {
    let mut tree = PipelineInstance {
        id: UNSAVED_ID,
        pipeline_id: template.id,
        status_id: NEW,
        priority,
        created_date: Utc::now(),
        start_date: None,
        end_date: None,
        parameters,
        stage_instances: vec![],
    };

    WorkflowEngine::new(catalog, template).start_pipeline(&mut tree)?;
    Ok(tree)
}

/// Launch a new pipeline-instance
pub async fn launch_pipeline(ctx: &SchedulerContext, req: LaunchPipeline) -> Result<PipelineInstance> {
    let template = ctx
        .store
        .find_template(req.pipeline_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Pipeline {}", req.pipeline_id)))?;

    let mut tree = launch_tree(&ctx.catalog, &template, req.priority, req.parameters)?;
    ctx.store.save_tree(&mut tree).await?;

    tracing::info!(
        "Launched pipeline-instance {} of '{}' (priority {})",
        tree.id,
        template.name,
        tree.priority
    );

    Ok(tree)
}

/// Restart a pipeline-instance from its first stage
pub async fn reset_pipeline_instance(ctx: &SchedulerContext, id: i64) -> Result<PipelineInstance> {
    let lease = ctx.guards.begin_calculation(id).await?;
    let result = reset_tree(ctx, id).await;
    ctx.guards.release(lease).await?;

    let (tree, displaced) = result?;
    cancel_workers(ctx, &displaced).await;

    tracing::info!("Reset pipeline-instance {}", id);
    Ok(tree)
}

async fn reset_tree(
    ctx: &SchedulerContext,
    id: i64,
) -> Result<(PipelineInstance, Vec<ActionInstance>)> {
    let (mut tree, template) = load_tree(ctx, id).await?;
    let before = tree.clone();

    let outcome = WorkflowEngine::new(&ctx.catalog, &template).reset_pipeline(&mut tree)?;
    save_recalculated(ctx, &before, &mut tree).await?;

    Ok((tree, outcome.displaced))
}

/// Cancel every unresolved node of a pipeline-instance
pub async fn cancel_pipeline_instance(ctx: &SchedulerContext, id: i64) -> Result<PipelineInstance> {
    let lease = ctx.guards.begin_calculation(id).await?;
    let result = cancel_tree(ctx, id).await;
    ctx.guards.release(lease).await?;

    let (tree, in_flight, canceled) = result?;
    cancel_workers(ctx, &in_flight).await;

    tracing::info!(
        "Canceled pipeline-instance {} ({} action-instance(s), {} in flight)",
        id,
        canceled,
        in_flight.len()
    );
    Ok(tree)
}

async fn cancel_tree(
    ctx: &SchedulerContext,
    id: i64,
) -> Result<(PipelineInstance, Vec<ActionInstance>, usize)> {
    let (mut tree, template) = load_tree(ctx, id).await?;
    let before = tree.clone();

    let outcome = WorkflowEngine::new(&ctx.catalog, &template).cancel_pipeline(&mut tree)?;
    save_recalculated(ctx, &before, &mut tree).await?;

    Ok((tree, outcome.in_flight, outcome.canceled))
}

/// Human-readable dump of a pipeline-instance tree
pub async fn render_tree(ctx: &SchedulerContext, id: i64) -> Result<String> {
    let tree = ctx
        .store
        .load_tree(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Pipeline instance {}", id)))?;

    Ok(tree.render(&ctx.catalog))
}

/// Current dispatch queue, in dispatch order
pub async fn queue(ctx: &SchedulerContext) -> Result<Vec<WorkRequest>> {
    Ok(selector::fetch_work(ctx.store.as_ref()).await?)
}
