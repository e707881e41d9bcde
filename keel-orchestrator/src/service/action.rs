//! Action Service
//!
//! Completion callbacks, resets and cancellation of single action-instances.
//! Every tree mutation runs under the pipeline-instance's calculating marker;
//! completions additionally hold the completing marker of their action.

use keel_core::domain::instance::{ActionInstance, PipelineInstance};
use keel_core::domain::status::{CANCELED, FAILED, StatusId, is_resolved};
use keel_core::domain::work::WorkRequest;
use keel_core::dto::work::DoneCallback;
use serde_json::json;
use std::collections::BTreeMap;

use super::{Result, ServiceError, cancel_workers, load_tree, save_recalculated};
use crate::context::SchedulerContext;
use crate::engine::{Cascade, WorkflowEngine};

async fn find_action(ctx: &SchedulerContext, id: i64) -> Result<ActionInstance> {
    ctx.store
        .find_action(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Action instance {}", id)))
}

/// What a completion writes besides the status
#[derive(Debug, Default)]
struct Outputs {
    parameters: Option<BTreeMap<String, String>>,
    output: Option<serde_json::Value>,
}

impl From<DoneCallback> for Outputs {
    fn from(callback: DoneCallback) -> Self {
        let output = (callback.stats.is_some() || callback.results.is_some())
            .then(|| json!({ "stats": callback.stats, "results": callback.results }));

        Self {
            parameters: callback.parameters,
            output,
        }
    }
}

/// Applies a terminal status inside the calculating marker
async fn complete_in_tree(
    ctx: &SchedulerContext,
    action: &ActionInstance,
    status_id: StatusId,
    outputs: Outputs,
) -> Result<Cascade> {
    let pipeline_instance_id = action.pipeline_instance_id;

    let lease = ctx.guards.begin_calculation(pipeline_instance_id).await?;
    let result = apply_completion(ctx, action.id, pipeline_instance_id, status_id, outputs).await;
    ctx.guards.release(lease).await?;

    result
}

async fn apply_completion(
    ctx: &SchedulerContext,
    id: i64,
    pipeline_instance_id: i64,
    status_id: StatusId,
    outputs: Outputs,
) -> Result<Cascade> {
    let (mut tree, template) = load_tree(ctx, pipeline_instance_id).await?;
    let before = tree.clone();

    let cascade = WorkflowEngine::new(&ctx.catalog, &template).complete_action(&mut tree, id, status_id)?;
    apply_outputs(&mut tree, id, outputs);

    save_recalculated(ctx, &before, &mut tree).await?;

    tracing::info!(
        "Action-instance {} completed as {}: {}",
        id,
        ctx.catalog.display_name(status_id),
        cascade.summary()
    );
    Ok(cascade)
}

fn apply_outputs(tree: &mut PipelineInstance, id: i64, outputs: Outputs) {
    if let Some(parameters) = outputs.parameters {
        tree.parameters.extend(parameters);
    }

    if let Some(output) = outputs.output {
        if let Some(path) = tree.find_action(id) {
            tree.action_mut(path).output = Some(output);
        }
    }
}

/// Apply an executor's completion callback
pub async fn complete_action(ctx: &SchedulerContext, id: i64, callback: DoneCallback) -> Result<Cascade> {
    let status_id = ctx
        .catalog
        .resolve(&callback.status)
        .ok_or_else(|| ServiceError::BadRequest(format!("Unknown status '{}'", callback.status)))?;

    let action = find_action(ctx, id).await?;

    let completing = ctx
        .guards
        .acquire_completing(action.pipeline_instance_id, action.action_id)
        .await?;
    let result = complete_in_tree(ctx, &action, status_id, callback.into()).await;
    ctx.guards.release(completing).await?;

    result
}

/// Roll an action-instance back to READY.
///
/// Refused while a completion for the same action is being applied. Executors
/// displaced by a forced reset are told to stop once the tree is saved.
pub async fn reset_action_instance(
    ctx: &SchedulerContext,
    id: i64,
    force_full: bool,
) -> Result<ActionInstance> {
    let action = find_action(ctx, id).await?;

    if ctx
        .guards
        .is_completing(action.pipeline_instance_id, action.action_id)
        .await?
    {
        return Err(ServiceError::Conflict(format!(
            "Action instance {} is being completed",
            id
        )));
    }

    let lease = ctx.guards.begin_calculation(action.pipeline_instance_id).await?;
    let result = reset_in_tree(ctx, id, action.pipeline_instance_id, force_full).await;
    ctx.guards.release(lease).await?;

    let displaced = result?;
    cancel_workers(ctx, &displaced).await;

    tracing::info!(
        "Reset action-instance {}{}",
        id,
        if force_full { " (full)" } else { "" }
    );
    find_action(ctx, id).await
}

async fn reset_in_tree(
    ctx: &SchedulerContext,
    id: i64,
    pipeline_instance_id: i64,
    force_full: bool,
) -> Result<Vec<ActionInstance>> {
    let (mut tree, template) = load_tree(ctx, pipeline_instance_id).await?;
    let before = tree.clone();

    let outcome = WorkflowEngine::new(&ctx.catalog, &template).reset_action(&mut tree, id, force_full)?;
    save_recalculated(ctx, &before, &mut tree).await?;

    if !outcome.cascade.stages_opened.is_empty() {
        tracing::debug!("Reset of {} re-opened: {}", id, outcome.cascade.summary());
    }
    Ok(outcome.displaced)
}

/// Cancel one action-instance and cascade the cancellation
pub async fn cancel_action_instance(ctx: &SchedulerContext, id: i64) -> Result<Cascade> {
    let action = find_action(ctx, id).await?;
    if is_resolved(action.status_id) {
        return Err(ServiceError::Conflict(format!(
            "Action instance {} is already resolved",
            id
        )));
    }

    let cascade = complete_in_tree(ctx, &action, CANCELED, Outputs::default()).await?;

    if action.assigned_to.is_some() {
        cancel_workers(ctx, std::slice::from_ref(&action)).await;
    }

    Ok(cascade)
}

/// Fails a request its backend rejected outright
pub async fn fail_dispatch(ctx: &SchedulerContext, request: &WorkRequest, reason: &str) -> Result<Cascade> {
    let action = find_action(ctx, request.action_instance_id).await?;
    if is_resolved(action.status_id) {
        return Err(ServiceError::Conflict(format!(
            "Action instance {} is already resolved",
            action.id
        )));
    }

    let outputs = Outputs {
        parameters: None,
        output: Some(json!({ "stats": null, "results": { "error": reason } })),
    };

    tracing::warn!(
        "Dispatch of action-instance {} failed: {}",
        action.id,
        reason
    );
    complete_in_tree(ctx, &action, FAILED, outputs).await
}

/// Whether a completion for the action-instance is in flight
pub async fn is_completing(ctx: &SchedulerContext, id: i64) -> Result<bool> {
    let action = find_action(ctx, id).await?;
    Ok(ctx
        .guards
        .is_completing(action.pipeline_instance_id, action.action_id)
        .await?)
}

/// Drops a completing marker left behind by a crashed process
pub async fn clear_completing(ctx: &SchedulerContext, id: i64) -> Result<bool> {
    let action = find_action(ctx, id).await?;
    let cleared = ctx
        .guards
        .clear_completing(action.pipeline_instance_id, action.action_id)
        .await?;

    if cleared {
        tracing::warn!("Cleared completing marker of action-instance {}", id);
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::engine::fixtures::{action, pipeline, stage, workflow};
    use crate::handler::HandlerRegistry;
    use crate::handler::testing::FakeHandler;
    use crate::repository::Store;
    use crate::service::pipeline::launch_pipeline;
    use keel_core::domain::instance::PipelineInstance;
    use keel_core::domain::status::{INPROGRESS, NEW, READY, SUCCESS};
    use keel_core::domain::template::PipelineTemplate;
    use keel_core::dto::pipeline::LaunchPipeline;
    use std::sync::Arc;

    fn two_stage() -> PipelineTemplate {
        pipeline(
            1,
            vec![
                stage(1, 1, vec![workflow(10, 1, vec![action(100, 1, 1)])]),
                stage(2, 2, vec![workflow(20, 1, vec![action(200, 1, 1), action(201, 2, 1)])]),
            ],
        )
    }

    fn done(status: &str) -> DoneCallback {
        DoneCallback {
            status: status.to_string(),
            parameters: None,
            stats: None,
            results: None,
        }
    }

    async fn launch(ctx: &SchedulerContext) -> PipelineInstance {
        launch_pipeline(
            ctx,
            LaunchPipeline {
                pipeline_id: 1,
                priority: 0,
                parameters: BTreeMap::from([("BRANCH".to_string(), "main".to_string())]),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_completion_opens_next_stage() {
        let (ctx, store) = context(vec![two_stage()], HandlerRegistry::new()).await;
        let tree = launch(&ctx).await;
        let first = tree.actions().next().unwrap().id;
        store.claim_action(first, "10.0.0.1:9000").await.unwrap();

        let mut callback = done("SUCCESS");
        callback.parameters = Some(BTreeMap::from([("ARTIFACT".to_string(), "build-7.tar".to_string())]));
        callback.results = Some(json!({ "tests": 12 }));

        let cascade = complete_action(&ctx, first, callback).await.unwrap();
        assert_eq!(cascade.workflow, Some(SUCCESS));
        assert_eq!(cascade.stages_completed.len(), 1);
        assert_eq!(cascade.pipeline, None);

        let tree = store.load_tree(tree.id).await.unwrap().unwrap();
        assert_eq!(tree.status_id, INPROGRESS);
        assert_eq!(tree.stage_instances.len(), 2);
        assert_eq!(tree.stage_instances[0].status_id, SUCCESS);
        assert_eq!(tree.parameters["ARTIFACT"], "build-7.tar");

        let completed = store.find_action(first).await.unwrap().unwrap();
        assert_eq!(completed.output.unwrap()["results"]["tests"], 12);

        // later actions see posted parameters in their environment
        let ready = store.ready_work().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].action_id, 200);
        assert_eq!(ready[0].environment["ARTIFACT"], "build-7.tar");
        assert_eq!(ready[0].environment["BRANCH"], "main");
    }

    #[tokio::test]
    async fn test_unknown_status_and_instance() {
        let (ctx, _) = context(vec![two_stage()], HandlerRegistry::new()).await;
        let tree = launch(&ctx).await;
        let first = tree.actions().next().unwrap().id;

        assert!(matches!(
            complete_action(&ctx, first, done("EXPLODED")).await,
            Err(ServiceError::BadRequest(_))
        ));
        assert!(matches!(
            complete_action(&ctx, 999, done("SUCCESS")).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_rejected() {
        let (ctx, _) = context(vec![two_stage()], HandlerRegistry::new()).await;
        let tree = launch(&ctx).await;
        let first = tree.actions().next().unwrap().id;

        complete_action(&ctx, first, done("FAILED")).await.unwrap();
        assert!(matches!(
            complete_action(&ctx, first, done("SUCCESS")).await,
            Err(ServiceError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_requires_in_progress_unless_forced() {
        let (ctx, store) = context(vec![two_stage()], HandlerRegistry::new()).await;
        let tree = launch(&ctx).await;
        let first = tree.actions().next().unwrap().id;

        assert!(matches!(
            reset_action_instance(&ctx, first, false).await,
            Err(ServiceError::Engine(_))
        ));

        store.claim_action(first, "10.0.0.1:9000").await.unwrap();
        let reset = reset_action_instance(&ctx, first, false).await.unwrap();
        assert_eq!(reset.status_id, READY);
        assert!(reset.assigned_to.is_none());

        complete_action(&ctx, first, done("SUCCESS")).await.unwrap();
        let rerun = reset_action_instance(&ctx, first, true).await.unwrap();
        assert_eq!(rerun.status_id, READY);

        // the second stage went dormant until the first succeeds again
        let tree = store.load_tree(tree.id).await.unwrap().unwrap();
        assert!(tree.stage_instances[1].workflow_instances[0]
            .action_instances
            .iter()
            .all(|a| a.status_id == NEW));
    }

    #[tokio::test]
    async fn test_reset_refused_while_completing() {
        let (ctx, _) = context(vec![two_stage()], HandlerRegistry::new()).await;
        let tree = launch(&ctx).await;
        let first = tree.actions().next().unwrap();

        let lease = ctx
            .guards
            .acquire_completing(tree.id, first.action_id)
            .await
            .unwrap();
        assert!(is_completing(&ctx, first.id).await.unwrap());
        assert!(matches!(
            reset_action_instance(&ctx, first.id, true).await,
            Err(ServiceError::Conflict(_))
        ));

        assert!(clear_completing(&ctx, first.id).await.unwrap());
        assert!(!is_completing(&ctx, first.id).await.unwrap());
        ctx.guards.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_cascades_then_stops_worker() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, store) = context(vec![two_stage()], HandlerRegistry::new().register(fake.clone())).await;
        let tree = launch(&ctx).await;
        let first = tree.actions().next().unwrap().id;
        store.claim_action(first, &fake.marker()).await.unwrap();

        let cascade = cancel_action_instance(&ctx, first).await.unwrap();
        assert_eq!(cascade.workflow, Some(CANCELED));
        assert_eq!(cascade.pipeline, Some(CANCELED));
        assert_eq!(*fake.canceled.lock().unwrap(), vec![first]);

        assert!(matches!(
            cancel_action_instance(&ctx, first).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_keeps_claim_made_during_recalculation() {
        let template = pipeline(
            1,
            vec![stage(
                1,
                1,
                vec![
                    workflow(10, 1, vec![action(100, 1, 1)]),
                    workflow(11, 2, vec![action(110, 1, 1), action(111, 2, 1)]),
                ],
            )],
        );
        let (ctx, store) = context(vec![template], HandlerRegistry::new()).await;
        let tree = launch(&ctx).await;
        let ids: Vec<i64> = tree.actions().map(|a| a.id).collect();
        store.claim_action(ids[0], "10.0.0.1:9000").await.unwrap();

        let (mut loaded, template) = load_tree(&ctx, tree.id).await.unwrap();
        let before = loaded.clone();

        // the dispatcher claims the sibling workflow's action meanwhile
        assert!(store.claim_action(ids[1], "10.0.0.2:9000").await.unwrap());

        WorkflowEngine::new(&ctx.catalog, &template)
            .complete_action(&mut loaded, ids[0], SUCCESS)
            .unwrap();
        save_recalculated(&ctx, &before, &mut loaded).await.unwrap();

        let completed = store.find_action(ids[0]).await.unwrap().unwrap();
        assert_eq!(completed.status_id, SUCCESS);

        let claimed = store.find_action(ids[1]).await.unwrap().unwrap();
        assert_eq!(claimed.status_id, INPROGRESS);
        assert_eq!(claimed.assigned_to.as_deref(), Some("10.0.0.2:9000"));

        // the claimed slice now completes normally
        let cascade = complete_action(&ctx, ids[1], done("SUCCESS")).await.unwrap();
        assert_eq!(cascade.workflow, None);
        let next = store.find_action(ids[2]).await.unwrap().unwrap();
        assert_eq!(next.status_id, READY);
    }

    #[tokio::test]
    async fn test_fail_dispatch_records_reason() {
        let (ctx, store) = context(vec![two_stage()], HandlerRegistry::new()).await;
        launch(&ctx).await;
        let request = store.ready_work().await.unwrap().remove(0);

        let cascade = fail_dispatch(&ctx, &request, "image not found").await.unwrap();
        assert_eq!(cascade.pipeline, Some(FAILED));

        let failed = store.find_action(request.action_instance_id).await.unwrap().unwrap();
        assert_eq!(failed.status_id, FAILED);
        assert!(failed.start_date.is_some());
        assert_eq!(failed.start_date, failed.end_date);
        assert_eq!(failed.output.unwrap()["results"]["error"], "image not found");
    }
}
