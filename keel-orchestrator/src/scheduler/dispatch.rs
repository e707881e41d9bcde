//! Dispatch of the work queue to the queue handlers

use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::Worker;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::context::SchedulerContext;
use crate::handler::{Dispatch, HandlerError};
use crate::service::action_service;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub deferred: usize,
    pub already_claimed: usize,
    /// Rejected by their backend and failed
    pub failed: usize,
    /// Left for a later cycle: pipeline busy, backend asleep or unrouted
    pub skipped: usize,
}

/// Offers each request, in queue order, to the first handler that accepts it
pub async fn dispatch_work(
    ctx: &SchedulerContext,
    work: &[WorkRequest],
    workers: &[Worker],
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let mut sleeping: HashSet<&'static str> = HashSet::new();

    for request in work {
        match ctx.guards.is_calculating(request.pipeline_instance_id).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(
                    "Pipeline-instance {} is recalculating, skipping action-instance {}",
                    request.pipeline_instance_id, request.action_instance_id
                );
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(
                    "Could not check calculating marker of pipeline-instance {}: {}",
                    request.pipeline_instance_id, e
                );
                report.skipped += 1;
                continue;
            }
        }

        let Some(handler) = ctx.handlers.for_request(request) else {
            debug!(
                "No queue handler for grain '{}' (action-instance {})",
                request.grain, request.action_instance_id
            );
            report.skipped += 1;
            continue;
        };

        if sleeping.contains(handler.name()) {
            report.skipped += 1;
            continue;
        }

        match handler.process_work_request(request, workers).await {
            Ok(Dispatch::Sent(assigned_to)) => {
                info!(
                    "Dispatched action-instance {} ({}) to {}",
                    request.action_instance_id, request.slice, assigned_to
                );
                report.sent += 1;
            }
            Ok(Dispatch::Deferred) => {
                debug!(
                    "No {} executor for action-instance {} this cycle",
                    handler.name(),
                    request.action_instance_id
                );
                report.deferred += 1;
            }
            Ok(Dispatch::AlreadyClaimed) => {
                debug!(
                    "Action-instance {} was claimed elsewhere",
                    request.action_instance_id
                );
                report.already_claimed += 1;
            }
            Err(e) if e.should_sleep() => {
                warn!("{}; skipping it for the rest of the cycle", e);
                sleeping.insert(handler.name());
                report.skipped += 1;
            }
            Err(e) if e.is_hard_failure() => {
                reject(ctx, request, &e).await;
                report.failed += 1;
            }
            Err(e) => {
                error!(
                    "Dispatch of action-instance {} failed: {}",
                    request.action_instance_id, e
                );
                report.skipped += 1;
            }
        }
    }

    report
}

async fn reject(ctx: &SchedulerContext, request: &WorkRequest, e: &HandlerError) {
    warn!(
        "Action-instance {} rejected by its backend: {}",
        request.action_instance_id, e
    );

    if let Err(fail_err) = action_service::fail_dispatch(ctx, request, &e.to_string()).await {
        error!(
            "Could not fail action-instance {}: {}",
            request.action_instance_id, fail_err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::engine::fixtures::{action, pipeline, stage, workflow};
    use crate::handler::HandlerRegistry;
    use crate::handler::testing::FakeHandler;
    use crate::repository::Store;
    use crate::selector;
    use crate::service::pipeline::launch_pipeline;
    use keel_core::domain::status::{FAILED, READY};
    use keel_core::domain::template::PipelineTemplate;
    use keel_core::dto::pipeline::LaunchPipeline;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn template(grain: &str, slices: u32) -> PipelineTemplate {
        let mut build = action(100, 1, slices);
        build.grain = grain.to_string();
        pipeline(1, vec![stage(1, 1, vec![workflow(10, 1, vec![build])])])
    }

    async fn launch(ctx: &SchedulerContext) -> i64 {
        launch_pipeline(
            ctx,
            LaunchPipeline {
                pipeline_id: 1,
                priority: 0,
                parameters: BTreeMap::new(),
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_sleeping_handler_is_skipped_for_the_cycle() {
        let fake = Arc::new(
            FakeHandler::new("fake")
                .will(Err(HandlerError::ShouldSleep("fake", "throttled".to_string()))),
        );
        let (ctx, _) = context(
            vec![template("fake://x", 3)],
            HandlerRegistry::new().register(fake.clone()),
        )
        .await;
        launch(&ctx).await;

        let work = selector::fetch_work(ctx.store.as_ref()).await.unwrap();
        let report = dispatch_work(&ctx, &work, &[]).await;

        assert_eq!(fake.processed.lock().unwrap().len(), 1);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.sent, 0);
    }

    #[tokio::test]
    async fn test_rejection_fails_the_action_instance() {
        let fake = Arc::new(
            FakeHandler::new("fake").will(Err(HandlerError::Rejected("bad image".to_string()))),
        );
        let (ctx, store) = context(
            vec![template("fake://x", 1)],
            HandlerRegistry::new().register(fake.clone()),
        )
        .await;
        let pid = launch(&ctx).await;

        let work = selector::fetch_work(ctx.store.as_ref()).await.unwrap();
        let report = dispatch_work(&ctx, &work, &[]).await;
        assert_eq!(report.failed, 1);

        let tree = store.load_tree(pid).await.unwrap().unwrap();
        let failed = tree.actions().next().unwrap();
        assert_eq!(failed.status_id, FAILED);
        assert_eq!(tree.status_id, FAILED);
        let output = failed.output.as_ref().unwrap();
        assert!(output["results"]["error"].as_str().unwrap().contains("bad image"));
    }

    #[tokio::test]
    async fn test_recalculating_pipeline_is_skipped() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, store) = context(
            vec![template("fake://x", 1)],
            HandlerRegistry::new().register(fake.clone()),
        )
        .await;
        let pid = launch(&ctx).await;
        let work = selector::fetch_work(ctx.store.as_ref()).await.unwrap();

        let lease = ctx.guards.begin_calculation(pid).await.unwrap();
        let report = dispatch_work(&ctx, &work, &[]).await;
        assert_eq!(report.skipped, 1);
        assert!(fake.processed.lock().unwrap().is_empty());
        ctx.guards.release(lease).await.unwrap();

        let report = dispatch_work(&ctx, &work, &[]).await;
        assert_eq!(report.sent, 1);
        let tree = store.load_tree(pid).await.unwrap().unwrap();
        // the fake handler has no store, so nothing was claimed
        assert_eq!(tree.actions().next().unwrap().status_id, READY);
    }

    #[tokio::test]
    async fn test_unrouted_grain_is_left_alone() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, _) = context(
            vec![template("other://x", 1)],
            HandlerRegistry::new().register(fake.clone()),
        )
        .await;
        launch(&ctx).await;

        let work = selector::fetch_work(ctx.store.as_ref()).await.unwrap();
        let report = dispatch_work(&ctx, &work, &[]).await;
        assert_eq!(report.skipped, 1);
        assert!(fake.processed.lock().unwrap().is_empty());
    }
}
