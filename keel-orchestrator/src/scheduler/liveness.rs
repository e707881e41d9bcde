//! Liveness reconciliation of in-progress work
//!
//! Instances that have been INPROGRESS for longer than `stale_after` are
//! checked with the backend that owns them. Lost ones go back to READY
//! through a regular (non-forced) reset so the next cycle dispatches them again.

use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use keel_core::domain::instance::ActionInstance;
use keel_core::domain::worker::Worker;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::SchedulerContext;
use crate::engine::EngineError;
use crate::handler::QueueHandler;
use crate::service::{ServiceError, action_service};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub checked: usize,
    pub lost: usize,
    pub reclaimed: usize,
    /// Assigned to a backend no registered handler recognizes
    pub unowned: usize,
}

pub async fn reconcile(ctx: &SchedulerContext, workers: &[Worker]) -> Result<LivenessReport> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(ctx.config.stale_after).context("stale_after out of range")?;
    let stale = ctx.store.stale_in_progress(cutoff).await?;

    let mut report = LivenessReport {
        checked: stale.len(),
        ..Default::default()
    };
    if stale.is_empty() {
        return Ok(report);
    }

    let mut lost: Vec<ActionInstance> = Vec::new();
    let mut groups: Vec<(Arc<dyn QueueHandler>, Vec<ActionInstance>)> = Vec::new();

    for instance in stale {
        if instance.assigned_to.is_none() {
            lost.push(instance);
            continue;
        }

        match ctx.handlers.owner_of(&instance) {
            Some(handler) => match groups.iter_mut().find(|(h, _)| h.name() == handler.name()) {
                Some((_, instances)) => instances.push(instance),
                None => groups.push((handler.clone(), vec![instance])),
            },
            None => {
                warn!(
                    "Action-instance {} is assigned to unknown backend {:?}",
                    instance.id, instance.assigned_to
                );
                report.unowned += 1;
            }
        }
    }

    for (handler, instances) in &groups {
        let gone = handler.verify_still_working(instances, workers).await;
        if !gone.is_empty() {
            info!(
                "{} backend lost {} of {} stale action-instance(s)",
                handler.name(),
                gone.len(),
                instances.len()
            );
        }
        lost.extend(gone);
    }

    report.lost = lost.len();
    for instance in &lost {
        if reclaim(ctx, instance).await? {
            report.reclaimed += 1;
        }
    }

    Ok(report)
}

/// Puts a lost instance back to READY. Returns false when it was left alone.
async fn reclaim(ctx: &SchedulerContext, instance: &ActionInstance) -> Result<bool> {
    if !ctx
        .guards
        .wait_for_calculation(instance.pipeline_instance_id)
        .await?
    {
        debug!(
            "Pipeline-instance {} still recalculating, reclaim of {} deferred",
            instance.pipeline_instance_id, instance.id
        );
        return Ok(false);
    }

    match action_service::reset_action_instance(ctx, instance.id, false).await {
        Ok(_) => {
            info!(
                "Reclaimed action-instance {} (was {:?})",
                instance.id, instance.assigned_to
            );
            Ok(true)
        }
        Err(ServiceError::Conflict(reason)) => {
            debug!("Not reclaiming {}: {}", instance.id, reason);
            Ok(false)
        }
        Err(ServiceError::Engine(EngineError::InvalidTransition(reason))) => {
            // resolved between the scan and the reset
            debug!("Not reclaiming {}: {}", instance.id, reason);
            Ok(false)
        }
        Err(e) => {
            warn!("Failed to reclaim action-instance {}: {}", instance.id, e);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context_over;
    use crate::engine::fixtures::{action, pipeline, stage, workflow};
    use crate::handler::HandlerRegistry;
    use crate::handler::testing::FakeHandler;
    use crate::repository::{MemoryStore, Store};
    use crate::service::pipeline::launch_pipeline;
    use keel_core::domain::status::{INPROGRESS, READY};
    use keel_core::dto::pipeline::LaunchPipeline;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn setup(fake: Arc<FakeHandler>) -> (Arc<SchedulerContext>, Arc<MemoryStore>, i64) {
        let mut build = action(100, 1, 2);
        build.grain = "fake://x".to_string();
        let template = pipeline(1, vec![stage(1, 1, vec![workflow(10, 1, vec![build])])]);

        let store = Arc::new(MemoryStore::with_templates(vec![template]));
        let mut ctx = context_over(store.clone(), HandlerRegistry::new().register(fake)).await;
        Arc::get_mut(&mut ctx).unwrap().config.stale_after = Duration::ZERO;

        let tree = launch_pipeline(
            &ctx,
            LaunchPipeline {
                pipeline_id: 1,
                priority: 0,
                parameters: BTreeMap::new(),
            },
        )
        .await
        .unwrap();
        (ctx, store, tree.id)
    }

    #[tokio::test]
    async fn test_lost_instance_is_reclaimed() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, store, pid) = setup(fake.clone()).await;

        let ids: Vec<i64> = store
            .load_tree(pid)
            .await
            .unwrap()
            .unwrap()
            .actions()
            .map(|a| a.id)
            .collect();
        for id in &ids {
            assert!(store.claim_action(*id, &fake.marker()).await.unwrap());
        }
        fake.lost.lock().unwrap().push(ids[0]);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reconcile(&ctx, &[]).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.lost, 1);
        assert_eq!(report.reclaimed, 1);

        let lost = store.find_action(ids[0]).await.unwrap().unwrap();
        assert_eq!(lost.status_id, READY);
        assert!(lost.assigned_to.is_none());
        let alive = store.find_action(ids[1]).await.unwrap().unwrap();
        assert_eq!(alive.status_id, INPROGRESS);
    }

    #[tokio::test]
    async fn test_unassigned_in_progress_is_reclaimed() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, store, pid) = setup(fake).await;

        let mut tree = store.load_tree(pid).await.unwrap().unwrap();
        let path = tree.find_action(tree.actions().next().unwrap().id).unwrap();
        let orphan = tree.action_mut(path);
        orphan.status_id = INPROGRESS;
        orphan.assigned_to = None;
        orphan.start_date = Some(Utc::now() - chrono::Duration::minutes(10));
        let orphan_id = orphan.id;
        store.save_tree(&mut tree).await.unwrap();

        let report = reconcile(&ctx, &[]).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(
            store.find_action(orphan_id).await.unwrap().unwrap().status_id,
            READY
        );
    }

    #[tokio::test]
    async fn test_unknown_backend_is_left_alone() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, store, pid) = setup(fake).await;

        let id = store
            .load_tree(pid)
            .await
            .unwrap()
            .unwrap()
            .actions()
            .next()
            .unwrap()
            .id;
        store.claim_action(id, "--elsewhere--x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reconcile(&ctx, &[]).await.unwrap();
        assert_eq!(report.unowned, 1);
        assert_eq!(report.reclaimed, 0);
        assert_eq!(
            store.find_action(id).await.unwrap().unwrap().status_id,
            INPROGRESS
        );
    }

    #[tokio::test]
    async fn test_reclaim_waits_out_recalculation() {
        let fake = Arc::new(FakeHandler::new("fake"));
        let (ctx, store, pid) = setup(fake.clone()).await;

        let id = store
            .load_tree(pid)
            .await
            .unwrap()
            .unwrap()
            .actions()
            .next()
            .unwrap()
            .id;
        store.claim_action(id, &fake.marker()).await.unwrap();
        fake.lost.lock().unwrap().push(id);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lease = ctx.guards.begin_calculation(pid).await.unwrap();
        let report = reconcile(&ctx, &[]).await.unwrap();
        assert_eq!(report.lost, 1);
        assert_eq!(report.reclaimed, 0);
        ctx.guards.release(lease).await.unwrap();

        let report = reconcile(&ctx, &[]).await.unwrap();
        assert_eq!(report.reclaimed, 1);
    }
}
