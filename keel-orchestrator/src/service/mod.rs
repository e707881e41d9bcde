//! Service Module
//!
//! The callback surface of the master. Services load a pipeline-instance
//! tree, let the workflow engine mutate it under the concurrency guards, and
//! persist the result. Executors are told to stop only after the tree is saved.

pub mod action;
pub mod pipeline;
pub mod worker;

// Re-export for convenience
pub use action as action_service;
pub use pipeline as pipeline_service;
pub use worker as worker_service;

use keel_core::domain::instance::{ActionInstance, PipelineInstance};
use keel_core::domain::template::PipelineTemplate;
use thiserror::Error;

use crate::context::SchedulerContext;
use crate::engine::EngineError;
use crate::repository::StoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Loads a pipeline-instance tree together with its template
pub(crate) async fn load_tree(
    ctx: &SchedulerContext,
    pipeline_instance_id: i64,
) -> Result<(PipelineInstance, PipelineTemplate)> {
    let tree = ctx
        .store
        .load_tree(pipeline_instance_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Pipeline instance {}", pipeline_instance_id)))?;

    let template = ctx
        .store
        .find_template(tree.pipeline_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Pipeline {}", tree.pipeline_id)))?;

    Ok((tree, template))
}

/// Writes back a tree loaded as `before`. Claims made by the dispatcher since
/// the load are kept over the recalculated value.
pub(crate) async fn save_recalculated(
    ctx: &SchedulerContext,
    before: &PipelineInstance,
    tree: &mut PipelineInstance,
) -> Result<()> {
    let skipped = ctx.store.update_tree(before, tree).await?;
    if !skipped.is_empty() {
        tracing::warn!(
            "Pipeline-instance {}: kept concurrent changes to action-instance(s) {:?}",
            tree.id,
            skipped
        );
    }
    Ok(())
}

/// Asks the owning backends to stop the given instances. Best-effort.
pub(crate) async fn cancel_workers(ctx: &SchedulerContext, instances: &[ActionInstance]) {
    for instance in instances {
        match ctx.handlers.owner_of(instance) {
            Some(handler) => {
                if handler.cancel_worker(instance).await {
                    tracing::info!(
                        "Asked {} backend to stop action-instance {}",
                        handler.name(),
                        instance.id
                    );
                } else {
                    tracing::warn!(
                        "{} backend could not stop action-instance {}",
                        handler.name(),
                        instance.id
                    );
                }
            }
            None => tracing::debug!(
                "No backend owns action-instance {} ({:?})",
                instance.id,
                instance.assigned_to
            ),
        }
    }
}
