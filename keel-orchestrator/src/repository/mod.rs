//! Repository Module
//!
//! Data access layer for the orchestrator. Everything the scheduler reads or
//! writes goes through the [`Store`] trait so that the engine, the dispatch
//! loop and the services run unchanged against PostgreSQL or memory.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::instance::{ActionInstance, PipelineInstance};
use keel_core::domain::status::Status;
use keel_core::domain::template::PipelineTemplate;
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::{Worker, WorkerStatus};
use keel_core::dto::worker::RegisterWorker;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- catalog and templates ------------------------------------------------

    /// Operator-defined statuses; built-in ones are implied
    async fn list_statuses(&self) -> Result<Vec<Status>, StoreError>;

    async fn find_template(&self, pipeline_id: i64)
    -> Result<Option<PipelineTemplate>, StoreError>;

    // -- instance trees -------------------------------------------------------

    async fn load_tree(
        &self,
        pipeline_instance_id: i64,
    ) -> Result<Option<PipelineInstance>, StoreError>;

    /// Persists the whole tree in one transaction. Nodes still carrying
    /// `UNSAVED_ID` are inserted and receive their ids in place.
    async fn save_tree(&self, tree: &mut PipelineInstance) -> Result<(), StoreError>;

    /// Persists a recalculated tree that was loaded as `before`.
    ///
    /// Action rows the recalculation left as they were are not written. A
    /// changed row is written only if the stored row still has the status and
    /// assignment it had in `before`; otherwise the stored row wins and is
    /// copied into `tree`. Returns the ids of the action-instances whose
    /// change was dropped that way.
    async fn update_tree(
        &self,
        before: &PipelineInstance,
        tree: &mut PipelineInstance,
    ) -> Result<Vec<i64>, StoreError>;

    async fn find_action(
        &self,
        action_instance_id: i64,
    ) -> Result<Option<ActionInstance>, StoreError>;

    // -- work selector candidates -------------------------------------------

    /// READY, non-manual action-instances of INPROGRESS pipelines
    async fn ready_work(&self) -> Result<Vec<WorkRequest>, StoreError>;

    /// NEW, non-manual action-instances of INPROGRESS workflows with no
    /// unfinished lower-order sibling
    async fn stalled_work(&self) -> Result<Vec<WorkRequest>, StoreError>;

    // -- assignment -----------------------------------------------------------

    /// Compare-and-set: moves a NEW or READY instance to INPROGRESS bound to
    /// `assigned_to`. Returns false when someone else got there first.
    async fn claim_action(
        &self,
        action_instance_id: i64,
        assigned_to: &str,
    ) -> Result<bool, StoreError>;

    /// Rewrites the routing metadata of a claimed instance
    async fn update_assignment(
        &self,
        action_instance_id: i64,
        assigned_to: &str,
    ) -> Result<(), StoreError>;

    /// Undoes a claim whose dispatch failed: back to READY, unassigned
    async fn release_action(&self, action_instance_id: i64) -> Result<(), StoreError>;

    /// INPROGRESS, unfinished instances started before `cutoff`
    async fn stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ActionInstance>, StoreError>;

    // -- workers --------------------------------------------------------------

    async fn register_worker(&self, req: &RegisterWorker) -> Result<Worker, StoreError>;

    /// Returns false for unknown workers
    async fn heartbeat_worker(&self, address: &str) -> Result<bool, StoreError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    async fn set_worker_status(
        &self,
        address: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError>;

    /// Returns the number of workers marked offline
    async fn mark_stale_workers_offline(&self, cutoff: DateTime<Utc>)
    -> Result<u64, StoreError>;
}

/// Whether a recalculation touched the action-instance
pub(crate) fn action_changed(before: &ActionInstance, after: &ActionInstance) -> bool {
    before.status_id != after.status_id
        || before.assigned_to != after.assigned_to
        || before.start_date != after.start_date
        || before.end_date != after.end_date
        || before.output != after.output
}

/// Whether the stored row still carries the binding it was loaded with
pub(crate) fn same_binding(before: &ActionInstance, stored: &ActionInstance) -> bool {
    before.status_id == stored.status_id && before.assigned_to == stored.assigned_to
}
