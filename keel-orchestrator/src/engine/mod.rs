//! Workflow Engine
//!
//! Pure, transaction-scoped logic over one pipeline-instance tree. The engine
//! never touches storage: callers load the tree, let the engine mutate it, and
//! persist the result in one transaction.
//!
//! - `complete`: cascades one action completion up through workflow, stage
//!   and pipeline, activating the next action-order group or the next stage
//! - `reset`: the inverse, rolling part of the tree back to a runnable state

mod complete;
mod reset;

pub use complete::Cascade;
pub use reset::{CancelOutcome, ResetOutcome};

use chrono::{DateTime, Utc};
use keel_core::domain::instance::{ActionInstance, PipelineInstance, StageInstance, WorkflowInstance};
use keel_core::domain::status::{
    INPROGRESS, NEW, READY, StatusCatalog, StatusId, StatusType, is_resolved,
};
use keel_core::domain::template::{PipelineTemplate, StageTemplate};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors raised by the engine. None of them leave the tree half-mutated.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Action instance {0} is not part of pipeline instance {1}")]
    ActionNotFound(i64, i64),

    #[error("Action instance {id} is already resolved (status {status_id})")]
    AlreadyResolved { id: i64, status_id: StatusId },

    #[error("Status {0} is not a terminal status")]
    NotTerminal(StatusId),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Engine bound to one pipeline template and one point in time
pub struct WorkflowEngine<'a> {
    catalog: &'a StatusCatalog,
    template: &'a PipelineTemplate,
    /// Indices into `template.stages`, in execution order
    stage_order: Vec<usize>,
    /// Template stage id -> position in `stage_order`
    stage_position: HashMap<i64, usize>,
    now: DateTime<Utc>,
}

impl<'a> WorkflowEngine<'a> {
    /// Builds the engine and its stage index in one pass
    pub fn new(catalog: &'a StatusCatalog, template: &'a PipelineTemplate) -> Self {
        Self::at(catalog, template, Utc::now())
    }

    pub fn at(
        catalog: &'a StatusCatalog,
        template: &'a PipelineTemplate,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stage_order: Vec<usize> = (0..template.stages.len()).collect();
        stage_order.sort_by_key(|&i| (template.stages[i].order, template.stages[i].id));

        let stage_position = stage_order
            .iter()
            .enumerate()
            .map(|(position, &i)| (template.stages[i].id, position))
            .collect();

        Self {
            catalog,
            template,
            stage_order,
            stage_position,
            now,
        }
    }

    fn first_stage(&self) -> Option<&'a StageTemplate> {
        self.stage_order.first().map(|&i| &self.template.stages[i])
    }

    fn next_stage(&self, stage_id: i64) -> Option<&'a StageTemplate> {
        let position = *self.stage_position.get(&stage_id)?;
        self.stage_order
            .get(position + 1)
            .map(|&i| &self.template.stages[i])
    }

    /// Starts a freshly created pipeline-instance: only its first stage is
    /// materialized, later stages follow lazily as earlier ones succeed.
    pub fn start_pipeline(&self, tree: &mut PipelineInstance) -> Result<Cascade, EngineError> {
        if tree.status_id != NEW {
            return Err(EngineError::InvalidTransition(format!(
                "pipeline instance {} has already been started",
                tree.id
            )));
        }

        tree.status_id = INPROGRESS;
        tree.start_date = Some(self.now);
        tree.end_date = None;

        let mut cascade = Cascade::default();
        match self.first_stage() {
            Some(stage) => self.open_stage(tree, stage, &mut cascade),
            None => self.complete_pipeline(tree, StatusType::Success.canonical_id(), &mut cascade),
        }

        Ok(cascade)
    }

    fn aggregate_id(&self, ids: impl IntoIterator<Item = StatusId>) -> Option<StatusId> {
        self.catalog.aggregate(ids).map(StatusType::canonical_id)
    }
}

// =============================================================================
// Shared tree helpers
// =============================================================================

/// Action-instances of a workflow grouped by `order`, ascending
fn order_groups(workflow: &WorkflowInstance) -> BTreeMap<i32, Vec<usize>> {
    let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (idx, action) in workflow.action_instances.iter().enumerate() {
        groups.entry(action.order).or_default().push(idx);
    }
    groups
}

/// Promotes the first activatable order group to READY.
///
/// Scans groups in ascending order: fully resolved groups are skipped, a group
/// with anything READY or INPROGRESS stops the scan, and a group whose slices
/// are all NEW is promoted as a whole. A group mixing NEW and resolved slices
/// is never partially activated. Returns the number of promoted instances.
fn activate_next(workflow: &mut WorkflowInstance) -> usize {
    if workflow
        .action_instances
        .iter()
        .any(|a| a.status_id == INPROGRESS)
    {
        return 0;
    }

    for (_, members) in order_groups(workflow) {
        let actions = &workflow.action_instances;
        if members.iter().all(|&i| is_resolved(actions[i].status_id)) {
            continue;
        }

        if members.iter().all(|&i| actions[i].status_id == NEW) {
            for &i in &members {
                workflow.action_instances[i].status_id = READY;
            }
            return members.len();
        }

        return 0;
    }

    0
}

fn clear_action(action: &mut ActionInstance, status_id: StatusId) {
    action.status_id = status_id;
    action.assigned_to = None;
    action.start_date = None;
    action.end_date = None;
    action.output = None;
}

/// Puts a stage and everything below it back to its starting state.
/// Returns the number of action-instances promoted to READY.
fn restart_stage(stage: &mut StageInstance, now: DateTime<Utc>) -> usize {
    let mut activated = 0;
    stage.status_id = INPROGRESS;
    stage.start_date = Some(now);
    stage.end_date = None;

    for workflow in &mut stage.workflow_instances {
        workflow.status_id = INPROGRESS;
        workflow.start_date = Some(now);
        workflow.end_date = None;

        for action in &mut workflow.action_instances {
            clear_action(action, NEW);
        }

        if workflow.action_instances.is_empty() {
            workflow.status_id = StatusType::Success.canonical_id();
            workflow.end_date = Some(now);
        } else {
            activated += activate_next(workflow);
        }
    }

    activated
}

/// Puts a stage and everything below it back to NEW
fn dormant_stage(stage: &mut StageInstance) {
    stage.status_id = NEW;
    stage.start_date = None;
    stage.end_date = None;

    for workflow in &mut stage.workflow_instances {
        workflow.status_id = NEW;
        workflow.start_date = None;
        workflow.end_date = None;

        for action in &mut workflow.action_instances {
            clear_action(action, NEW);
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Template and tree builders shared by engine, selector and service tests

    use super::*;
    use keel_core::domain::instance::UNSAVED_ID;
    use keel_core::domain::template::{ActionTemplate, WorkflowTemplate};

    pub fn action(id: i64, order: i32, slices: u32) -> ActionTemplate {
        ActionTemplate {
            id,
            name: format!("action-{}", id),
            order,
            cmd: format!("run-{}", id),
            executable: "sh".to_string(),
            args: vec![],
            manual: false,
            callback_required: true,
            grain: "linux".to_string(),
            slices,
            environment: BTreeMap::new(),
        }
    }

    pub fn workflow(id: i64, order: i32, actions: Vec<ActionTemplate>) -> WorkflowTemplate {
        WorkflowTemplate {
            id,
            name: format!("workflow-{}", id),
            order,
            actions,
        }
    }

    pub fn stage(id: i64, order: i32, workflows: Vec<WorkflowTemplate>) -> StageTemplate {
        StageTemplate {
            id,
            name: format!("stage-{}", id),
            order,
            workflows,
        }
    }

    pub fn pipeline(id: i64, stages: Vec<StageTemplate>) -> PipelineTemplate {
        PipelineTemplate {
            id,
            name: format!("pipeline-{}", id),
            stages,
        }
    }

    /// A fresh, unsaved pipeline-instance for `template`
    pub fn new_instance(template: &PipelineTemplate, priority: i32) -> PipelineInstance {
        PipelineInstance {
            id: UNSAVED_ID,
            pipeline_id: template.id,
            status_id: NEW,
            priority,
            created_date: Utc::now(),
            start_date: None,
            end_date: None,
            parameters: BTreeMap::new(),
            stage_instances: vec![],
        }
    }

    /// Gives every node a distinct id so tests can address action-instances.
    ///
    /// Action-instance ids are `1000 * workflow_position + index + 1`.
    pub fn number(tree: &mut PipelineInstance) {
        if tree.id == UNSAVED_ID {
            tree.id = 1;
        }
        let mut next_wf = 1;
        for (si, stage) in tree.stage_instances.iter_mut().enumerate() {
            if stage.id == UNSAVED_ID {
                stage.id = 100 + si as i64;
            }
            stage.pipeline_instance_id = tree.id;
            for workflow in &mut stage.workflow_instances {
                if workflow.id == UNSAVED_ID {
                    workflow.id = 500 + next_wf;
                }
                next_wf += 1;
                workflow.stage_instance_id = stage.id;
                workflow.pipeline_instance_id = tree.id;
                let base = 1000 * (workflow.id - 500);
                for (ai, action) in workflow.action_instances.iter_mut().enumerate() {
                    if action.id == UNSAVED_ID {
                        action.id = base + ai as i64 + 1;
                    }
                    action.workflow_instance_id = workflow.id;
                    action.pipeline_instance_id = tree.id;
                }
            }
        }
    }

    pub fn started(template: &PipelineTemplate, catalog: &StatusCatalog) -> PipelineInstance {
        let mut tree = new_instance(template, 0);
        WorkflowEngine::new(catalog, template)
            .start_pipeline(&mut tree)
            .unwrap();
        number(&mut tree);
        tree
    }

    pub fn status_of(tree: &PipelineInstance, action_instance_id: i64) -> StatusId {
        let path = tree.find_action(action_instance_id).unwrap();
        tree.action(path).status_id
    }

    pub fn statuses(tree: &PipelineInstance) -> Vec<(i64, StatusId)> {
        tree.actions().map(|a| (a.id, a.status_id)).collect()
    }

    /// Moves an action to INPROGRESS as a handler claim would
    pub fn run(tree: &mut PipelineInstance, action_instance_id: i64) {
        let path = tree.find_action(action_instance_id).unwrap();
        let action = tree.action_mut(path);
        action.status_id = INPROGRESS;
        action.start_date = Some(Utc::now());
        action.assigned_to = Some("10.0.0.1:9000".to_string());
    }
}
