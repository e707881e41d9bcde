use keel_core::domain::instance::PipelineInstance;
use keel_core::domain::status::{
    CANCELED, FAILED, INPROGRESS, StatusId, StatusType, is_pending, is_resolved,
};
use keel_core::domain::template::StageTemplate;
use serde::Serialize;

use super::{EngineError, WorkflowEngine, activate_next, restart_stage};

/// What one completion changed, reported for logging and to callers
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Cascade {
    /// Action-instances promoted to READY
    pub activated: usize,
    /// Action-instances canceled because their workflow was blocked
    pub canceled: Vec<i64>,
    /// Terminal status given to the workflow-instance, if it resolved
    pub workflow: Option<StatusId>,
    /// `(stage_id, status)` of stages that resolved
    pub stages_completed: Vec<(i64, StatusId)>,
    /// Template stage ids that were materialized or re-opened
    pub stages_opened: Vec<i64>,
    /// Terminal status given to the pipeline-instance, if it resolved
    pub pipeline: Option<StatusId>,
}

impl Cascade {
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("activated={}", self.activated)];
        if !self.canceled.is_empty() {
            parts.push(format!("canceled={:?}", self.canceled));
        }
        if let Some(status) = self.workflow {
            parts.push(format!("workflow={}", status));
        }
        if !self.stages_completed.is_empty() {
            parts.push(format!("stages_completed={:?}", self.stages_completed));
        }
        if !self.stages_opened.is_empty() {
            parts.push(format!("stages_opened={:?}", self.stages_opened));
        }
        if let Some(status) = self.pipeline {
            parts.push(format!("pipeline={}", status));
        }
        parts.join(" ")
    }
}

enum Continuation {
    Continue,
    Blocked,
}

impl WorkflowEngine<'_> {
    /// Marks an action-instance terminal and cascades the consequences up the
    /// tree: next action-order group, workflow, stage, next stage, pipeline.
    pub fn complete_action(
        &self,
        tree: &mut PipelineInstance,
        action_instance_id: i64,
        status_id: StatusId,
    ) -> Result<Cascade, EngineError> {
        let status_type = self.catalog.type_of(status_id);
        if !status_type.is_terminal() {
            return Err(EngineError::NotTerminal(status_id));
        }

        let path = tree
            .find_action(action_instance_id)
            .ok_or(EngineError::ActionNotFound(action_instance_id, tree.id))?;

        let action = tree.action_mut(path);
        if is_resolved(action.status_id) {
            return Err(EngineError::AlreadyResolved {
                id: action_instance_id,
                status_id: action.status_id,
            });
        }

        action.status_id = status_id;
        if status_type == StatusType::Canceled {
            // cancellation records no progress time
            action.end_date = action.start_date;
        } else {
            action.start_date.get_or_insert(self.now);
            action.end_date = Some(self.now);
        }
        let action_id = action.action_id;

        let mut cascade = Cascade::default();
        self.settle_workflow(
            tree,
            path.stage,
            path.workflow,
            action_id,
            status_type,
            &mut cascade,
        );
        Ok(cascade)
    }

    fn continuation(
        &self,
        tree: &PipelineInstance,
        stage: usize,
        workflow: usize,
        action_id: i64,
    ) -> Continuation {
        let actions = &tree.stage_instances[stage].workflow_instances[workflow].action_instances;

        let group_pending = actions
            .iter()
            .any(|a| a.action_id == action_id && is_pending(a.status_id));
        if group_pending {
            return Continuation::Continue;
        }

        let blocked = actions
            .iter()
            .filter(|a| is_resolved(a.status_id))
            .any(|a| self.catalog.type_of(a.status_id).blocks_continuation());

        if blocked {
            Continuation::Blocked
        } else {
            Continuation::Continue
        }
    }

    fn settle_workflow(
        &self,
        tree: &mut PipelineInstance,
        stage: usize,
        workflow: usize,
        action_id: i64,
        trigger: StatusType,
        cascade: &mut Cascade,
    ) {
        if is_resolved(tree.stage_instances[stage].workflow_instances[workflow].status_id) {
            return;
        }

        match self.continuation(tree, stage, workflow, action_id) {
            Continuation::Continue => {
                let instance = &mut tree.stage_instances[stage].workflow_instances[workflow];
                cascade.activated += activate_next(instance);

                let aggregate =
                    self.aggregate_id(instance.action_instances.iter().map(|a| a.status_id));
                if let Some(status_id) = aggregate {
                    self.finish_workflow(tree, stage, workflow, status_id, cascade);
                }
            }
            Continuation::Blocked => {
                let instance = &mut tree.stage_instances[stage].workflow_instances[workflow];
                for action in &mut instance.action_instances {
                    if is_pending(action.status_id) && action.status_id != INPROGRESS {
                        action.status_id = CANCELED;
                        action.end_date = action.start_date;
                        cascade.canceled.push(action.id);
                    }
                }

                let status_id = if trigger == StatusType::Canceled {
                    CANCELED
                } else {
                    FAILED
                };
                self.finish_workflow(tree, stage, workflow, status_id, cascade);
            }
        }
    }

    fn finish_workflow(
        &self,
        tree: &mut PipelineInstance,
        stage: usize,
        workflow: usize,
        status_id: StatusId,
        cascade: &mut Cascade,
    ) {
        let instance = &mut tree.stage_instances[stage].workflow_instances[workflow];
        instance.status_id = status_id;
        instance.start_date.get_or_insert(self.now);
        instance.end_date = Some(self.now);
        cascade.workflow = Some(status_id);

        self.settle_stage(tree, stage, cascade);
    }

    /// Completes a stage once every workflow-instance under it is resolved
    pub(super) fn settle_stage(
        &self,
        tree: &mut PipelineInstance,
        stage: usize,
        cascade: &mut Cascade,
    ) {
        let instance = &tree.stage_instances[stage];
        if is_resolved(instance.status_id) {
            return;
        }

        let aggregate = self
            .catalog
            .aggregate(instance.workflow_instances.iter().map(|w| w.status_id));
        if let Some(status_type) = aggregate {
            self.complete_stage(tree, stage, status_type, cascade);
        }
    }

    fn complete_stage(
        &self,
        tree: &mut PipelineInstance,
        stage: usize,
        status_type: StatusType,
        cascade: &mut Cascade,
    ) {
        let status_id = status_type.canonical_id();
        let instance = &mut tree.stage_instances[stage];
        instance.status_id = status_id;
        instance.start_date.get_or_insert(self.now);
        instance.end_date = Some(self.now);
        let stage_id = instance.stage_id;
        cascade.stages_completed.push((stage_id, status_id));

        if status_type.blocks_continuation() {
            self.abort_later_stages(tree, stage_id, cascade);
            return;
        }

        if let Some(next) = self.next_stage(stage_id) {
            self.open_stage(tree, next, cascade);
            return;
        }

        let aggregate = self
            .catalog
            .aggregate(tree.stage_instances.iter().map(|s| s.status_id));
        if let Some(pipeline_status) = aggregate {
            self.complete_pipeline(tree, pipeline_status.canonical_id(), cascade);
        }
    }

    /// A failed stage ends the pipeline: stages after it never run
    fn abort_later_stages(&self, tree: &mut PipelineInstance, stage_id: i64, cascade: &mut Cascade) {
        let failed_at = self.position_of(stage_id);

        for stage in &mut tree.stage_instances {
            if self.position_of(stage.stage_id) <= failed_at || is_resolved(stage.status_id) {
                continue;
            }

            for workflow in &mut stage.workflow_instances {
                for action in &mut workflow.action_instances {
                    if is_pending(action.status_id) {
                        action.status_id = CANCELED;
                        action.end_date = action.start_date;
                        cascade.canceled.push(action.id);
                    }
                }
                if !is_resolved(workflow.status_id) {
                    workflow.status_id = CANCELED;
                    workflow.end_date = Some(self.now);
                }
            }

            stage.status_id = CANCELED;
            stage.end_date = Some(self.now);
        }

        let aggregate = self.catalog.aggregate(
            tree.stage_instances
                .iter()
                .filter(|s| self.position_of(s.stage_id) <= failed_at)
                .map(|s| s.status_id),
        );
        let pipeline_status = aggregate.unwrap_or(StatusType::Failed).canonical_id();
        self.complete_pipeline(tree, pipeline_status, cascade);
    }

    pub(super) fn position_of(&self, stage_id: i64) -> usize {
        self.stage_position
            .get(&stage_id)
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Materializes the stage if it has never run, otherwise re-opens the
    /// existing instance, and activates its first action-order groups.
    pub(super) fn open_stage(
        &self,
        tree: &mut PipelineInstance,
        template: &StageTemplate,
        cascade: &mut Cascade,
    ) {
        let stage = match tree
            .stage_instances
            .iter()
            .position(|s| s.stage_id == template.id)
        {
            Some(existing) => existing,
            None => {
                tree.stage_instances
                    .push(template.convert_to_instance(tree.id));
                tree.stage_instances.len() - 1
            }
        };

        cascade.activated += restart_stage(&mut tree.stage_instances[stage], self.now);
        cascade.stages_opened.push(template.id);

        // stages without actions resolve on the spot
        self.settle_stage(tree, stage, cascade);
    }

    pub(super) fn complete_pipeline(
        &self,
        tree: &mut PipelineInstance,
        status_id: StatusId,
        cascade: &mut Cascade,
    ) {
        if is_resolved(tree.status_id) {
            return;
        }

        tree.status_id = status_id;
        tree.start_date.get_or_insert(self.now);
        tree.end_date = Some(self.now);
        cascade.pipeline = Some(status_id);
    }
}
