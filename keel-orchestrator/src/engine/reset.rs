use keel_core::domain::instance::{ActionInstance, PipelineInstance};
use keel_core::domain::status::{
    CANCELED, INPROGRESS, NEW, READY, StatusType, is_pending, is_resolved,
};

use super::{Cascade, EngineError, WorkflowEngine, clear_action, dormant_stage};

/// Result of rolling part of a tree back
#[derive(Debug, Default)]
pub struct ResetOutcome {
    /// Instances that were running when reset; their executors should be told to stop
    pub displaced: Vec<ActionInstance>,
    pub cascade: Cascade,
}

/// Result of canceling a pipeline-instance
#[derive(Debug, Default)]
pub struct CancelOutcome {
    /// Instances that were running; their executors should be told to stop
    pub in_flight: Vec<ActionInstance>,
    pub canceled: usize,
}

impl WorkflowEngine<'_> {
    /// Rolls an action-instance back to READY.
    ///
    /// Without `force_full` only an INPROGRESS instance may be reset; this is
    /// the liveness reclaim path. With it, any instance is re-run: later
    /// action-order groups of its workflow revert to NEW, its ancestors are
    /// re-opened, and later stages go dormant until this one succeeds again.
    pub fn reset_action(
        &self,
        tree: &mut PipelineInstance,
        action_instance_id: i64,
        force_full: bool,
    ) -> Result<ResetOutcome, EngineError> {
        let path = tree
            .find_action(action_instance_id)
            .ok_or(EngineError::ActionNotFound(action_instance_id, tree.id))?;

        let current = tree.action(path).status_id;
        if !force_full && current != INPROGRESS {
            return Err(EngineError::InvalidTransition(format!(
                "action instance {} is not in progress",
                action_instance_id
            )));
        }

        let mut outcome = ResetOutcome::default();
        if force_full && current == INPROGRESS {
            outcome.displaced.push(tree.action(path).clone());
        }

        let target_order = tree.action(path).order;
        let stage_id = tree.stage_instances[path.stage].stage_id;
        let stage_position = self.position_of(stage_id);

        {
            let workflow = &mut tree.stage_instances[path.stage].workflow_instances[path.workflow];
            for (idx, action) in workflow.action_instances.iter_mut().enumerate() {
                if idx == path.action {
                    clear_action(action, READY);
                } else if action.order > target_order {
                    if action.status_id == INPROGRESS {
                        outcome.displaced.push(action.clone());
                    }
                    clear_action(action, NEW);
                }
            }

            workflow.status_id = INPROGRESS;
            workflow.start_date.get_or_insert(self.now);
            workflow.end_date = None;
        }

        {
            let stage = &mut tree.stage_instances[path.stage];
            stage.status_id = INPROGRESS;
            stage.start_date.get_or_insert(self.now);
            stage.end_date = None;
        }

        for stage in &mut tree.stage_instances {
            if self.position_of(stage.stage_id) <= stage_position {
                continue;
            }
            outcome.displaced.extend(
                stage
                    .workflow_instances
                    .iter()
                    .flat_map(|w| w.action_instances.iter())
                    .filter(|a| a.status_id == INPROGRESS)
                    .cloned(),
            );
            dormant_stage(stage);
        }

        tree.status_id = INPROGRESS;
        tree.start_date.get_or_insert(self.now);
        tree.end_date = None;

        Ok(outcome)
    }

    /// Restarts the whole pipeline-instance from its first stage
    pub fn reset_pipeline(&self, tree: &mut PipelineInstance) -> Result<ResetOutcome, EngineError> {
        let mut outcome = ResetOutcome {
            displaced: tree
                .actions()
                .filter(|a| a.status_id == INPROGRESS)
                .cloned()
                .collect(),
            cascade: Cascade::default(),
        };

        for stage in &mut tree.stage_instances {
            dormant_stage(stage);
        }

        tree.status_id = INPROGRESS;
        tree.start_date = Some(self.now);
        tree.end_date = None;

        match self.first_stage() {
            Some(first) => self.open_stage(tree, first, &mut outcome.cascade),
            None => self.complete_pipeline(
                tree,
                StatusType::Success.canonical_id(),
                &mut outcome.cascade,
            ),
        }

        Ok(outcome)
    }

    /// Cancels every unresolved node of the tree
    pub fn cancel_pipeline(&self, tree: &mut PipelineInstance) -> Result<CancelOutcome, EngineError> {
        if is_resolved(tree.status_id) {
            return Err(EngineError::InvalidTransition(format!(
                "pipeline instance {} is already resolved",
                tree.id
            )));
        }

        let mut outcome = CancelOutcome::default();

        for stage in &mut tree.stage_instances {
            for workflow in &mut stage.workflow_instances {
                for action in &mut workflow.action_instances {
                    if !is_pending(action.status_id) {
                        continue;
                    }
                    if action.status_id == INPROGRESS {
                        outcome.in_flight.push(action.clone());
                    }
                    action.status_id = CANCELED;
                    action.end_date = action.start_date;
                    outcome.canceled += 1;
                }

                if !is_resolved(workflow.status_id) {
                    workflow.status_id = CANCELED;
                    workflow.end_date = Some(self.now);
                }
            }

            if !is_resolved(stage.status_id) {
                stage.status_id = CANCELED;
                stage.end_date = Some(self.now);
            }
        }

        tree.status_id = CANCELED;
        tree.end_date = Some(self.now);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use keel_core::domain::status::{FAILED, SUCCESS, StatusCatalog};

    fn two_stage() -> keel_core::domain::template::PipelineTemplate {
        pipeline(
            1,
            vec![
                stage(1, 1, vec![workflow(10, 1, vec![action(100, 1, 1), action(101, 2, 1)])]),
                stage(2, 2, vec![workflow(20, 1, vec![action(200, 1, 1)])]),
            ],
        )
    }

    #[test]
    fn test_reset_in_progress_action_returns_to_ready() {
        let catalog = StatusCatalog::builtin();
        let template = two_stage();
        let mut tree = started(&template, &catalog);
        let engine = WorkflowEngine::new(&catalog, &template);

        run(&mut tree, 1001);
        let outcome = engine.reset_action(&mut tree, 1001, false).unwrap();

        assert!(outcome.displaced.is_empty());
        let action = tree.action(tree.find_action(1001).unwrap());
        assert_eq!(action.status_id, READY);
        assert!(action.assigned_to.is_none());
        assert!(action.start_date.is_none());
    }

    #[test]
    fn test_reset_without_force_requires_in_progress() {
        let catalog = StatusCatalog::builtin();
        let template = two_stage();
        let mut tree = started(&template, &catalog);
        let engine = WorkflowEngine::new(&catalog, &template);

        let result = engine.reset_action(&mut tree, 1001, false);
        assert!(matches!(result, Err(EngineError::InvalidTransition(_))));
        assert_eq!(status_of(&tree, 1001), READY);
    }

    #[test]
    fn test_reset_then_complete_is_idempotent() {
        let catalog = StatusCatalog::builtin();
        let template = two_stage();
        let engine = WorkflowEngine::new(&catalog, &template);

        let mut plain = started(&template, &catalog);
        run(&mut plain, 1001);
        engine.complete_action(&mut plain, 1001, SUCCESS).unwrap();

        let mut reset = started(&template, &catalog);
        run(&mut reset, 1001);
        engine.reset_action(&mut reset, 1001, false).unwrap();
        run(&mut reset, 1001);
        engine.complete_action(&mut reset, 1001, SUCCESS).unwrap();

        assert_eq!(statuses(&plain), statuses(&reset));
        assert_eq!(plain.status_id, reset.status_id);
    }

    #[test]
    fn test_force_reset_reopens_finished_work() {
        let catalog = StatusCatalog::builtin();
        let template = two_stage();
        let engine = WorkflowEngine::new(&catalog, &template);
        let mut tree = started(&template, &catalog);

        run(&mut tree, 1001);
        engine.complete_action(&mut tree, 1001, SUCCESS).unwrap();
        run(&mut tree, 1002);
        engine.complete_action(&mut tree, 1002, SUCCESS).unwrap();
        number(&mut tree);
        let second_stage_action = tree.stage_instances[1].workflow_instances[0].action_instances[0].id;
        run(&mut tree, second_stage_action);

        let outcome = engine.reset_action(&mut tree, 1001, true).unwrap();

        assert_eq!(status_of(&tree, 1001), READY);
        assert_eq!(status_of(&tree, 1002), NEW);
        assert_eq!(tree.stage_instances[0].status_id, INPROGRESS);
        assert_eq!(tree.stage_instances[0].workflow_instances[0].status_id, INPROGRESS);
        assert_eq!(tree.stage_instances[1].status_id, NEW);
        assert_eq!(status_of(&tree, second_stage_action), NEW);
        assert_eq!(tree.status_id, INPROGRESS);

        let displaced: Vec<i64> = outcome.displaced.iter().map(|a| a.id).collect();
        assert_eq!(displaced, vec![second_stage_action]);
    }

    #[test]
    fn test_force_reset_after_failure_reruns_pipeline() {
        let catalog = StatusCatalog::builtin();
        let template = two_stage();
        let engine = WorkflowEngine::new(&catalog, &template);
        let mut tree = started(&template, &catalog);

        run(&mut tree, 1001);
        engine.complete_action(&mut tree, 1001, FAILED).unwrap();
        assert_eq!(tree.status_id, FAILED);
        assert_eq!(status_of(&tree, 1002), CANCELED);

        engine.reset_action(&mut tree, 1001, true).unwrap();
        assert_eq!(status_of(&tree, 1001), READY);
        assert_eq!(status_of(&tree, 1002), NEW);

        run(&mut tree, 1001);
        engine.complete_action(&mut tree, 1001, SUCCESS).unwrap();
        run(&mut tree, 1002);
        let cascade = engine.complete_action(&mut tree, 1002, SUCCESS).unwrap();
        assert_eq!(cascade.stages_opened, vec![2]);
        assert_eq!(tree.status_id, INPROGRESS);
    }

    #[test]
    fn test_reset_pipeline_restarts_first_stage() {
        let catalog = StatusCatalog::builtin();
        let template = two_stage();
        let engine = WorkflowEngine::new(&catalog, &template);
        let mut tree = started(&template, &catalog);

        run(&mut tree, 1001);
        engine.complete_action(&mut tree, 1001, SUCCESS).unwrap();
        run(&mut tree, 1002);
        engine.complete_action(&mut tree, 1002, SUCCESS).unwrap();
        number(&mut tree);

        let outcome = engine.reset_pipeline(&mut tree).unwrap();
        assert!(outcome.displaced.is_empty());
        assert_eq!(outcome.cascade.stages_opened, vec![1]);
        assert_eq!(status_of(&tree, 1001), READY);
        assert_eq!(status_of(&tree, 1002), NEW);
        assert_eq!(tree.stage_instances[0].status_id, INPROGRESS);
        assert_eq!(tree.stage_instances[1].status_id, NEW);
        assert_eq!(tree.status_id, INPROGRESS);
    }

    #[test]
    fn test_cancel_pipeline_collects_in_flight() {
        let catalog = StatusCatalog::builtin();
        let template = pipeline(
            1,
            vec![stage(
                1,
                1,
                vec![
                    workflow(10, 1, vec![action(100, 1, 1), action(101, 2, 1)]),
                    workflow(11, 2, vec![action(110, 1, 1)]),
                ],
            )],
        );
        let engine = WorkflowEngine::new(&catalog, &template);
        let mut tree = started(&template, &catalog);
        run(&mut tree, 1001);

        let outcome = engine.cancel_pipeline(&mut tree).unwrap();
        assert_eq!(outcome.canceled, 3);
        assert_eq!(outcome.in_flight.len(), 1);
        assert_eq!(outcome.in_flight[0].id, 1001);
        assert!(tree.actions().all(|a| a.status_id == CANCELED));
        assert_eq!(tree.stage_instances[0].status_id, CANCELED);
        assert_eq!(tree.status_id, CANCELED);

        assert!(matches!(
            engine.cancel_pipeline(&mut tree),
            Err(EngineError::InvalidTransition(_))
        ));
    }
}
