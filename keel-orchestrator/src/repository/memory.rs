//! In-memory Store
//!
//! Same contract as the PostgreSQL store over mutex-guarded maps. Used by the
//! tests and by `KEEL_STORE=memory` for single-process development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::instance::{ActionInstance, PipelineInstance, UNSAVED_ID, WorkflowInstance};
use keel_core::domain::status::{INPROGRESS, NEW, READY, Status, is_resolved};
use keel_core::domain::template::{ActionTemplate, PipelineTemplate};
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::{Worker, WorkerStatus};
use keel_core::dto::worker::RegisterWorker;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{Store, StoreError, action_changed, same_binding};

#[derive(Default)]
struct State {
    templates: HashMap<i64, PipelineTemplate>,
    /// Action template id -> action template
    actions: HashMap<i64, ActionTemplate>,
    statuses: Vec<Status>,
    trees: BTreeMap<i64, PipelineInstance>,
    workers: BTreeMap<String, Worker>,
    next_id: i64,
}

impl State {
    /// Gives every unsaved node of `tree` an id and fixes up parent links
    fn assign_ids(&mut self, tree: &mut PipelineInstance) {
        if tree.id == UNSAVED_ID {
            tree.id = self.next_id();
        }

        for stage in &mut tree.stage_instances {
            if stage.id == UNSAVED_ID {
                stage.id = self.next_id();
            }
            stage.pipeline_instance_id = tree.id;

            for workflow in &mut stage.workflow_instances {
                if workflow.id == UNSAVED_ID {
                    workflow.id = self.next_id();
                }
                workflow.stage_instance_id = stage.id;
                workflow.pipeline_instance_id = tree.id;

                for action in &mut workflow.action_instances {
                    if action.id == UNSAVED_ID {
                        action.id = self.next_id();
                    }
                    action.workflow_instance_id = workflow.id;
                    action.pipeline_instance_id = tree.id;
                }
            }
        }
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn action_mut(&mut self, action_instance_id: i64) -> Option<&mut ActionInstance> {
        self.trees
            .values_mut()
            .flat_map(|t| t.stage_instances.iter_mut())
            .flat_map(|s| s.workflow_instances.iter_mut())
            .flat_map(|w| w.action_instances.iter_mut())
            .find(|a| a.id == action_instance_id)
    }

    fn request(
        &self,
        tree: &PipelineInstance,
        workflow: &WorkflowInstance,
        action: &ActionInstance,
    ) -> Option<WorkRequest> {
        let Some(template) = self.actions.get(&action.action_id) else {
            tracing::warn!(
                "Action instance {} references unknown action {}",
                action.id,
                action.action_id
            );
            return None;
        };

        let mut environment = tree.parameters.clone();
        environment.extend(template.environment.clone());

        Some(WorkRequest {
            action_instance_id: action.id,
            pipeline_instance_id: tree.id,
            workflow_instance_id: workflow.id,
            action_id: action.action_id,
            cmd: template.cmd.clone(),
            executable: template.executable.clone(),
            args: template.args.clone(),
            grain: template.grain.clone(),
            slice: action.slice,
            order: action.order,
            priority: tree.priority,
            pipeline_created: tree.created_date,
            environment,
        })
    }

    /// Every action-instance of an INPROGRESS pipeline with its workflow
    fn running_actions(
        &self,
    ) -> impl Iterator<Item = (&PipelineInstance, &WorkflowInstance, &ActionInstance)> {
        self.trees
            .values()
            .filter(|t| t.status_id == INPROGRESS)
            .flat_map(|t| {
                t.stage_instances
                    .iter()
                    .flat_map(|s| s.workflow_instances.iter())
                    .flat_map(move |w| w.action_instances.iter().map(move |a| (t, w, a)))
            })
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_templates(templates: Vec<PipelineTemplate>) -> Self {
        let mut state = State::default();
        for template in templates {
            for action in template
                .stages
                .iter()
                .flat_map(|s| s.workflows.iter())
                .flat_map(|w| w.actions.iter())
            {
                state.actions.insert(action.id, action.clone());
            }
            state.templates.insert(template.id, template);
        }

        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<Status>) -> Self {
        self.state.get_mut().statuses = statuses;
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_statuses(&self) -> Result<Vec<Status>, StoreError> {
        Ok(self.state.lock().await.statuses.clone())
    }

    async fn find_template(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<PipelineTemplate>, StoreError> {
        Ok(self.state.lock().await.templates.get(&pipeline_id).cloned())
    }

    async fn load_tree(
        &self,
        pipeline_instance_id: i64,
    ) -> Result<Option<PipelineInstance>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .trees
            .get(&pipeline_instance_id)
            .cloned())
    }

    async fn save_tree(&self, tree: &mut PipelineInstance) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.assign_ids(tree);
        state.trees.insert(tree.id, tree.clone());
        Ok(())
    }

    async fn update_tree(
        &self,
        before: &PipelineInstance,
        tree: &mut PipelineInstance,
    ) -> Result<Vec<i64>, StoreError> {
        let mut state = self.state.lock().await;
        state.assign_ids(tree);

        let loaded: HashMap<i64, &ActionInstance> = before.actions().map(|a| (a.id, a)).collect();
        let stored: HashMap<i64, ActionInstance> = state
            .trees
            .get(&tree.id)
            .map(|t| t.actions().map(|a| (a.id, a.clone())).collect())
            .unwrap_or_default();

        let mut skipped = Vec::new();
        for stage in &mut tree.stage_instances {
            for workflow in &mut stage.workflow_instances {
                for action in &mut workflow.action_instances {
                    let (Some(was), Some(now)) = (loaded.get(&action.id), stored.get(&action.id))
                    else {
                        continue;
                    };

                    if !action_changed(was, action) {
                        *action = now.clone();
                    } else if !same_binding(was, now) {
                        skipped.push(action.id);
                        *action = now.clone();
                    }
                }
            }
        }

        state.trees.insert(tree.id, tree.clone());
        Ok(skipped)
    }

    async fn find_action(
        &self,
        action_instance_id: i64,
    ) -> Result<Option<ActionInstance>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .trees
            .values()
            .flat_map(|t| t.actions())
            .find(|a| a.id == action_instance_id)
            .cloned())
    }

    async fn ready_work(&self) -> Result<Vec<WorkRequest>, StoreError> {
        let state = self.state.lock().await;

        Ok(state
            .running_actions()
            .filter(|(_, _, a)| a.status_id == READY && !a.manual)
            .filter_map(|(t, w, a)| state.request(t, w, a))
            .collect())
    }

    async fn stalled_work(&self) -> Result<Vec<WorkRequest>, StoreError> {
        let state = self.state.lock().await;

        Ok(state
            .running_actions()
            .filter(|(_, w, a)| {
                w.status_id == INPROGRESS
                    && a.status_id == NEW
                    && !a.manual
                    && !w
                        .action_instances
                        .iter()
                        .any(|other| other.order < a.order && !is_resolved(other.status_id))
            })
            .filter_map(|(t, w, a)| state.request(t, w, a))
            .collect())
    }

    async fn claim_action(
        &self,
        action_instance_id: i64,
        assigned_to: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;

        match state.action_mut(action_instance_id) {
            Some(action) if matches!(action.status_id, NEW | READY) => {
                action.status_id = INPROGRESS;
                action.assigned_to = Some(assigned_to.to_string());
                action.start_date = Some(Utc::now());
                action.end_date = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_assignment(
        &self,
        action_instance_id: i64,
        assigned_to: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(action) = state.action_mut(action_instance_id) {
            action.assigned_to = Some(assigned_to.to_string());
        }
        Ok(())
    }

    async fn release_action(&self, action_instance_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(action) = state.action_mut(action_instance_id) {
            if action.status_id == INPROGRESS {
                action.status_id = READY;
                action.assigned_to = None;
                action.start_date = None;
            }
        }
        Ok(())
    }

    async fn stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ActionInstance>, StoreError> {
        let state = self.state.lock().await;

        Ok(state
            .trees
            .values()
            .flat_map(|t| t.actions())
            .filter(|a| {
                a.status_id == INPROGRESS
                    && a.end_date.is_none()
                    && a.start_date.is_none_or(|started| started < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn register_worker(&self, req: &RegisterWorker) -> Result<Worker, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let registered_at = state
            .workers
            .get(&req.address)
            .map(|w| w.registered_at)
            .unwrap_or(now);

        let worker = Worker {
            address: req.address.clone(),
            grains: req.grains.clone(),
            registered_at,
            last_heartbeat_at: now,
            status: WorkerStatus::Online,
        };
        state.workers.insert(worker.address.clone(), worker.clone());

        Ok(worker)
    }

    async fn heartbeat_worker(&self, address: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;

        match state.workers.get_mut(address) {
            Some(worker) => {
                worker.last_heartbeat_at = Utc::now();
                worker.status = WorkerStatus::Online;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.state.lock().await.workers.values().cloned().collect())
    }

    async fn set_worker_status(
        &self,
        address: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(worker) = state.workers.get_mut(address) {
            worker.status = status;
        }
        Ok(())
    }

    async fn mark_stale_workers_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut marked = 0;

        for worker in state.workers.values_mut() {
            if worker.last_heartbeat_at < cutoff && worker.status != WorkerStatus::Offline {
                worker.status = WorkerStatus::Offline;
                marked += 1;
            }
        }

        Ok(marked)
    }
}
