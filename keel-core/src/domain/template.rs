//! Template domain types
//!
//! Templates are immutable operator configuration. Each template type can
//! materialize into its runtime counterpart with `convert_to_instance`, copying
//! a fixed subset of attributes and starting out as `NEW`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::instance::{ActionInstance, StageInstance, WorkflowInstance, UNSAVED_ID};
use crate::domain::status::NEW;
use crate::domain::work::Slice;

/// Pipeline definition: an ordered list of stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub id: i64,
    pub name: String,
    pub stages: Vec<StageTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTemplate {
    pub id: i64,
    pub name: String,
    pub order: i32,
    pub workflows: Vec<WorkflowTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: i64,
    pub name: String,
    pub order: i32,
    pub actions: Vec<ActionTemplate>,
}

/// A single command to run somewhere in the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub id: i64,
    pub name: String,
    pub order: i32,
    pub cmd: String,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub callback_required: bool,
    /// Routing key, see `Grain`
    pub grain: String,
    /// Number of parallel slices; 0 and 1 both mean a single instance
    #[serde(default)]
    pub slices: u32,
    /// Per-action configuration merged over the pipeline parameters
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl StageTemplate {
    /// Materializes the stage with all of its workflows and actions
    pub fn convert_to_instance(&self, pipeline_instance_id: i64) -> StageInstance {
        let mut workflows: Vec<&WorkflowTemplate> = self.workflows.iter().collect();
        workflows.sort_by_key(|w| (w.order, w.id));

        StageInstance {
            id: UNSAVED_ID,
            pipeline_instance_id,
            stage_id: self.id,
            order: self.order,
            status_id: NEW,
            start_date: None,
            end_date: None,
            workflow_instances: workflows
                .into_iter()
                .map(|w| w.convert_to_instance(pipeline_instance_id))
                .collect(),
        }
    }
}

impl WorkflowTemplate {
    pub fn convert_to_instance(&self, pipeline_instance_id: i64) -> WorkflowInstance {
        let mut actions: Vec<&ActionTemplate> = self.actions.iter().collect();
        actions.sort_by_key(|a| (a.order, a.id));

        WorkflowInstance {
            id: UNSAVED_ID,
            stage_instance_id: UNSAVED_ID,
            pipeline_instance_id,
            workflow_id: self.id,
            order: self.order,
            status_id: NEW,
            start_date: None,
            end_date: None,
            action_instances: actions
                .into_iter()
                .flat_map(|a| a.convert_to_instances(pipeline_instance_id))
                .collect(),
        }
    }
}

impl ActionTemplate {
    /// Expands the action into one instance per slice
    pub fn convert_to_instances(&self, pipeline_instance_id: i64) -> Vec<ActionInstance> {
        let total = self.slices.max(1);

        (1..=total)
            .map(|index| ActionInstance {
                id: UNSAVED_ID,
                workflow_instance_id: UNSAVED_ID,
                pipeline_instance_id,
                action_id: self.id,
                order: self.order,
                status_id: NEW,
                slice: Slice::new(index, total),
                assigned_to: None,
                start_date: None,
                end_date: None,
                manual: self.manual,
                callback_required: self.callback_required,
                output: None,
            })
            .collect()
    }
}
