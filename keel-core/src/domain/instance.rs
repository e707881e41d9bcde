//! Instance domain types
//!
//! One `PipelineInstance` owns a tree of stage, workflow and action instances.
//! Instances are mutated by the workflow engine and retired on terminal status;
//! they are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::domain::status::{StatusCatalog, StatusId};
use crate::domain::work::Slice;

/// Id carried by instances that have not been persisted yet
pub const UNSAVED_ID: i64 = 0;

/// A running (or finished) pipeline and its whole instance tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: i64,
    pub pipeline_id: i64,
    pub status_id: StatusId,
    pub priority: i32,
    pub created_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub parameters: BTreeMap<String, String>,
    pub stage_instances: Vec<StageInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInstance {
    pub id: i64,
    pub pipeline_instance_id: i64,
    pub stage_id: i64,
    pub order: i32,
    pub status_id: StatusId,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub workflow_instances: Vec<WorkflowInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub stage_instance_id: i64,
    pub pipeline_instance_id: i64,
    pub workflow_id: i64,
    pub order: i32,
    pub status_id: StatusId,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub action_instances: Vec<ActionInstance>,
}

/// One slice of one action inside one workflow-instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInstance {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub pipeline_instance_id: i64,
    /// Originating template action; slices of the same action share it
    pub action_id: i64,
    pub order: i32,
    pub status_id: StatusId,
    pub slice: Slice,
    /// Routing metadata binding the instance to its executor
    pub assigned_to: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub manual: bool,
    pub callback_required: bool,
    /// Opaque `{stats, results}` posted with the completion callback
    pub output: Option<serde_json::Value>,
}

/// Position of an action-instance inside its pipeline tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPath {
    pub stage: usize,
    pub workflow: usize,
    pub action: usize,
}

impl PipelineInstance {
    /// Iterates every action-instance of the tree
    pub fn actions(&self) -> impl Iterator<Item = &ActionInstance> {
        self.stage_instances
            .iter()
            .flat_map(|s| s.workflow_instances.iter())
            .flat_map(|w| w.action_instances.iter())
    }

    pub fn find_action(&self, action_instance_id: i64) -> Option<ActionPath> {
        for (si, stage) in self.stage_instances.iter().enumerate() {
            for (wi, workflow) in stage.workflow_instances.iter().enumerate() {
                if let Some(ai) = workflow
                    .action_instances
                    .iter()
                    .position(|a| a.id == action_instance_id)
                {
                    return Some(ActionPath {
                        stage: si,
                        workflow: wi,
                        action: ai,
                    });
                }
            }
        }
        None
    }

    pub fn action(&self, path: ActionPath) -> &ActionInstance {
        &self.stage_instances[path.stage].workflow_instances[path.workflow].action_instances
            [path.action]
    }

    pub fn action_mut(&mut self, path: ActionPath) -> &mut ActionInstance {
        &mut self.stage_instances[path.stage].workflow_instances[path.workflow].action_instances
            [path.action]
    }

    /// Human-readable dump of the instance tree
    pub fn render(&self, catalog: &StatusCatalog) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pipeline-instance {} (pipeline {}) [{}] priority={}",
            self.id,
            self.pipeline_id,
            catalog.display_name(self.status_id),
            self.priority
        );

        for stage in &self.stage_instances {
            let _ = writeln!(
                out,
                "  stage-instance {} (stage {}, order {}) [{}]",
                stage.id,
                stage.stage_id,
                stage.order,
                catalog.display_name(stage.status_id)
            );

            for workflow in &stage.workflow_instances {
                let _ = writeln!(
                    out,
                    "    workflow-instance {} (workflow {}, order {}) [{}]",
                    workflow.id,
                    workflow.workflow_id,
                    workflow.order,
                    catalog.display_name(workflow.status_id)
                );

                for action in &workflow.action_instances {
                    let _ = writeln!(
                        out,
                        "      action-instance {} (action {}, order {}, slice {}) [{}]{}",
                        action.id,
                        action.action_id,
                        action.order,
                        action.slice,
                        catalog.display_name(action.status_id),
                        action
                            .assigned_to
                            .as_deref()
                            .map(|a| format!(" -> {}", a))
                            .unwrap_or_default()
                    );
                }
            }
        }

        out
    }
}
