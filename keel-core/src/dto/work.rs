//! Work DTOs exchanged with executors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Job pushed to a worker (`POST /work`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub cmd: String,
    pub executable: String,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub action_instance_id: i64,
    pub pipeline_instance_id: i64,
    pub workflow_instance_id: i64,
    pub slice: String,
}

/// Completion callback posted by an executor when an action finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneCallback {
    /// Status id, type name (`SUCCESS`, `FAILED`, ...) or display name
    pub status: String,
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
}

/// Answer of a worker's availability endpoint (`GET /work/available`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAvailability {
    pub available: bool,
    #[serde(default)]
    pub asleep: bool,
}

impl WorkerAvailability {
    pub fn can_accept(&self) -> bool {
        self.available && !self.asleep
    }
}
