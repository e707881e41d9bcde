//! Pipeline DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to start a new pipeline-instance from a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchPipeline {
    pub pipeline_id: i64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}
