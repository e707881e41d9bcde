//! Work routing types
//!
//! A `WorkRequest` is the normalized unit handed to a queue handler: one
//! action-instance, everything needed to run it, and the sort keys the work
//! selector orders by. The `Grain` decides which handler owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::dto::work::WorkerJob;

/// One of `total` interchangeable parallel sub-units of an action, `"index/total"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slice {
    pub index: u32,
    pub total: u32,
}

impl Slice {
    pub const SINGLE: Slice = Slice { index: 1, total: 1 };

    pub fn new(index: u32, total: u32) -> Self {
        Self { index, total }
    }
}

impl Default for Slice {
    fn default() -> Self {
        Self::SINGLE
    }
}

impl std::fmt::Display for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

impl FromStr for Slice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, total) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid slice '{}': expected '<n>/<total>'", s))?;

        let index = index
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid slice index in '{}': {}", s, e))?;
        let total = total
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid slice total in '{}': {}", s, e))?;

        if index == 0 || total == 0 || index > total {
            return Err(format!("slice '{}' is out of range", s));
        }

        Ok(Slice { index, total })
    }
}

impl Serialize for Slice {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Slice {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Routing key: `"<scheme>://<target>"` or a plain worker label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grain<'a> {
    pub scheme: Option<&'a str>,
    pub target: &'a str,
}

impl<'a> Grain<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once("://") {
            Some((scheme, target)) => Grain {
                scheme: Some(scheme),
                target,
            },
            None => Grain {
                scheme: None,
                target: raw,
            },
        }
    }

    /// True when the grain names `scheme` explicitly
    pub fn is(&self, scheme: &str) -> bool {
        self.scheme == Some(scheme)
    }
}

/// A dispatchable action-instance as returned by the work selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub action_instance_id: i64,
    pub pipeline_instance_id: i64,
    pub workflow_instance_id: i64,
    pub action_id: i64,
    pub cmd: String,
    pub executable: String,
    pub args: Vec<String>,
    pub grain: String,
    pub slice: Slice,
    pub order: i32,
    pub priority: i32,
    pub pipeline_created: DateTime<Utc>,
    /// Pipeline parameters overlaid with the action's own configuration
    pub environment: BTreeMap<String, String>,
}

impl WorkRequest {
    pub fn grain(&self) -> Grain<'_> {
        Grain::parse(&self.grain)
    }

    /// Payload pushed to a worker
    pub fn to_job(&self) -> WorkerJob {
        WorkerJob {
            cmd: self.cmd.clone(),
            executable: self.executable.clone(),
            args: self.args.clone(),
            environment: self.environment.clone(),
            action_instance_id: self.action_instance_id,
            pipeline_instance_id: self.pipeline_instance_id,
            workflow_instance_id: self.workflow_instance_id,
            slice: self.slice.to_string(),
        }
    }
}
