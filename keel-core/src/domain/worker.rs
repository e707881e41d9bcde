//! Worker domain model
//!
//! Represents a push-based worker that the master hands work to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker that can execute actions pushed by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// `ip:port` the worker listens on; doubles as its identifier
    pub address: String,

    /// Grains (plain labels) this worker accepts
    pub grains: Vec<String>,

    /// When this worker was first registered
    pub registered_at: DateTime<Utc>,

    /// Last time this worker sent a heartbeat
    pub last_heartbeat_at: DateTime<Utc>,

    /// Current status of the worker
    pub status: WorkerStatus,
}

impl Worker {
    pub fn accepts(&self, grain: &str) -> bool {
        self.grains.iter().any(|g| g == grain)
    }
}

/// Status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Worker is heartbeating and can be probed
    Online,

    /// Worker hasn't sent a heartbeat recently
    Offline,

    /// A connection to the worker failed; skipped until it heartbeats again
    Inactive,
}

impl WorkerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Online" => WorkerStatus::Online,
            "Inactive" => WorkerStatus::Inactive,
            _ => WorkerStatus::Offline,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Online => write!(f, "Online"),
            WorkerStatus::Offline => write!(f, "Offline"),
            WorkerStatus::Inactive => write!(f, "Inactive"),
        }
    }
}
