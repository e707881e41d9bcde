//! Worker DTOs
//!
//! Data transfer objects for worker registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::worker::{Worker, WorkerStatus};

/// Request to register a push worker with the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorker {
    /// `ip:port` the worker listens on
    pub address: String,

    /// Grains this worker accepts
    pub grains: Vec<String>,
}

/// Summary information about a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub address: String,
    pub grain_count: usize,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

impl From<Worker> for WorkerSummary {
    fn from(worker: Worker) -> Self {
        WorkerSummary {
            address: worker.address,
            grain_count: worker.grains.len(),
            last_heartbeat_at: worker.last_heartbeat_at,
            status: worker.status,
        }
    }
}
