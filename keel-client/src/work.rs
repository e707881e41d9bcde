//! Work endpoints exposed by push workers

use crate::WorkerClient;
use crate::error::Result;
use keel_core::dto::work::{WorkerAvailability, WorkerJob};

impl WorkerClient {
    // =============================================================================
    // Dispatch
    // =============================================================================

    /// Ask a worker whether it can take a job right now
    ///
    /// # Arguments
    /// * `address` - The worker's `ip:port`
    pub async fn availability(&self, address: &str) -> Result<WorkerAvailability> {
        let url = Self::url(address, "/work/available");
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Push a job to a worker
    ///
    /// # Arguments
    /// * `address` - The worker's `ip:port`
    /// * `job` - The job payload
    pub async fn submit_work(&self, address: &str, job: &WorkerJob) -> Result<()> {
        let url = Self::url(address, "/work");
        let response = self.client.post(&url).json(job).send().await?;

        tracing::debug!(
            "Pushed action-instance {} to worker {}",
            job.action_instance_id,
            address
        );

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Liveness
    // =============================================================================

    /// List the action-instance ids a worker is currently executing
    ///
    /// # Arguments
    /// * `address` - The worker's `ip:port`
    pub async fn current_work(&self, address: &str) -> Result<Vec<i64>> {
        let url = Self::url(address, "/work/current");
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Cancellation
    // =============================================================================

    /// Ask a worker to stop executing an action-instance
    ///
    /// # Arguments
    /// * `address` - The worker's `ip:port`
    /// * `action_instance_id` - The instance to stop
    pub async fn cancel_work(&self, address: &str, action_instance_id: i64) -> Result<()> {
        let url = Self::url(address, &format!("/work/{}", action_instance_id));
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
