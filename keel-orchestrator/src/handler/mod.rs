//! Queue Handlers
//!
//! Each handler owns the work requests whose grain it recognizes and the
//! action-instances whose `assigned_to` carries its prefix. The registry keeps
//! them in registration order, which is also the routing priority.

pub mod docker;
pub mod ecs;
pub mod k8s;
pub mod standard;

pub use docker::DockerHandler;
pub use ecs::EcsHandler;
pub use k8s::K8sHandler;
pub use standard::StandardHandler;

use async_trait::async_trait;
use keel_core::domain::instance::ActionInstance;
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::Worker;
use std::sync::Arc;
use thiserror::Error;

use crate::repository::StoreError;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Backend transiently saturated: skip it for the rest of the cycle
    #[error("{0} backend asked to sleep: {1}")]
    ShouldSleep(&'static str, String),

    /// Backend refused for now (conflict or bad request); retried next cycle
    #[error("{0} backend unavailable: {1}")]
    ServiceUnavailable(&'static str, String),

    /// Backend rejected the job outright; the action-instance fails
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// True for the outcomes that park the whole backend for the cycle
    pub fn should_sleep(&self) -> bool {
        matches!(
            self,
            HandlerError::ShouldSleep(..) | HandlerError::ServiceUnavailable(..)
        )
    }

    /// True for the outcomes that fail the action-instance
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, HandlerError::Rejected(_) | HandlerError::Internal(_))
    }
}

/// Outcome of a dispatch attempt that did not error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Claimed and handed to an executor, bound through `assigned_to`
    Sent(String),
    /// No executor could take it this cycle
    Deferred,
    /// Another dispatcher claimed it first
    AlreadyClaimed,
}

#[async_trait]
pub trait QueueHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_process_work_request(&self, request: &WorkRequest) -> bool;

    async fn process_work_request(
        &self,
        request: &WorkRequest,
        workers: &[Worker],
    ) -> Result<Dispatch, HandlerError>;

    /// Whether `assigned_to` binds the instance to this backend
    fn can_process_action_instance(&self, instance: &ActionInstance) -> bool;

    /// Returns the instances whose execution is confirmed lost
    async fn verify_still_working(
        &self,
        instances: &[ActionInstance],
        workers: &[Worker],
    ) -> Vec<ActionInstance>;

    /// Best-effort request to stop the executor. Never blocks on confirmation.
    async fn cancel_worker(&self, instance: &ActionInstance) -> bool;
}

/// Ordered list of handlers built once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn QueueHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn QueueHandler>) -> Self {
        tracing::info!("Registered {} queue handler", handler.name());
        self.handlers.push(handler);
        self
    }

    /// First handler, in registration order, that accepts the request
    pub fn for_request(&self, request: &WorkRequest) -> Option<&Arc<dyn QueueHandler>> {
        self.handlers
            .iter()
            .find(|h| h.can_process_work_request(request))
    }

    /// Handler bound to an in-flight instance through its `assigned_to`
    pub fn owner_of(&self, instance: &ActionInstance) -> Option<&Arc<dyn QueueHandler>> {
        self.handlers
            .iter()
            .find(|h| h.can_process_action_instance(instance))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

/// Variables every containerized executor receives ahead of the request's own
pub fn injected_environment(request: &WorkRequest, master_url: &str) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "KEEL_ACTION_INSTANCE_ID".to_string(),
            request.action_instance_id.to_string(),
        ),
        (
            "KEEL_PIPELINE_INSTANCE_ID".to_string(),
            request.pipeline_instance_id.to_string(),
        ),
        (
            "KEEL_WORKFLOW_INSTANCE_ID".to_string(),
            request.workflow_instance_id.to_string(),
        ),
        ("KEEL_SLICE".to_string(), request.slice.to_string()),
        ("KEEL_MASTER_URL".to_string(), master_url.to_string()),
    ];
    env.extend(
        request
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env
}
