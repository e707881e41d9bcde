//! Worker Service
//!
//! Registry of push workers used by the standard handler.

use keel_core::domain::worker::Worker;
use keel_core::dto::worker::{RegisterWorker, WorkerSummary};

use super::{Result, ServiceError};
use crate::context::SchedulerContext;

/// Register (or re-register) a push worker
pub async fn register_worker(ctx: &SchedulerContext, req: RegisterWorker) -> Result<Worker> {
    validate_registration(&req)?;

    let worker = ctx.store.register_worker(&req).await?;

    tracing::info!(
        "Worker registered: {} (grains: {})",
        worker.address,
        worker.grains.join(", ")
    );

    Ok(worker)
}

/// Record a heartbeat; brings offline or inactive workers back online
pub async fn heartbeat(ctx: &SchedulerContext, address: &str) -> Result<()> {
    if !ctx.store.heartbeat_worker(address).await? {
        return Err(ServiceError::NotFound(format!("Worker {}", address)));
    }

    tracing::debug!("Heartbeat from worker {}", address);
    Ok(())
}

pub async fn list_workers(ctx: &SchedulerContext) -> Result<Vec<WorkerSummary>> {
    let workers = ctx.store.list_workers().await?;
    Ok(workers.into_iter().map(WorkerSummary::from).collect())
}

fn validate_registration(req: &RegisterWorker) -> Result<()> {
    if req.address.trim().is_empty() {
        return Err(ServiceError::BadRequest(
            "Worker address cannot be empty".to_string(),
        ));
    }

    if req.address.contains("://") || req.address.starts_with("--") {
        return Err(ServiceError::BadRequest(format!(
            "Worker address '{}' must be a plain ip:port",
            req.address
        )));
    }

    if req.grains.is_empty() || req.grains.iter().any(|g| g.trim().is_empty()) {
        return Err(ServiceError::BadRequest(
            "Worker must accept at least one non-empty grain".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::handler::HandlerRegistry;
    use keel_core::domain::worker::WorkerStatus;

    fn registration(address: &str, grains: &[&str]) -> RegisterWorker {
        RegisterWorker {
            address: address.to_string(),
            grains: grains.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn test_validate_registration() {
        assert!(validate_registration(&registration("10.0.0.1:9000", &["linux"])).is_ok());
        assert!(validate_registration(&registration("", &["linux"])).is_err());
        assert!(validate_registration(&registration("docker://x", &["linux"])).is_err());
        assert!(validate_registration(&registration("10.0.0.1:9000", &[])).is_err());
        assert!(validate_registration(&registration("10.0.0.1:9000", &[" "])).is_err());
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let (ctx, _) = context(vec![], HandlerRegistry::new()).await;

        let worker = register_worker(&ctx, registration("10.0.0.1:9000", &["linux", "gpu"]))
            .await
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Online);

        heartbeat(&ctx, "10.0.0.1:9000").await.unwrap();
        assert!(matches!(
            heartbeat(&ctx, "10.0.0.2:9000").await,
            Err(ServiceError::NotFound(_))
        ));

        let workers = list_workers(&ctx).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].grain_count, 2);
    }
}
