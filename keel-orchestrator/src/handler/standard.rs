//! Standard (push) handler
//!
//! Owns every grain without a scheme. Candidate workers are online workers
//! whose grains contain the request grain; they are shuffled, probed in
//! bounded batches, and the job is pushed to the first one that accepts it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use keel_client::{ClientError, WorkerClient};
use keel_core::domain::instance::ActionInstance;
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::{Worker, WorkerStatus};
use keel_core::dto::work::{WorkerAvailability, WorkerJob};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{Dispatch, HandlerError, QueueHandler};
use crate::repository::Store;

/// The calls the handler makes on a push worker
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn availability(&self, address: &str) -> Result<WorkerAvailability, ClientError>;

    async fn submit_work(&self, address: &str, job: &WorkerJob) -> Result<(), ClientError>;

    /// Ids of the action-instances the worker is executing
    async fn current_work(&self, address: &str) -> Result<Vec<i64>, ClientError>;

    async fn cancel_work(&self, address: &str, action_instance_id: i64) -> Result<(), ClientError>;
}

#[async_trait]
impl WorkerApi for WorkerClient {
    async fn availability(&self, address: &str) -> Result<WorkerAvailability, ClientError> {
        WorkerClient::availability(self, address).await
    }

    async fn submit_work(&self, address: &str, job: &WorkerJob) -> Result<(), ClientError> {
        WorkerClient::submit_work(self, address, job).await
    }

    async fn current_work(&self, address: &str) -> Result<Vec<i64>, ClientError> {
        WorkerClient::current_work(self, address).await
    }

    async fn cancel_work(&self, address: &str, action_instance_id: i64) -> Result<(), ClientError> {
        WorkerClient::cancel_work(self, address, action_instance_id).await
    }
}

pub struct StandardHandler {
    store: Arc<dyn Store>,
    api: Arc<dyn WorkerApi>,
    probe_concurrency: usize,
    /// address -> time of the last connection failure
    failures: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StandardHandler {
    pub fn new(store: Arc<dyn Store>, api: Arc<dyn WorkerApi>, probe_concurrency: usize) -> Self {
        Self {
            store,
            api,
            probe_concurrency: probe_concurrency.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Online workers for `grain` that have not failed since their last heartbeat
    fn candidates<'w>(&self, grain: &str, workers: &'w [Worker]) -> Vec<&'w Worker> {
        let failures = self.failures.lock().map(|f| f.clone()).unwrap_or_default();

        let mut candidates: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Online && w.accepts(grain))
            .filter(|w| {
                failures
                    .get(&w.address)
                    .is_none_or(|failed_at| *failed_at < w.last_heartbeat_at)
            })
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    /// Flags a worker whose port could not be reached
    async fn mark_unreachable(&self, address: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(address.to_string(), Utc::now());
        }

        if let Err(e) = self
            .store
            .set_worker_status(address, WorkerStatus::Inactive)
            .await
        {
            tracing::warn!("Failed to mark worker {} inactive: {}", address, e);
        } else {
            tracing::warn!("Worker {} is unreachable, marked inactive", address);
        }
    }

    /// Claims the instance for `address` and pushes the job.
    /// Returns `Ok(None)` when the push failed and the claim was rolled back.
    async fn push(
        &self,
        request: &WorkRequest,
        address: &str,
    ) -> Result<Option<Dispatch>, HandlerError> {
        if !self
            .store
            .claim_action(request.action_instance_id, address)
            .await?
        {
            return Ok(Some(Dispatch::AlreadyClaimed));
        }

        match self.api.submit_work(address, &request.to_job()).await {
            Ok(()) => {
                tracing::info!(
                    "Dispatched action-instance {} to worker {}",
                    request.action_instance_id,
                    address
                );
                Ok(Some(Dispatch::Sent(address.to_string())))
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to push action-instance {} to worker {}: {}",
                    request.action_instance_id,
                    address,
                    e
                );
                self.store.release_action(request.action_instance_id).await?;
                if e.is_connect_failure() {
                    self.mark_unreachable(address).await;
                }
                Ok(None)
            }
        }
    }
}

async fn availability_of(
    api: Arc<dyn WorkerApi>,
    address: String,
) -> (String, Result<WorkerAvailability, ClientError>) {
    let answer = api.availability(&address).await;
    (address, answer)
}

async fn current_work_of(
    api: Arc<dyn WorkerApi>,
    address: String,
) -> (String, Result<Vec<i64>, ClientError>) {
    let listing = api.current_work(&address).await;
    (address, listing)
}

/// Standard workers are addressed by plain `ip:port`
fn is_worker_address(assigned_to: &str) -> bool {
    !assigned_to.contains("://") && !assigned_to.starts_with("--")
}

#[async_trait]
impl QueueHandler for StandardHandler {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn can_process_work_request(&self, request: &WorkRequest) -> bool {
        request.grain().scheme.is_none()
    }

    async fn process_work_request(
        &self,
        request: &WorkRequest,
        workers: &[Worker],
    ) -> Result<Dispatch, HandlerError> {
        let candidates = self.candidates(&request.grain, workers);
        if candidates.is_empty() {
            tracing::debug!(
                "No online worker for grain '{}' (action-instance {})",
                request.grain,
                request.action_instance_id
            );
            return Ok(Dispatch::Deferred);
        }

        for batch in candidates.chunks(self.probe_concurrency) {
            let checks: Vec<_> = batch
                .iter()
                .map(|worker| availability_of(self.api.clone(), worker.address.clone()))
                .collect();
            let answers: Vec<(String, Result<WorkerAvailability, ClientError>)> =
                stream::iter(checks)
                    .buffered(self.probe_concurrency)
                    .collect()
                    .await;

            for (address, answer) in answers {
                match answer {
                    Ok(availability) if availability.can_accept() => {
                        if let Some(dispatch) = self.push(request, &address).await? {
                            return Ok(dispatch);
                        }
                    }
                    Ok(_) => {
                        tracing::debug!("Worker {} is busy or asleep", address);
                    }
                    Err(e) if e.is_connect_failure() => {
                        self.mark_unreachable(&address).await;
                    }
                    Err(e) => {
                        tracing::debug!("Availability check of worker {} failed: {}", address, e);
                    }
                }
            }
        }

        Ok(Dispatch::Deferred)
    }

    fn can_process_action_instance(&self, instance: &ActionInstance) -> bool {
        instance
            .assigned_to
            .as_deref()
            .is_some_and(is_worker_address)
    }

    async fn verify_still_working(
        &self,
        instances: &[ActionInstance],
        _workers: &[Worker],
    ) -> Vec<ActionInstance> {
        let mut by_worker: BTreeMap<String, Vec<&ActionInstance>> = BTreeMap::new();
        for instance in instances {
            if let Some(address) = &instance.assigned_to {
                by_worker.entry(address.clone()).or_default().push(instance);
            }
        }

        let requests: Vec<_> = by_worker
            .keys()
            .map(|address| current_work_of(self.api.clone(), address.clone()))
            .collect();
        let listings: Vec<(String, Result<Vec<i64>, ClientError>)> = stream::iter(requests)
            .buffered(self.probe_concurrency)
            .collect()
            .await;

        let mut lost = Vec::new();
        for (address, listing) in listings {
            let Some(assigned) = by_worker.get(&address) else {
                continue;
            };
            match listing {
                Ok(running) => lost.extend(
                    assigned
                        .iter()
                        .filter(|i| !running.contains(&i.id))
                        .map(|i| (*i).clone()),
                ),
                Err(e) if e.is_connect_failure() => {
                    tracing::warn!(
                        "Worker {} refused connection, reclaiming {} instance(s)",
                        address,
                        assigned.len()
                    );
                    lost.extend(assigned.iter().map(|i| (*i).clone()));
                }
                Err(e) => {
                    tracing::debug!(
                        "Liveness check of worker {} inconclusive, assuming still working: {}",
                        address,
                        e
                    );
                }
            }
        }

        lost
    }

    async fn cancel_worker(&self, instance: &ActionInstance) -> bool {
        let Some(address) = instance.assigned_to.as_deref() else {
            return false;
        };

        match self.api.cancel_work(address, instance.id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Failed to cancel action-instance {} on worker {}: {}",
                    instance.id,
                    address,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{action, pipeline, stage, workflow};
    use crate::repository::MemoryStore;
    use crate::service::pipeline::launch_tree;
    use keel_core::domain::status::{INPROGRESS, READY, StatusCatalog};
    use keel_core::domain::work::Slice;
    use keel_core::dto::worker::RegisterWorker;
    use std::collections::HashSet;

    /// Scripted workers, keyed by address
    #[derive(Default)]
    struct FakeWorkers {
        /// addresses whose port refuses connections
        refused: HashSet<String>,
        /// addresses reporting themselves busy
        busy: HashSet<String>,
        /// addresses whose job endpoint answers 500
        failing_submit: HashSet<String>,
        /// addresses whose current-work listing answers 503
        failing_listing: HashSet<String>,
        running: HashMap<String, Vec<i64>>,
        submitted: Mutex<Vec<(String, i64)>>,
        canceled: Mutex<Vec<(String, i64)>>,
    }

    /// A real connect failure: nothing listens on port 1
    async fn refused() -> ClientError {
        reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err()
            .into()
    }

    #[async_trait]
    impl WorkerApi for FakeWorkers {
        async fn availability(&self, address: &str) -> Result<WorkerAvailability, ClientError> {
            if self.refused.contains(address) {
                return Err(refused().await);
            }
            Ok(WorkerAvailability {
                available: !self.busy.contains(address),
                asleep: false,
            })
        }

        async fn submit_work(&self, address: &str, job: &WorkerJob) -> Result<(), ClientError> {
            if self.refused.contains(address) {
                return Err(refused().await);
            }
            if self.failing_submit.contains(address) {
                return Err(ClientError::api_error(500, "disk full"));
            }
            self.submitted
                .lock()
                .unwrap()
                .push((address.to_string(), job.action_instance_id));
            Ok(())
        }

        async fn current_work(&self, address: &str) -> Result<Vec<i64>, ClientError> {
            if self.refused.contains(address) {
                return Err(refused().await);
            }
            if self.failing_listing.contains(address) {
                return Err(ClientError::api_error(503, "restarting"));
            }
            Ok(self.running.get(address).cloned().unwrap_or_default())
        }

        async fn cancel_work(&self, address: &str, action_instance_id: i64) -> Result<(), ClientError> {
            if self.refused.contains(address) {
                return Err(refused().await);
            }
            self.canceled
                .lock()
                .unwrap()
                .push((address.to_string(), action_instance_id));
            Ok(())
        }
    }

    fn set(addresses: &[&str]) -> HashSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    fn handler() -> StandardHandler {
        StandardHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeWorkers::default()),
            4,
        )
    }

    /// A store holding one launched single-action pipeline and the given
    /// registered `linux` workers. Returns the READY action-instance id.
    async fn store_with(addresses: &[&str]) -> (Arc<MemoryStore>, i64) {
        let template = pipeline(1, vec![stage(1, 1, vec![workflow(10, 1, vec![action(100, 1, 1)])])]);
        let store = Arc::new(MemoryStore::with_templates(vec![template.clone()]));
        let mut tree = launch_tree(&StatusCatalog::builtin(), &template, 0, BTreeMap::new()).unwrap();
        store.save_tree(&mut tree).await.unwrap();

        for address in addresses {
            store
                .register_worker(&RegisterWorker {
                    address: address.to_string(),
                    grains: vec!["linux".to_string()],
                })
                .await
                .unwrap();
        }

        let id = tree.actions().next().unwrap().id;
        (store, id)
    }

    fn request(id: i64) -> WorkRequest {
        WorkRequest {
            action_instance_id: id,
            pipeline_instance_id: 1,
            workflow_instance_id: 1,
            action_id: 100,
            cmd: "make".to_string(),
            executable: "sh".to_string(),
            args: vec![],
            grain: "linux".to_string(),
            slice: Slice::SINGLE,
            order: 1,
            priority: 0,
            pipeline_created: Utc::now(),
            environment: BTreeMap::new(),
        }
    }

    async fn status_of(store: &MemoryStore, address: &str) -> WorkerStatus {
        store
            .list_workers()
            .await
            .unwrap()
            .into_iter()
            .find(|w| w.address == address)
            .unwrap()
            .status
    }

    fn worker(address: &str, grains: &[&str], status: WorkerStatus) -> Worker {
        Worker {
            address: address.to_string(),
            grains: grains.iter().map(|g| g.to_string()).collect(),
            registered_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            status,
        }
    }

    fn assigned(assigned_to: Option<&str>) -> ActionInstance {
        ActionInstance {
            id: 1,
            workflow_instance_id: 1,
            pipeline_instance_id: 1,
            action_id: 1,
            order: 1,
            status_id: INPROGRESS,
            slice: Slice::SINGLE,
            assigned_to: assigned_to.map(str::to_string),
            start_date: None,
            end_date: None,
            manual: false,
            callback_required: true,
            output: None,
        }
    }

    #[test]
    fn test_owns_plain_addresses_only() {
        let handler = handler();
        assert!(handler.can_process_action_instance(&assigned(Some("10.0.0.5:9000"))));
        assert!(!handler.can_process_action_instance(&assigned(Some("docker://"))));
        assert!(!handler.can_process_action_instance(&assigned(Some("--ecs--arn:aws:ecs:task/1"))));
        assert!(!handler.can_process_action_instance(&assigned(Some("--k8s--build-1.2"))));
        assert!(!handler.can_process_action_instance(&assigned(None)));
    }

    #[test]
    fn test_candidates_filter_on_status_and_grain() {
        let handler = handler();
        let workers = vec![
            worker("10.0.0.1:9000", &["linux"], WorkerStatus::Online),
            worker("10.0.0.2:9000", &["linux"], WorkerStatus::Inactive),
            worker("10.0.0.3:9000", &["windows"], WorkerStatus::Online),
            worker("10.0.0.4:9000", &["linux", "gpu"], WorkerStatus::Online),
        ];

        let mut addresses: Vec<&str> = handler
            .candidates("linux", &workers)
            .iter()
            .map(|w| w.address.as_str())
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["10.0.0.1:9000", "10.0.0.4:9000"]);
    }

    #[test]
    fn test_failed_worker_skipped_until_next_heartbeat() {
        let handler = handler();
        let mut workers = vec![worker("10.0.0.1:9000", &["linux"], WorkerStatus::Online)];
        workers[0].last_heartbeat_at = Utc::now() - chrono::Duration::seconds(30);

        handler
            .failures
            .lock()
            .unwrap()
            .insert("10.0.0.1:9000".to_string(), Utc::now());
        assert!(handler.candidates("linux", &workers).is_empty());

        workers[0].last_heartbeat_at = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(handler.candidates("linux", &workers).len(), 1);
    }

    #[tokio::test]
    async fn test_no_candidates_defers() {
        let handler = handler();
        let request = request(1);

        assert!(handler.can_process_work_request(&request));
        let dispatch = handler.process_work_request(&request, &[]).await.unwrap();
        assert_eq!(dispatch, Dispatch::Deferred);
    }

    #[tokio::test]
    async fn test_busy_and_refused_workers_are_passed_over() {
        let (store, id) = store_with(&["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000"]).await;
        let api = Arc::new(FakeWorkers {
            refused: set(&["10.0.0.1:9000"]),
            busy: set(&["10.0.0.2:9000"]),
            ..FakeWorkers::default()
        });
        let handler = StandardHandler::new(store.clone(), api.clone(), 1);
        let workers = store.list_workers().await.unwrap();

        let dispatch = handler.process_work_request(&request(id), &workers).await.unwrap();
        assert_eq!(dispatch, Dispatch::Sent("10.0.0.3:9000".to_string()));
        assert_eq!(
            *api.submitted.lock().unwrap(),
            vec![("10.0.0.3:9000".to_string(), id)]
        );

        let claimed = store.find_action(id).await.unwrap().unwrap();
        assert_eq!(claimed.status_id, INPROGRESS);
        assert_eq!(claimed.assigned_to.as_deref(), Some("10.0.0.3:9000"));

        // the shuffle decides whether the refusing worker was asked at all
        let refused_status = status_of(&store, "10.0.0.1:9000").await;
        assert!(matches!(refused_status, WorkerStatus::Online | WorkerStatus::Inactive));
        assert_eq!(status_of(&store, "10.0.0.2:9000").await, WorkerStatus::Online);
    }

    #[tokio::test]
    async fn test_refused_availability_marks_worker_inactive() {
        let (store, id) = store_with(&["10.0.0.1:9000"]).await;
        let api = Arc::new(FakeWorkers {
            refused: set(&["10.0.0.1:9000"]),
            ..FakeWorkers::default()
        });
        let handler = StandardHandler::new(store.clone(), api, 4);
        let workers = store.list_workers().await.unwrap();

        let dispatch = handler.process_work_request(&request(id), &workers).await.unwrap();
        assert_eq!(dispatch, Dispatch::Deferred);
        assert_eq!(status_of(&store, "10.0.0.1:9000").await, WorkerStatus::Inactive);
        assert_eq!(store.find_action(id).await.unwrap().unwrap().status_id, READY);
    }

    #[tokio::test]
    async fn test_failed_push_releases_claim() {
        let (store, id) = store_with(&["10.0.0.1:9000"]).await;
        let api = Arc::new(FakeWorkers {
            failing_submit: set(&["10.0.0.1:9000"]),
            ..FakeWorkers::default()
        });
        let handler = StandardHandler::new(store.clone(), api.clone(), 4);
        let workers = store.list_workers().await.unwrap();

        let dispatch = handler.process_work_request(&request(id), &workers).await.unwrap();
        assert_eq!(dispatch, Dispatch::Deferred);

        let released = store.find_action(id).await.unwrap().unwrap();
        assert_eq!(released.status_id, READY);
        assert!(released.assigned_to.is_none());
        assert!(released.start_date.is_none());

        // an answering worker is not blamed for a failed job push
        assert_eq!(status_of(&store, "10.0.0.1:9000").await, WorkerStatus::Online);
        assert!(api.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_push_marks_worker_inactive_until_heartbeat() {
        let (store, id) = store_with(&["10.0.0.1:9000"]).await;
        let api = Arc::new(FakeWorkers::default());
        let handler = StandardHandler::new(store.clone(), api, 4);

        // accepted the availability check, then went away before the push
        handler
            .push(&request(id), "10.0.0.1:9000")
            .await
            .unwrap()
            .unwrap();
        store.release_action(id).await.unwrap();

        let gone = StandardHandler::new(
            store.clone(),
            Arc::new(FakeWorkers {
                refused: set(&["10.0.0.1:9000"]),
                ..FakeWorkers::default()
            }),
            4,
        );
        assert!(gone.push(&request(id), "10.0.0.1:9000").await.unwrap().is_none());
        assert_eq!(status_of(&store, "10.0.0.1:9000").await, WorkerStatus::Inactive);
        assert_eq!(store.find_action(id).await.unwrap().unwrap().status_id, READY);

        // the stale heartbeat keeps it out of the candidate list
        let workers = store.list_workers().await.unwrap();
        assert!(gone.candidates("linux", &workers).is_empty());
    }

    #[tokio::test]
    async fn test_push_to_claimed_instance_is_skipped() {
        let (store, id) = store_with(&["10.0.0.1:9000"]).await;
        let api = Arc::new(FakeWorkers::default());
        let handler = StandardHandler::new(store.clone(), api.clone(), 4);
        store.claim_action(id, "10.0.0.9:9000").await.unwrap();

        let dispatch = handler.push(&request(id), "10.0.0.1:9000").await.unwrap();
        assert_eq!(dispatch, Some(Dispatch::AlreadyClaimed));
        assert!(api.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_reports_unlisted_and_unreachable_work() {
        let api = FakeWorkers {
            refused: set(&["10.0.0.2:9000"]),
            failing_listing: set(&["10.0.0.3:9000"]),
            running: HashMap::from([("10.0.0.1:9000".to_string(), vec![1])]),
            ..FakeWorkers::default()
        };
        let handler = StandardHandler::new(Arc::new(MemoryStore::new()), Arc::new(api), 2);

        let mut instances = vec![
            assigned(Some("10.0.0.1:9000")),
            assigned(Some("10.0.0.1:9000")),
            assigned(Some("10.0.0.2:9000")),
            assigned(Some("10.0.0.3:9000")),
        ];
        for (i, instance) in instances.iter_mut().enumerate() {
            instance.id = i as i64 + 1;
        }

        let mut lost: Vec<i64> = handler
            .verify_still_working(&instances, &[])
            .await
            .iter()
            .map(|i| i.id)
            .collect();
        lost.sort();

        // 1 is listed, 4 sits on a worker that answered with an error
        assert_eq!(lost, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_worker() {
        let api = Arc::new(FakeWorkers {
            refused: set(&["10.0.0.2:9000"]),
            ..FakeWorkers::default()
        });
        let handler = StandardHandler::new(Arc::new(MemoryStore::new()), api.clone(), 4);

        assert!(handler.cancel_worker(&assigned(Some("10.0.0.1:9000"))).await);
        assert!(!handler.cancel_worker(&assigned(Some("10.0.0.2:9000"))).await);
        assert!(!handler.cancel_worker(&assigned(None)).await);
        assert_eq!(
            *api.canceled.lock().unwrap(),
            vec![("10.0.0.1:9000".to_string(), 1)]
        );
    }
}
