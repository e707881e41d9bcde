//! ECS handler
//!
//! Owns `ecs://<task-definition>` grains. A `run-task` input is built from the
//! configured defaults deep-merged with the per-task-definition override, the
//! standard environment is injected into every container override, and the
//! launched task ARN is recorded as `--ecs--<taskArn>`.

use async_trait::async_trait;
use keel_core::domain::instance::ActionInstance;
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::Worker;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use super::{Dispatch, HandlerError, QueueHandler, injected_environment};
use crate::repository::Store;

const PREFIX: &str = "--ecs--";

#[derive(Debug, Error)]
pub enum EcsError {
    #[error("aws cli failed: {0}")]
    Cli(String),

    #[error("aws cli timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected aws cli output: {0}")]
    Output(String),
}

/// Task state as reported by `describe-tasks`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running(String),
    Stopped,
    Missing,
}

#[async_trait]
pub trait EcsApi: Send + Sync {
    /// Launches tasks from a `run-task` input, returning their ARNs
    async fn run_task(&self, input: &Value) -> Result<Vec<String>, EcsError>;

    async fn describe_tasks(
        &self,
        cluster: Option<&str>,
        arns: &[String],
    ) -> Result<HashMap<String, TaskState>, EcsError>;

    async fn stop_task(&self, cluster: Option<&str>, arn: &str) -> Result<(), EcsError>;
}

/// `EcsApi` over the `aws` command line
pub struct AwsCliEcs {
    binary: String,
    timeout: Duration,
}

impl AwsCliEcs {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "aws".to_string(),
            timeout,
        }
    }

    async fn call(&self, args: &[String]) -> Result<Value, EcsError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("ecs")
                .args(args)
                .args(["--output", "json"])
                .output(),
        )
        .await
        .map_err(|_| EcsError::Timeout(self.timeout))?
        .map_err(|e| EcsError::Cli(e.to_string()))?;

        if !output.status.success() {
            return Err(EcsError::Cli(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| EcsError::Output(e.to_string()))
    }

    fn cluster_args(cluster: Option<&str>) -> Vec<String> {
        cluster
            .map(|c| vec!["--cluster".to_string(), c.to_string()])
            .unwrap_or_default()
    }
}

#[async_trait]
impl EcsApi for AwsCliEcs {
    async fn run_task(&self, input: &Value) -> Result<Vec<String>, EcsError> {
        let response = self
            .call(&[
                "run-task".to_string(),
                "--cli-input-json".to_string(),
                input.to_string(),
            ])
            .await?;

        if let Some(failures) = response["failures"].as_array().filter(|f| !f.is_empty()) {
            return Err(EcsError::Cli(Value::Array(failures.clone()).to_string()));
        }

        Ok(response["tasks"]
            .as_array()
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(|t| t["taskArn"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe_tasks(
        &self,
        cluster: Option<&str>,
        arns: &[String],
    ) -> Result<HashMap<String, TaskState>, EcsError> {
        let mut args = vec!["describe-tasks".to_string()];
        args.extend(Self::cluster_args(cluster));
        args.push("--tasks".to_string());
        args.extend(arns.iter().cloned());

        let response = self.call(&args).await?;
        let mut states = HashMap::new();

        for task in response["tasks"].as_array().into_iter().flatten() {
            let (Some(arn), Some(status)) = (task["taskArn"].as_str(), task["lastStatus"].as_str())
            else {
                continue;
            };
            let state = if status == "STOPPED" {
                TaskState::Stopped
            } else {
                TaskState::Running(status.to_string())
            };
            states.insert(arn.to_string(), state);
        }

        for failure in response["failures"].as_array().into_iter().flatten() {
            if failure["reason"].as_str() == Some("MISSING") {
                if let Some(arn) = failure["arn"].as_str() {
                    states.insert(arn.to_string(), TaskState::Missing);
                }
            }
        }

        Ok(states)
    }

    async fn stop_task(&self, cluster: Option<&str>, arn: &str) -> Result<(), EcsError> {
        let mut args = vec!["stop-task".to_string()];
        args.extend(Self::cluster_args(cluster));
        args.extend(["--task".to_string(), arn.to_string()]);
        args.extend(["--reason".to_string(), "Canceled by keel".to_string()]);

        self.call(&args).await.map(|_| ())
    }
}

/// `run-task` input defaults plus overrides keyed by task definition
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EcsConfig {
    #[serde(default)]
    pub defaults: Value,
    #[serde(default)]
    pub overrides: HashMap<String, Value>,
    /// Container that receives the environment when the input names none.
    /// Defaults to the task-definition family.
    #[serde(default)]
    pub container_name: Option<String>,
}

impl EcsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn cluster(&self) -> Option<&str> {
        self.defaults["cluster"].as_str()
    }
}

/// Recursively merges `patch` into `base`; objects merge, everything else replaces
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                deep_merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

pub struct EcsHandler {
    store: Arc<dyn Store>,
    api: Arc<dyn EcsApi>,
    config: EcsConfig,
    master_url: String,
}

impl EcsHandler {
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn EcsApi>,
        config: EcsConfig,
        master_url: String,
    ) -> Self {
        Self {
            store,
            api,
            config,
            master_url,
        }
    }

    /// Builds the `run-task` input for a request
    fn task_input(&self, request: &WorkRequest) -> Value {
        let task_definition = request.grain().target;

        let mut input = if self.config.defaults.is_object() {
            self.config.defaults.clone()
        } else {
            json!({})
        };
        if let Some(patch) = self.config.overrides.get(task_definition) {
            deep_merge(&mut input, patch);
        }
        input["taskDefinition"] = json!(task_definition);

        let environment: Vec<Value> = injected_environment(request, &self.master_url)
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        if !input["overrides"].is_object() {
            input["overrides"] = json!({});
        }
        let named = input["overrides"]["containerOverrides"]
            .as_array()
            .is_some_and(|containers| !containers.is_empty());
        if !named {
            let name = self
                .config
                .container_name
                .clone()
                .unwrap_or_else(|| family(task_definition).to_string());
            input["overrides"]["containerOverrides"] = json!([{ "name": name }]);
        }

        if let Some(containers) = input
            .pointer_mut("/overrides/containerOverrides")
            .and_then(Value::as_array_mut)
        {
            for container in containers {
                match container["environment"].as_array_mut() {
                    Some(existing) => existing.extend(environment.iter().cloned()),
                    None => container["environment"] = Value::Array(environment.clone()),
                }
            }
        }

        input
    }
}

/// `build` for `build:3` or `arn:aws:ecs:...:task-definition/build:3`
fn family(task_definition: &str) -> &str {
    let name = task_definition
        .rsplit_once('/')
        .map_or(task_definition, |(_, name)| name);
    name.split(':').next().unwrap_or(name)
}

fn task_arn(instance: &ActionInstance) -> Option<&str> {
    instance
        .assigned_to
        .as_deref()
        .and_then(|a| a.strip_prefix(PREFIX))
        .filter(|arn| !arn.is_empty())
}

#[async_trait]
impl QueueHandler for EcsHandler {
    fn name(&self) -> &'static str {
        "ecs"
    }

    fn can_process_work_request(&self, request: &WorkRequest) -> bool {
        request.grain().is("ecs")
    }

    async fn process_work_request(
        &self,
        request: &WorkRequest,
        _workers: &[Worker],
    ) -> Result<Dispatch, HandlerError> {
        if !self
            .store
            .claim_action(request.action_instance_id, PREFIX)
            .await?
        {
            return Ok(Dispatch::AlreadyClaimed);
        }

        let arns = self
            .api
            .run_task(&self.task_input(request))
            .await
            .map_err(|e| HandlerError::Rejected(format!("run-task failed: {}", e)))?;

        let Some(arn) = arns.first() else {
            return Err(HandlerError::Rejected(format!(
                "run-task for {} returned no tasks",
                request.grain
            )));
        };

        let assigned_to = format!("{}{}", PREFIX, arn);
        self.store
            .update_assignment(request.action_instance_id, &assigned_to)
            .await?;

        tracing::info!(
            "Launched ECS task {} for action-instance {}",
            arn,
            request.action_instance_id
        );
        Ok(Dispatch::Sent(assigned_to))
    }

    fn can_process_action_instance(&self, instance: &ActionInstance) -> bool {
        instance
            .assigned_to
            .as_deref()
            .is_some_and(|a| a.starts_with(PREFIX))
    }

    async fn verify_still_working(
        &self,
        instances: &[ActionInstance],
        _workers: &[Worker],
    ) -> Vec<ActionInstance> {
        let mut lost: Vec<ActionInstance> = instances
            .iter()
            .filter(|i| task_arn(i).is_none())
            .cloned()
            .collect();

        let arns: Vec<String> = instances
            .iter()
            .filter_map(task_arn)
            .map(str::to_string)
            .collect();
        if arns.is_empty() {
            return lost;
        }

        match self.api.describe_tasks(self.config.cluster(), &arns).await {
            Ok(states) => lost.extend(
                instances
                    .iter()
                    .filter(|i| {
                        task_arn(i).is_some_and(|arn| {
                            matches!(
                                states.get(arn),
                                Some(TaskState::Stopped | TaskState::Missing)
                            )
                        })
                    })
                    .cloned(),
            ),
            Err(e) => {
                tracing::warn!("describe-tasks failed, assuming tasks still running: {}", e);
            }
        }

        lost
    }

    async fn cancel_worker(&self, instance: &ActionInstance) -> bool {
        let Some(arn) = task_arn(instance) else {
            return false;
        };

        match self.api.stop_task(self.config.cluster(), arn).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to stop ECS task {}: {}", arn, e);
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
    use chrono::Utc;
    use keel_core::domain::status::{INPROGRESS, StatusCatalog};
    use keel_core::domain::work::Slice;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEcs {
        launched: Mutex<Vec<Value>>,
        arns: Vec<String>,
        states: HashMap<String, TaskState>,
        fail_describe: bool,
    }

    #[async_trait]
    impl EcsApi for FakeEcs {
        async fn run_task(&self, input: &Value) -> Result<Vec<String>, EcsError> {
            self.launched.lock().unwrap().push(input.clone());
            Ok(self.arns.clone())
        }

        async fn describe_tasks(
            &self,
            _cluster: Option<&str>,
            _arns: &[String],
        ) -> Result<HashMap<String, TaskState>, EcsError> {
            if self.fail_describe {
                return Err(EcsError::Timeout(Duration::from_secs(1)));
            }
            Ok(self.states.clone())
        }

        async fn stop_task(&self, _cluster: Option<&str>, _arn: &str) -> Result<(), EcsError> {
            Ok(())
        }
    }

    fn config() -> EcsConfig {
        EcsConfig {
            defaults: json!({
                "cluster": "ci",
                "launchType": "FARGATE",
                "overrides": { "containerOverrides": [{ "name": "main" }] }
            }),
            overrides: HashMap::from([(
                "build:3".to_string(),
                json!({ "launchType": "EC2", "count": 1 }),
            )]),
            container_name: None,
        }
    }

    fn request(id: i64) -> WorkRequest {
        WorkRequest {
            action_instance_id: id,
            pipeline_instance_id: 1,
            workflow_instance_id: 1,
            action_id: 1,
            cmd: "make".to_string(),
            executable: "sh".to_string(),
            args: vec![],
            grain: "ecs://build:3".to_string(),
            slice: Slice::SINGLE,
            order: 1,
            priority: 0,
            pipeline_created: Utc::now(),
            environment: BTreeMap::from([("BRANCH".to_string(), "main".to_string())]),
        }
    }

    fn instance(id: i64, assigned_to: &str) -> ActionInstance {
        ActionInstance {
            id,
            workflow_instance_id: 1,
            pipeline_instance_id: 1,
            action_id: 1,
            order: 1,
            status_id: INPROGRESS,
            slice: Slice::SINGLE,
            assigned_to: Some(assigned_to.to_string()),
            start_date: None,
            end_date: None,
            manual: false,
            callback_required: true,
            output: None,
        }
    }

    #[test]
    fn test_deep_merge() {
        let mut base = json!({ "a": { "b": 1, "c": 2 }, "d": [1] });
        deep_merge(&mut base, &json!({ "a": { "c": 3 }, "d": [2], "e": true }));
        assert_eq!(base, json!({ "a": { "b": 1, "c": 3 }, "d": [2], "e": true }));
    }

    #[test]
    fn test_task_input_merges_and_injects_environment() {
        let handler = EcsHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeEcs::default()),
            config(),
            "http://master:8080".to_string(),
        );

        let input = handler.task_input(&request(42));
        assert_eq!(input["taskDefinition"], "build:3");
        assert_eq!(input["launchType"], "EC2");
        assert_eq!(input["cluster"], "ci");

        let env = input["overrides"]["containerOverrides"][0]["environment"]
            .as_array()
            .unwrap();
        assert_eq!(env[0], json!({ "name": "KEEL_ACTION_INSTANCE_ID", "value": "42" }));
        assert!(env.contains(&json!({ "name": "BRANCH", "value": "main" })));
    }

    #[test]
    fn test_environment_injected_without_container_overrides() {
        let bare = EcsConfig {
            defaults: json!({ "cluster": "ci" }),
            ..EcsConfig::default()
        };
        let handler = EcsHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeEcs::default()),
            bare.clone(),
            "http://master:8080".to_string(),
        );

        let input = handler.task_input(&request(42));
        let containers = input["overrides"]["containerOverrides"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"], "build");
        assert!(containers[0]["environment"]
            .as_array()
            .unwrap()
            .contains(&json!({ "name": "KEEL_ACTION_INSTANCE_ID", "value": "42" })));

        let named = EcsHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeEcs::default()),
            EcsConfig {
                container_name: Some("app".to_string()),
                ..bare
            },
            "http://master:8080".to_string(),
        );
        let input = named.task_input(&request(42));
        assert_eq!(input["overrides"]["containerOverrides"][0]["name"], "app");
    }

    #[test]
    fn test_family_of_task_definition() {
        assert_eq!(family("build:3"), "build");
        assert_eq!(family("build"), "build");
        assert_eq!(family("arn:aws:ecs:eu-west-1:123:task-definition/build:3"), "build");
    }

    #[tokio::test]
    async fn test_launch_records_task_arn() {
        let template = pipeline(1, vec![stage(1, 1, vec![workflow(10, 1, vec![action(100, 1, 1)])])]);
        let store = Arc::new(MemoryStore::with_templates(vec![template.clone()]));
        let mut tree = launch_tree(&StatusCatalog::builtin(), &template, 0, BTreeMap::new()).unwrap();
        store.save_tree(&mut tree).await.unwrap();
        let id = tree.actions().next().unwrap().id;

        let api = Arc::new(FakeEcs {
            arns: vec!["arn:aws:ecs:task/abc".to_string()],
            ..FakeEcs::default()
        });
        let handler = EcsHandler::new(store.clone(), api.clone(), config(), "http://m".to_string());

        let dispatch = handler.process_work_request(&request(id), &[]).await.unwrap();
        assert_eq!(dispatch, Dispatch::Sent("--ecs--arn:aws:ecs:task/abc".to_string()));

        let stored = store.find_action(id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some("--ecs--arn:aws:ecs:task/abc"));
        assert_eq!(api.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_task_list_is_rejected() {
        let template = pipeline(1, vec![stage(1, 1, vec![workflow(10, 1, vec![action(100, 1, 1)])])]);
        let store = Arc::new(MemoryStore::with_templates(vec![template.clone()]));
        let mut tree = launch_tree(&StatusCatalog::builtin(), &template, 0, BTreeMap::new()).unwrap();
        store.save_tree(&mut tree).await.unwrap();
        let id = tree.actions().next().unwrap().id;

        let handler = EcsHandler::new(
            store,
            Arc::new(FakeEcs::default()),
            config(),
            "http://m".to_string(),
        );

        let err = handler.process_work_request(&request(id), &[]).await.unwrap_err();
        assert!(err.is_hard_failure());
    }

    #[tokio::test]
    async fn test_verify_reports_stopped_and_missing_tasks() {
        let api = FakeEcs {
            states: HashMap::from([
                ("arn-run".to_string(), TaskState::Running("RUNNING".to_string())),
                ("arn-stop".to_string(), TaskState::Stopped),
                ("arn-gone".to_string(), TaskState::Missing),
            ]),
            ..FakeEcs::default()
        };
        let handler = EcsHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(api),
            config(),
            "http://m".to_string(),
        );

        let instances = vec![
            instance(1, "--ecs--arn-run"),
            instance(2, "--ecs--arn-stop"),
            instance(3, "--ecs--arn-gone"),
            instance(4, "--ecs--"),
        ];
        let mut lost: Vec<i64> = handler
            .verify_still_working(&instances, &[])
            .await
            .iter()
            .map(|i| i.id)
            .collect();
        lost.sort();
        assert_eq!(lost, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_verify_error_assumes_running() {
        let handler = EcsHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeEcs {
                fail_describe: true,
                ..FakeEcs::default()
            }),
            config(),
            "http://m".to_string(),
        );

        let lost = handler
            .verify_still_working(&[instance(1, "--ecs--arn-run")], &[])
            .await;
        assert!(lost.is_empty());
    }
}
