//! Docker handler
//!
//! Owns `docker://<image>` grains. Each request runs as a detached
//! `docker run --rm` child process labelled with the action-instance id; the
//! dispatch succeeds when the process starts. Containers are not queried for
//! liveness, the executor's completion callback is the only signal.

use async_trait::async_trait;
use keel_core::domain::instance::ActionInstance;
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::Worker;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use super::{Dispatch, HandlerError, QueueHandler};
use crate::repository::Store;

const MARKER: &str = "docker://";
const LABEL: &str = "keel.action_instance_id";

/// Flags applied to every `docker run`. Values may contain placeholders.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub add_hosts: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary() -> String {
    "docker".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            add_hosts: vec![],
            env: vec![],
            volumes: vec![],
            extra_args: vec![],
        }
    }
}

impl DockerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Replaces `(field)` placeholders with values from the request
pub fn substitute(template: &str, request: &WorkRequest, master_url: &str) -> String {
    template
        .replace("(action_instance_id)", &request.action_instance_id.to_string())
        .replace("(pipeline_instance_id)", &request.pipeline_instance_id.to_string())
        .replace("(workflow_instance_id)", &request.workflow_instance_id.to_string())
        .replace("(slice)", &request.slice.to_string())
        .replace("(master_url)", master_url)
        .replace("(grain)", &request.grain)
}

pub struct DockerHandler {
    store: Arc<dyn Store>,
    config: DockerConfig,
    master_url: String,
}

impl DockerHandler {
    pub fn new(store: Arc<dyn Store>, config: DockerConfig, master_url: String) -> Self {
        Self {
            store,
            config,
            master_url,
        }
    }

    /// Arguments of the `docker run` invocation for a request
    fn run_args(&self, request: &WorkRequest) -> Vec<String> {
        let image = request.grain().target.to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--label".to_string(),
            format!("{}={}", LABEL, request.action_instance_id),
        ];

        for host in &self.config.add_hosts {
            args.push("--add-host".to_string());
            args.push(substitute(host, request, &self.master_url));
        }
        for (key, value) in super::injected_environment(request, &self.master_url) {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for env in &self.config.env {
            args.push("--env".to_string());
            args.push(substitute(env, request, &self.master_url));
        }
        for volume in &self.config.volumes {
            args.push("--volume".to_string());
            args.push(substitute(volume, request, &self.master_url));
        }
        args.extend(
            self.config
                .extra_args
                .iter()
                .map(|a| substitute(a, request, &self.master_url)),
        );

        args.push(image);
        args.push(request.executable.clone());
        args.push(request.cmd.clone());
        args.extend(request.args.iter().cloned());
        args
    }
}

#[async_trait]
impl QueueHandler for DockerHandler {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn can_process_work_request(&self, request: &WorkRequest) -> bool {
        request.grain().is("docker")
    }

    async fn process_work_request(
        &self,
        request: &WorkRequest,
        _workers: &[Worker],
    ) -> Result<Dispatch, HandlerError> {
        if !self
            .store
            .claim_action(request.action_instance_id, MARKER)
            .await?
        {
            return Ok(Dispatch::AlreadyClaimed);
        }

        let spawned = Command::new(&self.config.binary)
            .args(self.run_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.store.release_action(request.action_instance_id).await?;
                return Err(HandlerError::Rejected(format!(
                    "failed to start container for action-instance {}: {}",
                    request.action_instance_id, e
                )));
            }
        };

        let id = request.action_instance_id;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!("Container of action-instance {} exited: {}", id, status),
                Err(e) => tracing::warn!("Failed to reap container of action-instance {}: {}", id, e),
            }
        });

        tracing::info!(
            "Started container {} for action-instance {}",
            request.grain().target,
            id
        );
        Ok(Dispatch::Sent(MARKER.to_string()))
    }

    fn can_process_action_instance(&self, instance: &ActionInstance) -> bool {
        instance.assigned_to.as_deref() == Some(MARKER)
    }

    async fn verify_still_working(
        &self,
        _instances: &[ActionInstance],
        _workers: &[Worker],
    ) -> Vec<ActionInstance> {
        Vec::new()
    }

    async fn cancel_worker(&self, instance: &ActionInstance) -> bool {
        let listed = Command::new(&self.config.binary)
            .args(["ps", "-q", "--filter"])
            .arg(format!("label={}={}", LABEL, instance.id))
            .output()
            .await;

        let ids: Vec<String> = match listed {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Ok(output) => {
                tracing::warn!(
                    "docker ps failed for action-instance {}: {}",
                    instance.id,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return false;
            }
            Err(e) => {
                tracing::warn!("Failed to run docker ps: {}", e);
                return false;
            }
        };

        if ids.is_empty() {
            return true;
        }

        match Command::new(&self.config.binary)
            .args(["rm", "-f"])
            .args(&ids)
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::warn!("Failed to remove containers of action-instance {}: {}", instance.id, e);
                false
            }
        }
    }
}
