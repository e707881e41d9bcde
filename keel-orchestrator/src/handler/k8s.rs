//! Kubernetes handler
//!
//! Owns `k8s://<job-template>` grains. The template names a Job manifest in
//! the configured directory; each request becomes one namespaced Job whose
//! name embeds the pipeline-instance and action-instance ids. Running pods are
//! matched back to instances through the `job-name` label.

use async_trait::async_trait;
use keel_core::domain::instance::ActionInstance;
use keel_core::domain::work::WorkRequest;
use keel_core::domain::worker::Worker;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{Dispatch, HandlerError, QueueHandler, injected_environment};
use crate::repository::Store;

const PREFIX: &str = "--k8s--";
const MAX_NAME_LEN: usize = 63;
pub const MANAGED_BY_LABEL: &str = "keel/managed-by";
pub const ACTION_LABEL: &str = "keel/action-instance";

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Kubernetes API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Kubernetes API unreachable: {0}")]
    Transport(String),

    #[error("Invalid job manifest: {0}")]
    Manifest(String),
}

impl From<reqwest::Error> for KubeError {
    fn from(e: reqwest::Error) -> Self {
        KubeError::Transport(e.to_string())
    }
}

/// A pod as far as liveness is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub job_name: Option<String>,
    pub phase: String,
}

impl PodSummary {
    pub fn is_alive(&self) -> bool {
        matches!(self.phase.as_str(), "Pending" | "Running")
    }
}

#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_job(&self, manifest: &Value) -> Result<(), KubeError>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, KubeError>;

    async fn delete_job(&self, name: &str) -> Result<(), KubeError>;

    async fn delete_pods(&self, label_selector: &str) -> Result<(), KubeError>;
}

/// `KubeApi` over the API server's REST interface
pub struct HttpKubeApi {
    client: Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl HttpKubeApi {
    pub fn new(
        base_url: String,
        namespace: String,
        token_file: Option<&Path>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let token = match token_file {
            Some(path) => Some(std::fs::read_to_string(path)?.trim().to_string()),
            None => None,
        };

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, KubeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(KubeError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl KubeApi for HttpKubeApi {
    async fn create_job(&self, manifest: &Value) -> Result<(), KubeError> {
        let url = self.url(&format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace));
        let response = self
            .request(reqwest::Method::POST, url)
            .json(manifest)
            .send()
            .await?;

        Self::check(response).await.map(|_| ())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<PodSummary>, KubeError> {
        let url = self.url(&format!("/api/v1/namespaces/{}/pods", self.namespace));
        let response = self
            .request(reqwest::Method::GET, url)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await?;

        let body: Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KubeError::Transport(e.to_string()))?;

        Ok(body["items"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|pod| PodSummary {
                job_name: pod["metadata"]["labels"]["job-name"]
                    .as_str()
                    .map(str::to_string),
                phase: pod["status"]["phase"].as_str().unwrap_or("Unknown").to_string(),
            })
            .collect())
    }

    async fn delete_job(&self, name: &str) -> Result<(), KubeError> {
        let url = self.url(&format!(
            "/apis/batch/v1/namespaces/{}/jobs/{}",
            self.namespace, name
        ));
        let response = self
            .request(reqwest::Method::DELETE, url)
            .json(&json!({ "propagationPolicy": "Background" }))
            .send()
            .await?;

        Self::check(response).await.map(|_| ())
    }

    async fn delete_pods(&self, label_selector: &str) -> Result<(), KubeError> {
        let url = self.url(&format!("/api/v1/namespaces/{}/pods", self.namespace));
        let response = self
            .request(reqwest::Method::DELETE, url)
            .query(&[("labelSelector", label_selector)])
            .send()
            .await?;

        Self::check(response).await.map(|_| ())
    }
}

/// Cluster-unique job name `<template>-<pipeline>.<action>`, at most 63
/// characters. Only the template part is ever truncated.
pub fn job_name(template: &str, pipeline_instance_id: i64, action_instance_id: i64) -> String {
    let suffix = format!("-{}.{}", pipeline_instance_id, action_instance_id);

    let mut prefix: String = template
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    prefix.truncate(MAX_NAME_LEN.saturating_sub(suffix.len()));

    let prefix = prefix.trim_matches('-');
    let prefix = if prefix.is_empty() { "job" } else { prefix };

    format!("{}{}", prefix, suffix)
}

/// Loads `<dir>/<template>.yaml`, `.yml` or `.json` as a JSON value
pub fn load_manifest(dir: &Path, template: &str) -> Result<Value, KubeError> {
    if template.is_empty() || template.contains(['/', '\\']) || template.contains("..") {
        return Err(KubeError::Manifest(format!(
            "invalid job template name '{}'",
            template
        )));
    }

    let candidates: Vec<PathBuf> = ["yaml", "yml", "json"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", template, ext)))
        .collect();

    let path = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| KubeError::Manifest(format!("no manifest for job template '{}'", template)))?;

    let raw = std::fs::read_to_string(path)
        .map_err(|e| KubeError::Manifest(format!("{}: {}", path.display(), e)))?;

    serde_yaml::from_str(&raw).map_err(|e| KubeError::Manifest(format!("{}: {}", path.display(), e)))
}

pub struct K8sHandler {
    store: Arc<dyn Store>,
    api: Arc<dyn KubeApi>,
    template_dir: PathBuf,
    master_url: String,
}

impl K8sHandler {
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn KubeApi>,
        template_dir: PathBuf,
        master_url: String,
    ) -> Self {
        Self {
            store,
            api,
            template_dir,
            master_url,
        }
    }

    /// Renders the Job for a request from its manifest
    fn job_manifest(&self, request: &WorkRequest, name: &str) -> Result<Value, KubeError> {
        let template = request.grain().target;
        let mut manifest = load_manifest(&self.template_dir, template)?;
        if !manifest.is_object() {
            return Err(KubeError::Manifest(format!(
                "job template '{}' is not a mapping",
                template
            )));
        }

        manifest["apiVersion"] = json!("batch/v1");
        manifest["kind"] = json!("Job");
        manifest["metadata"]["name"] = json!(name);
        manifest["metadata"]["labels"][MANAGED_BY_LABEL] = json!("keel");
        manifest["metadata"]["labels"][ACTION_LABEL] = json!(request.action_instance_id.to_string());

        let environment: Vec<Value> = injected_environment(request, &self.master_url)
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let containers = manifest
            .pointer_mut("/spec/template/spec/containers")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| {
                KubeError::Manifest(format!("job template '{}' has no containers", template))
            })?;

        for container in containers {
            match container["env"].as_array_mut() {
                Some(existing) => existing.extend(environment.iter().cloned()),
                None => container["env"] = Value::Array(environment.clone()),
            }
        }

        Ok(manifest)
    }

    /// Deletes a Job and its pods. A Job that is already gone counts as removed.
    async fn remove_job(&self, job: &str) -> Result<(), KubeError> {
        match self.api.delete_job(job).await {
            Ok(()) => {}
            Err(KubeError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = self.api.delete_pods(&format!("job-name={}", job)).await {
            tracing::debug!("Delete of pods of job {} failed: {}", job, e);
        }
        Ok(())
    }

    fn job_of(instance: &ActionInstance) -> Option<&str> {
        instance
            .assigned_to
            .as_deref()
            .and_then(|a| a.strip_prefix(PREFIX))
            .filter(|name| !name.is_empty())
    }
}

#[async_trait]
impl QueueHandler for K8sHandler {
    fn name(&self) -> &'static str {
        "k8s"
    }

    fn can_process_work_request(&self, request: &WorkRequest) -> bool {
        request.grain().is("k8s")
    }

    async fn process_work_request(
        &self,
        request: &WorkRequest,
        _workers: &[Worker],
    ) -> Result<Dispatch, HandlerError> {
        let name = job_name(
            request.grain().target,
            request.pipeline_instance_id,
            request.action_instance_id,
        );
        let assigned_to = format!("{}{}", PREFIX, name);

        if !self
            .store
            .claim_action(request.action_instance_id, &assigned_to)
            .await?
        {
            return Ok(Dispatch::AlreadyClaimed);
        }

        let manifest = self
            .job_manifest(request, &name)
            .map_err(|e| HandlerError::Rejected(e.to_string()))?;

        match self.api.create_job(&manifest).await {
            Ok(()) => {
                tracing::info!(
                    "Created job {} for action-instance {}",
                    name,
                    request.action_instance_id
                );
                Ok(Dispatch::Sent(assigned_to))
            }
            Err(KubeError::Api { status, message })
                if status == StatusCode::NOT_FOUND.as_u16()
                    || status == StatusCode::UNPROCESSABLE_ENTITY.as_u16() =>
            {
                Err(HandlerError::Rejected(format!(
                    "job {} rejected ({}): {}",
                    name, status, message
                )))
            }
            Err(KubeError::Api { status, message })
                if status == StatusCode::CONFLICT.as_u16()
                    || status == StatusCode::BAD_REQUEST.as_u16() =>
            {
                self.store.release_action(request.action_instance_id).await?;
                Err(HandlerError::ServiceUnavailable(
                    "k8s",
                    format!("job {} ({}): {}", name, status, message),
                ))
            }
            Err(e) => {
                self.store.release_action(request.action_instance_id).await?;
                Err(HandlerError::ShouldSleep("k8s", e.to_string()))
            }
        }
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
        let selector = format!("{}=keel", MANAGED_BY_LABEL);
        let pods = match self.api.list_pods(&selector).await {
            Ok(pods) => pods,
            Err(e) => {
                tracing::warn!("Failed to list pods, assuming jobs still running: {}", e);
                return Vec::new();
            }
        };

        let alive: HashSet<&str> = pods
            .iter()
            .filter(|p| p.is_alive())
            .filter_map(|p| p.job_name.as_deref())
            .collect();

        // job names are deterministic, so a dead Job must be gone before the
        // instance can be dispatched again
        let mut lost = Vec::new();
        for instance in instances {
            match Self::job_of(instance) {
                Some(job) if alive.contains(job) => {}
                Some(job) => match self.remove_job(job).await {
                    Ok(()) => lost.push(instance.clone()),
                    Err(e) => tracing::warn!(
                        "Job {} of action-instance {} has no live pods but could not be removed: {}",
                        job,
                        instance.id,
                        e
                    ),
                },
                None => lost.push(instance.clone()),
            }
        }

        lost
    }

    async fn cancel_worker(&self, instance: &ActionInstance) -> bool {
        let Some(job) = Self::job_of(instance) else {
            return false;
        };

        match self.remove_job(job).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Failed to delete job {} of action-instance {}: {}",
                    job,
                    instance.id,
                    e
                );
                false
            }
        }
    }
}
