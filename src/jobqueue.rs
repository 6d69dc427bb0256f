//! Job queue client: enqueues a build job on the out-of-scope worker pool.
//! See SPEC_FULL.md §6's `/internal/enqueue` contract, which drives this
//! trait's argument/response shape. A new narrow trait — no teacher
//! precedent — built the same way as the other swap-point traits
//! (`RegistryProvider`, `ObjectStore`): one production `reqwest` client and
//! nothing else wired in by default.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EncliiError, ErrorKind};
use crate::model::BuildStrategy;

#[derive(Debug, Clone, Serialize)]
pub struct BuildConfigPayload {
    #[serde(rename = "type")]
    pub strategy: BuildStrategy,
    pub dockerfile: Option<String>,
    pub build_args: HashMap<String, String>,
}

impl From<&crate::model::BuildConfig> for BuildConfigPayload {
    fn from(config: &crate::model::BuildConfig) -> Self {
        Self { strategy: config.strategy, dockerfile: config.dockerfile.clone(), build_args: config.build_args.clone() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueRequest {
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    pub git_repo: String,
    pub git_sha: String,
    pub git_branch: String,
    pub build_config: BuildConfigPayload,
    pub callback_url: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub position: u32,
    pub estimated_start: Option<String>,
}

#[async_trait]
pub trait JobQueueClient: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResponse, EncliiError>;
    async fn cancel(&self, job_id: &str) -> Result<(), EncliiError>;
}

pub struct HttpJobQueueClient {
    base_url: String,
    bearer_token: String,
    http: reqwest::Client,
}

impl HttpJobQueueClient {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), bearer_token: bearer_token.into(), http: reqwest::Client::new() }
    }
}

#[async_trait]
impl JobQueueClient for HttpJobQueueClient {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResponse, EncliiError> {
        let url = format!("{}/internal/enqueue", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("enqueue request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("enqueue rejected with status {}", response.status())));
        }

        response
            .json::<EnqueueResponse>()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("enqueue response decode failed: {e}")))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), EncliiError> {
        let url = format!("{}/internal/jobs/{job_id}/cancel", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("cancel request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("cancel rejected with status {}", response.status())));
        }
        Ok(())
    }
}
