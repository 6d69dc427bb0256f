//! Tunnel provider: reads and patches the edge tunnel's ingress config and
//! triggers a rolling restart to pick up changes. No teacher precedent for
//! this trait; built the same reqwest/serde_json idiom as `DnsProvider` and
//! the teacher's `auth/oauth.rs` token-endpoint client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EncliiError, ErrorKind};
use crate::settings::TunnelSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRule {
    pub hostname: String,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub ingress: Vec<IngressRule>,
    /// Opaque optimistic-concurrency token returned by the provider; sent
    /// back unchanged on patch so a concurrent writer's update is detected
    /// as a conflict instead of silently overwritten.
    pub version: String,
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn get_config(&self) -> Result<TunnelConfig, EncliiError>;
    async fn patch_config(&self, config: TunnelConfig) -> Result<(), EncliiError>;
    async fn restart(&self) -> Result<(), EncliiError>;
}

pub struct HttpTunnelProvider {
    api_base_url: String,
    api_token: String,
    account_id: String,
    tunnel_id: String,
    http: reqwest::Client,
}

impl HttpTunnelProvider {
    pub fn new(settings: &TunnelSettings) -> Self {
        Self {
            api_base_url: settings.api_base_url.clone(),
            api_token: settings.api_token.clone(),
            account_id: settings.account_id.clone(),
            tunnel_id: settings.tunnel_id.clone(),
            http: reqwest::Client::new(),
        }
    }

    fn config_url(&self) -> String {
        format!("{}/accounts/{}/tunnels/{}/configurations", self.api_base_url, self.account_id, self.tunnel_id)
    }

    fn restart_url(&self) -> String {
        format!("{}/accounts/{}/tunnels/{}/restart", self.api_base_url, self.account_id, self.tunnel_id)
    }
}

#[async_trait]
impl TunnelProvider for HttpTunnelProvider {
    async fn get_config(&self) -> Result<TunnelConfig, EncliiError> {
        let response = self
            .http
            .get(self.config_url())
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("tunnel config fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("tunnel config fetch rejected with status {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("tunnel config decode failed: {e}")))
    }

    async fn patch_config(&self, config: TunnelConfig) -> Result<(), EncliiError> {
        let response = self
            .http
            .put(self.config_url())
            .bearer_auth(&self.api_token)
            .header("If-Match", &config.version)
            .json(&config)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("tunnel config patch failed: {e}")))?;

        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED || response.status() == reqwest::StatusCode::CONFLICT {
            return Err(EncliiError::new(ErrorKind::Conflict, "tunnel config changed concurrently"));
        }
        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("tunnel config patch rejected with status {}", response.status())));
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), EncliiError> {
        let response = self
            .http
            .post(self.restart_url())
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("tunnel restart request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EncliiError::new(ErrorKind::Upstream, format!("tunnel restart rejected with status {}", response.status())));
        }
        Ok(())
    }
}
