//! Webhook Ingest: validates an inbound VCS push, resolves the target
//! auto-deploy service, and enqueues a build job. See SPEC_FULL.md §4.8.
//! This module validates and enqueues only — the HTTP route that receives
//! the POST body is the out-of-scope REST surface.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{EncliiError, ErrorKind};
use crate::jobqueue::{BuildConfigPayload, EnqueueRequest, JobQueueClient};
use crate::model::Service;
use crate::settings::WebhookSettings;
use crate::store::{ReleaseStore, ServiceStore};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct PushEvent {
    pub git_repo: String,
    pub git_branch: String,
    pub git_sha: String,
}

pub enum IngestOutcome {
    /// Valid signature, matching auto-deploy service found, build enqueued.
    Enqueued { service_id: Uuid, release_id: Uuid, job_id: String },
    /// Valid signature but no service subscribes to this repo/branch. The
    /// caller still responds 202, to avoid leaking which repos are known.
    NoMatchingService,
    /// In-flight build for this (service, sha) already exists; treated as
    /// success without creating a second release.
    Coalesced { service_id: Uuid },
}

fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    let Ok(provided) = hex_decode(signature_hex) else { return false };
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected.as_slice()).into()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ())).collect()
}

pub struct WebhookIngest {
    services: Arc<dyn ServiceStore>,
    releases: Arc<dyn ReleaseStore>,
    job_queue: Arc<dyn JobQueueClient>,
    settings: WebhookSettings,
    in_flight: moka::future::Cache<(Uuid, String), ()>,
    callback_url: String,
}

impl WebhookIngest {
    pub fn new(services: Arc<dyn ServiceStore>, releases: Arc<dyn ReleaseStore>, job_queue: Arc<dyn JobQueueClient>, settings: WebhookSettings, callback_url: String) -> Self {
        let in_flight = moka::future::Cache::builder().time_to_live(Duration::from_secs(300)).build();
        Self { services, releases, job_queue, settings, in_flight, callback_url }
    }

    /// Validates against the current secret, falling back to the previous
    /// one until its grace window expires — the same rotation window shape
    /// as `WebhookSettings::previous_secret_expires_in_secs`.
    fn signature_matches(&self, body: &[u8], signature_hex: &str) -> bool {
        if verify_signature(&self.settings.secret, body, signature_hex) {
            return true;
        }
        if let Some(previous) = &self.settings.previous_secret {
            return verify_signature(previous, body, signature_hex);
        }
        false
    }

    fn matching_service(services: &[Service], event: &PushEvent) -> Option<Service> {
        services.iter().find(|s| s.git_repo == event.git_repo && s.auto_deploy_branch == event.git_branch).cloned()
    }

    pub async fn ingest(&self, body: &[u8], signature_hex: &str, event: PushEvent) -> Result<IngestOutcome, EncliiError> {
        if !self.signature_matches(body, signature_hex) {
            return Err(EncliiError::new(ErrorKind::Unauthorized, "webhook signature verification failed"));
        }

        let candidates = self.services.list_auto_deploy().await?;
        let Some(service) = Self::matching_service(&candidates, &event) else {
            return Ok(IngestOutcome::NoMatchingService);
        };

        let dedupe_key = (service.id, event.git_sha.clone());
        if self.in_flight.get(&dedupe_key).await.is_some() {
            return Ok(IngestOutcome::Coalesced { service_id: service.id });
        }
        self.in_flight.insert(dedupe_key, ()).await;

        let release = self.releases.create_pending(service.id, &event.git_sha, &event.git_sha[..7.min(event.git_sha.len())]).await?;

        let request = EnqueueRequest {
            release_id: release.id,
            service_id: service.id,
            project_id: service.project_id,
            git_repo: event.git_repo,
            git_sha: event.git_sha,
            git_branch: event.git_branch,
            build_config: BuildConfigPayload::from(&service.build_config.0),
            callback_url: self.callback_url.clone(),
            priority: 0,
        };

        let response = self.job_queue.enqueue(request).await?;
        Ok(IngestOutcome::Enqueued { service_id: service.id, release_id: release.id, job_id: response.job_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn signature_verification_accepts_matching_hmac() {
        let secret = "shh";
        let body = b"payload";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex_encode(&mac.finalize().into_bytes());
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn signature_verification_rejects_tampered_body() {
        let secret = "shh";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"original");
        let signature = hex_encode(&mac.finalize().into_bytes());
        assert!(!verify_signature(secret, b"tampered", &signature));
    }
}
