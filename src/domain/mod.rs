//! Domain & Tunnel Controller: attaches/detaches custom hostnames and keeps
//! the edge tunnel's ingress config in step with them. See SPEC_FULL.md §4.6.

mod dns;
mod tunnel;

pub use dns::{DnsProvider, HttpDnsProvider, ZoneStatus};
pub use tunnel::{HttpTunnelProvider, IngressRule, TunnelConfig, TunnelProvider};

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{EncliiError, ErrorKind};
use crate::model::CustomDomain;
use crate::store::DomainStore;

/// Retries `op` with capped exponential backoff, the same shape as the
/// reconciler's apply retry loop (§4.5), for the tunnel config's
/// read-modify-write-on-conflict cycle.
async fn retry_with_backoff<T, F, Fut>(mut op: F, max_attempts: u32, mut backoff: Duration) -> Result<T, EncliiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EncliiError>>,
{
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "domain controller operation failed, retrying");
                last_err = Some(e);
                if attempt < max_attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EncliiError::new(ErrorKind::Internal, "retry loop exited without an error")))
}

fn generate_verification_token() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect()
}

pub struct DomainController {
    dns: Arc<dyn DnsProvider>,
    tunnel: Arc<dyn TunnelProvider>,
    domains: Arc<dyn DomainStore>,
    audit: Arc<dyn AuditSink>,
    tunnel_target_suffix: String,
}

impl DomainController {
    pub fn new(dns: Arc<dyn DnsProvider>, tunnel: Arc<dyn TunnelProvider>, domains: Arc<dyn DomainStore>, audit: Arc<dyn AuditSink>, tunnel_target_suffix: String) -> Self {
        Self { dns, tunnel, domains, audit, tunnel_target_suffix }
    }

    /// Add-domain protocol (§4.6): ensure zone, CNAME, tunnel ingress rule,
    /// then persist the pending domain row. DNS and tunnel steps are
    /// idempotent so a retried call never duplicates state.
    pub async fn add_domain(&self, service_id: Uuid, environment_id: Uuid, hostname: &str, internal_service_url: &str) -> Result<CustomDomain, EncliiError> {
        let zone = self.dns.ensure_zone(hostname).await?;
        if zone.created {
            tracing::info!(hostname, nameservers = ?zone.nameservers, "created DNS zone for new domain, awaiting registrar delegation");
        }

        let cname_target = format!("{}.{}", self.tunnel_target_suffix, hostname);
        self.dns.create_cname_record(hostname, &cname_target).await?;

        retry_with_backoff(
            || self.insert_ingress_rule(hostname, internal_service_url),
            5,
            Duration::from_millis(200),
        )
        .await?;

        let verification_token = generate_verification_token();
        let domain = self.domains.create_pending(service_id, environment_id, hostname, &cname_target, &verification_token).await?;

        self.tunnel.restart().await?;
        Ok(domain)
    }

    async fn insert_ingress_rule(&self, hostname: &str, internal_service_url: &str) -> Result<(), EncliiError> {
        let config = self.tunnel.get_config().await?;
        if config.ingress.iter().any(|rule| rule.hostname == hostname) {
            return Ok(()); // already present, nothing to do
        }

        let mut ingress = config.ingress.clone();
        let insert_at = ingress.len().saturating_sub(1); // keep the fallback catch-all last
        ingress.insert(insert_at, IngressRule { hostname: hostname.to_string(), service: internal_service_url.to_string() });

        self.tunnel.patch_config(TunnelConfig { ingress, version: config.version }).await
    }

    /// Remove-domain: inverse order, DNS last, so a partial failure leaves
    /// ingress already torn down rather than dangling.
    pub async fn remove_domain(&self, id: Uuid) -> Result<(), EncliiError> {
        let domain = self.domains.find_by_id(id).await?.ok_or_else(|| EncliiError::not_found(format!("domain {id} not found")))?;

        retry_with_backoff(|| self.remove_ingress_rule(&domain.hostname), 5, Duration::from_millis(200)).await?;
        self.dns.delete_cname_record(&domain.hostname).await?;
        self.domains.delete(id).await?;
        self.tunnel.restart().await?;
        Ok(())
    }

    async fn remove_ingress_rule(&self, hostname: &str) -> Result<(), EncliiError> {
        let config = self.tunnel.get_config().await?;
        let ingress: Vec<IngressRule> = config.ingress.iter().filter(|rule| rule.hostname != hostname).cloned().collect();
        if ingress.len() == config.ingress.len() {
            return Ok(());
        }
        self.tunnel.patch_config(TunnelConfig { ingress, version: config.version }).await
    }

    /// Verifies the domain's TXT challenge and atomically flips it to
    /// verified. Emits an audit event since domain verification changes
    /// which hostnames route to a customer's service.
    pub async fn verify_domain(&self, id: Uuid) -> Result<CustomDomain, EncliiError> {
        let domain = self.domains.find_by_id(id).await?.ok_or_else(|| EncliiError::not_found(format!("domain {id} not found")))?;

        let record_name = format!("_enclii-challenge.{}", domain.hostname);
        let verified = self.dns.verify_txt_record(&record_name, &domain.verification_token).await?;
        if !verified {
            return Err(EncliiError::new(ErrorKind::Validation, "TXT verification record not found or mismatched"));
        }

        let now = chrono::Utc::now();
        self.domains.mark_verified(id, now).await?;
        self.audit
            .record(AuditEvent::new("domain.verify", "custom_domain", id).with_metadata(serde_json::json!({ "hostname": domain.hostname })))
            .await;

        self.domains.find_by_id(id).await?.ok_or_else(|| EncliiError::not_found(format!("domain {id} not found")))
    }

    /// Re-applies every known domain's ingress rule so config pushed
    /// out-of-band by the edge provider drifts back in line. Invoked by the
    /// scheduler's periodic tunnel drift check.
    pub async fn reconcile_drift(&self, hostname: &str, internal_service_url: &str) -> Result<(), EncliiError> {
        retry_with_backoff(|| self.insert_ingress_rule(hostname, internal_service_url), 5, Duration::from_millis(200)).await
    }
}
