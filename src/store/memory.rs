//! In-memory store implementations used by engine unit tests, per the "narrow
//! contract, in-memory variant" design note.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EncliiError;
use crate::model::{
    CustomDomain, Deployment, DeploymentHealth, DeploymentStatus, DomainStatus, EnvVar,
    Release, ReleaseStatus, Service, ServiceHealth,
};
use crate::statemachine;

use super::{DeploymentStore, DomainStore, EnvVarStore, NewService, ReleaseStore, ServiceStore};

#[derive(Default)]
pub struct InMemoryServiceStore {
    services: Mutex<HashMap<Uuid, Service>>,
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn create(&self, new: NewService) -> Result<Service, EncliiError> {
        let service = Service {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            name: new.name,
            git_repo: new.git_repo,
            app_path: new.app_path,
            build_config: sqlx::types::Json(new.build_config),
            auto_deploy: new.auto_deploy,
            auto_deploy_branch: new.auto_deploy_branch,
            auto_deploy_env: new.auto_deploy_env,
            port: new.port,
            desired_replicas: new.desired_replicas,
            ready_replicas: 0,
            health: ServiceHealth::Unknown,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.services.lock().unwrap().insert(service.id, service.clone());
        Ok(service)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Service>, EncliiError> {
        Ok(self.services.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_project_and_name(&self, project_id: Uuid, name: &str) -> Result<Option<Service>, EncliiError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .values()
            .find(|s| s.project_id == project_id && s.name == name)
            .cloned())
    }

    async fn list_auto_deploy(&self) -> Result<Vec<Service>, EncliiError> {
        Ok(self.services.lock().unwrap().values().filter(|s| s.auto_deploy).cloned().collect())
    }

    async fn update_health_rollup(&self, id: Uuid, health: ServiceHealth, ready_replicas: i32) -> Result<(), EncliiError> {
        let mut services = self.services.lock().unwrap();
        let service = services.get_mut(&id).ok_or_else(|| EncliiError::not_found("service not found"))?;
        service.health = health;
        service.ready_replicas = ready_replicas;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryReleaseStore {
    releases: Mutex<HashMap<Uuid, Release>>,
}

#[async_trait]
impl ReleaseStore for InMemoryReleaseStore {
    async fn create_pending(&self, service_id: Uuid, git_sha: &str, version: &str) -> Result<Release, EncliiError> {
        let release = Release {
            id: Uuid::new_v4(),
            service_id,
            version: version.to_string(),
            git_sha: git_sha.to_string(),
            image_uri: None,
            status: ReleaseStatus::Pending,
            error_message: None,
            sbom: None,
            sbom_format: None,
            signature: None,
            cache_hit: false,
            build_log: None,
            created_at: Utc::now(),
        };
        self.releases.lock().unwrap().insert(release.id, release.clone());
        Ok(release)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Release>, EncliiError> {
        Ok(self.releases.lock().unwrap().get(&id).cloned())
    }

    async fn list_by_service(&self, service_id: Uuid) -> Result<Vec<Release>, EncliiError> {
        let mut releases: Vec<Release> = self
            .releases
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(releases)
    }

    async fn latest_ready(&self, service_id: Uuid) -> Result<Option<Release>, EncliiError> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.service_id == service_id && r.status == ReleaseStatus::Ready)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn update_status(&self, id: Uuid, status: ReleaseStatus, error_message: Option<&str>) -> Result<(), EncliiError> {
        let mut releases = self.releases.lock().unwrap();
        let release = releases.get_mut(&id).ok_or_else(|| EncliiError::not_found("release not found"))?;
        if release.status == status {
            return Ok(());
        }
        if !statemachine::release_valid_transition(release.status, status) {
            return Err(EncliiError::conflict("invalid release transition"));
        }
        release.status = status;
        release.error_message = error_message.map(|s| s.to_string());
        Ok(())
    }

    async fn mark_ready(&self, id: Uuid, image_uri: &str, cache_hit: bool) -> Result<(), EncliiError> {
        let mut releases = self.releases.lock().unwrap();
        let release = releases.get_mut(&id).ok_or_else(|| EncliiError::not_found("release not found"))?;
        if statemachine::release_is_terminal(release.status) {
            return Err(EncliiError::conflict("release is already terminal"));
        }
        release.status = ReleaseStatus::Ready;
        release.image_uri = Some(image_uri.to_string());
        release.cache_hit = cache_hit;
        Ok(())
    }

    async fn attach_sbom(&self, id: Uuid, sbom: &str, format: &str) -> Result<(), EncliiError> {
        let mut releases = self.releases.lock().unwrap();
        let release = releases.get_mut(&id).ok_or_else(|| EncliiError::not_found("release not found"))?;
        if release.sbom.is_some() {
            return Err(EncliiError::conflict("SBOM already attached"));
        }
        release.sbom = Some(sbom.to_string());
        release.sbom_format = Some(format.to_string());
        Ok(())
    }

    async fn attach_signature(&self, id: Uuid, signature: &str) -> Result<(), EncliiError> {
        let mut releases = self.releases.lock().unwrap();
        let release = releases.get_mut(&id).ok_or_else(|| EncliiError::not_found("release not found"))?;
        if release.signature.is_some() {
            return Err(EncliiError::conflict("signature already attached"));
        }
        release.signature = Some(signature.to_string());
        Ok(())
    }

    async fn append_build_log(&self, id: Uuid, chunk: &str) -> Result<(), EncliiError> {
        let mut releases = self.releases.lock().unwrap();
        let release = releases.get_mut(&id).ok_or_else(|| EncliiError::not_found("release not found"))?;
        release.build_log.get_or_insert_with(String::new).push_str(chunk);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeploymentStore {
    deployments: Mutex<HashMap<Uuid, Deployment>>,
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn create(&self, release_id: Uuid, environment_id: Uuid) -> Result<Deployment, EncliiError> {
        let deployment = Deployment {
            id: Uuid::new_v4(),
            release_id,
            environment_id,
            status: DeploymentStatus::Pending,
            health: DeploymentHealth::Unknown,
            replicas: 0,
            controller_metadata: sqlx::types::Json(serde_json::json!({})),
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.deployments.lock().unwrap().insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>, EncliiError> {
        Ok(self.deployments.lock().unwrap().get(&id).cloned())
    }

    async fn list_non_terminal(&self) -> Result<Vec<Deployment>, EncliiError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .values()
            .filter(|d| !statemachine::deployment_is_terminal(d.status))
            .cloned()
            .collect())
    }

    async fn find_active_for_service_env(&self, _service_id: Uuid, environment_id: Uuid) -> Result<Option<Deployment>, EncliiError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.environment_id == environment_id)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn list_succeeded_for_service_env(&self, _service_id: Uuid, environment_id: Uuid, limit: i64) -> Result<Vec<Deployment>, EncliiError> {
        // Like `find_active_for_service_env` above, this test double has no
        // release table to join against, so it scopes by environment only.
        let mut matching: Vec<Deployment> = self
            .deployments
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.environment_id == environment_id && d.status == DeploymentStatus::Succeeded)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn update_status(&self, id: Uuid, status: DeploymentStatus, error_message: Option<&str>) -> Result<(), EncliiError> {
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments.get_mut(&id).ok_or_else(|| EncliiError::not_found("deployment not found"))?;
        if deployment.status == status {
            return Ok(());
        }
        if !statemachine::deployment_valid_transition(deployment.status, status) {
            return Err(EncliiError::conflict("invalid deployment transition"));
        }
        deployment.status = status;
        deployment.error_message = error_message.map(|s| s.to_string());
        if statemachine::deployment_is_terminal(status) {
            deployment.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_health(&self, id: Uuid, health: DeploymentHealth, ready_replicas: i32) -> Result<(), EncliiError> {
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments.get_mut(&id).ok_or_else(|| EncliiError::not_found("deployment not found"))?;
        deployment.health = health;
        deployment.replicas = ready_replicas;
        Ok(())
    }

    async fn update_controller_metadata(&self, id: Uuid, metadata: &serde_json::Value) -> Result<(), EncliiError> {
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments.get_mut(&id).ok_or_else(|| EncliiError::not_found("deployment not found"))?;
        deployment.controller_metadata = sqlx::types::Json(metadata.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEnvVarStore {
    vars: Mutex<HashMap<Uuid, EnvVar>>,
}

#[async_trait]
impl EnvVarStore for InMemoryEnvVarStore {
    async fn set(&self, service_id: Uuid, environment_id: Option<Uuid>, key: &str, stored_value: &str, is_secret: bool) -> Result<EnvVar, EncliiError> {
        let mut vars = self.vars.lock().unwrap();
        if let Some(existing) = vars.values_mut().find(|v| v.service_id == service_id && v.environment_id == environment_id && v.key == key) {
            existing.value = stored_value.to_string();
            existing.is_secret = is_secret;
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        let env_var = EnvVar {
            id: Uuid::new_v4(),
            service_id,
            environment_id,
            key: key.to_string(),
            value: stored_value.to_string(),
            is_secret,
            updated_at: Utc::now(),
        };
        vars.insert(env_var.id, env_var.clone());
        Ok(env_var)
    }

    async fn list(&self, service_id: Uuid, environment_id: Option<Uuid>) -> Result<Vec<EnvVar>, EncliiError> {
        Ok(self
            .vars
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.service_id == service_id && (v.environment_id == environment_id || v.environment_id.is_none()))
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EnvVar>, EncliiError> {
        Ok(self.vars.lock().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), EncliiError> {
        self.vars.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn resolve_for_deploy(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<EnvVar>, EncliiError> {
        let vars = self.vars.lock().unwrap();
        let mut by_key: HashMap<String, EnvVar> = HashMap::new();
        for v in vars.values().filter(|v| v.service_id == service_id) {
            match v.environment_id {
                None => {
                    by_key.entry(v.key.clone()).or_insert_with(|| v.clone());
                }
                Some(env_id) if env_id == environment_id => {
                    by_key.insert(v.key.clone(), v.clone());
                }
                _ => {}
            }
        }
        Ok(by_key.into_values().collect())
    }
}

#[derive(Default)]
pub struct InMemoryDomainStore {
    domains: Mutex<HashMap<Uuid, CustomDomain>>,
}

#[async_trait]
impl DomainStore for InMemoryDomainStore {
    async fn create_pending(&self, service_id: Uuid, environment_id: Uuid, hostname: &str, dns_cname: &str, verification_token: &str) -> Result<CustomDomain, EncliiError> {
        let mut domains = self.domains.lock().unwrap();
        if domains.values().any(|d| d.hostname == hostname) {
            return Err(EncliiError::conflict(format!("hostname '{hostname}' already registered")));
        }
        let domain = CustomDomain {
            id: Uuid::new_v4(),
            service_id,
            environment_id,
            hostname: hostname.to_string(),
            tls_enabled: true,
            tls_issuer: None,
            verified: false,
            verified_at: None,
            verification_token: verification_token.to_string(),
            dns_cname: dns_cname.to_string(),
            status: DomainStatus::Pending,
            created_at: Utc::now(),
        };
        domains.insert(domain.id, domain.clone());
        Ok(domain)
    }

    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<CustomDomain>, EncliiError> {
        Ok(self.domains.lock().unwrap().values().find(|d| d.hostname == hostname).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<CustomDomain>, EncliiError> {
        Ok(self.domains.lock().unwrap().get(&id).cloned())
    }

    async fn mark_verified(&self, id: Uuid, verified_at: DateTime<Utc>) -> Result<(), EncliiError> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains.get_mut(&id).ok_or_else(|| EncliiError::not_found("domain not found"))?;
        domain.verified = true;
        domain.verified_at = Some(verified_at);
        domain.status = DomainStatus::Active;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), EncliiError> {
        self.domains.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_store_rejects_mutation_after_terminal() {
        let store = InMemoryReleaseStore::default();
        let release = store.create_pending(Uuid::new_v4(), "abc1234def5", "v1").await.unwrap();
        store.mark_ready(release.id, "registry/test:v1", false).await.unwrap();
        let err = store.mark_ready(release.id, "registry/test:v2", false).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn release_store_sbom_attaches_once() {
        let store = InMemoryReleaseStore::default();
        let release = store.create_pending(Uuid::new_v4(), "abc1234def5", "v1").await.unwrap();
        store.attach_sbom(release.id, "{}", "spdx").await.unwrap();
        assert!(store.attach_sbom(release.id, "{}", "spdx").await.is_err());
    }

    #[tokio::test]
    async fn env_var_resolution_prefers_environment_scoped_value() {
        let store = InMemoryEnvVarStore::default();
        let service_id = Uuid::new_v4();
        let env_id = Uuid::new_v4();
        store.set(service_id, None, "LOG_LEVEL", "info", false).await.unwrap();
        store.set(service_id, Some(env_id), "LOG_LEVEL", "debug", false).await.unwrap();

        let resolved = store.resolve_for_deploy(service_id, env_id).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].value, "debug");
    }

    #[tokio::test]
    async fn domain_store_rejects_duplicate_hostname() {
        let store = InMemoryDomainStore::default();
        let service_id = Uuid::new_v4();
        let env_id = Uuid::new_v4();
        store.create_pending(service_id, env_id, "links.example.com", "tunnel.cfargotunnel.com", "tok1").await.unwrap();
        let err = store
            .create_pending(service_id, env_id, "links.example.com", "tunnel.cfargotunnel.com", "tok2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }
}
