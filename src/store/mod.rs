//! Release & Deployment Store: transactional create-and-transition for the
//! persisted entities, behind narrow traits so tests can swap in an in-memory
//! implementation instead of a live Postgres database.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EncliiError;
use crate::model::{
    CustomDomain, Deployment, DeploymentStatus, EnvVar, Environment, Project, Release,
    ReleaseStatus, Service,
};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, slug: &str, name: &str, default_branch: &str) -> Result<Project, EncliiError>;
    async fn find_by_slug(&self, slug: &str) -> Result<Option<Project>, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Project>, EncliiError>;
}

#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn create(&self, project_id: Uuid, name: &str, namespace: &str) -> Result<Environment, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Environment>, EncliiError>;
    async fn find_by_project_and_name(&self, project_id: Uuid, name: &str) -> Result<Option<Environment>, EncliiError>;
}

#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn create(&self, service: NewService) -> Result<Service, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Service>, EncliiError>;
    async fn find_by_project_and_name(&self, project_id: Uuid, name: &str) -> Result<Option<Service>, EncliiError>;
    async fn list_auto_deploy(&self) -> Result<Vec<Service>, EncliiError>;
    async fn update_health_rollup(
        &self,
        id: Uuid,
        health: crate::model::ServiceHealth,
        ready_replicas: i32,
    ) -> Result<(), EncliiError>;
}

pub struct NewService {
    pub project_id: Uuid,
    pub name: String,
    pub git_repo: String,
    pub app_path: Option<String>,
    pub build_config: crate::model::BuildConfig,
    pub auto_deploy: bool,
    pub auto_deploy_branch: String,
    pub auto_deploy_env: Option<Uuid>,
    pub port: u16,
    pub desired_replicas: i32,
}

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn create_pending(&self, service_id: Uuid, git_sha: &str, version: &str) -> Result<Release, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Release>, EncliiError>;
    async fn list_by_service(&self, service_id: Uuid) -> Result<Vec<Release>, EncliiError>;
    async fn latest_ready(&self, service_id: Uuid) -> Result<Option<Release>, EncliiError>;

    /// Idempotent-by-target: repeat calls that set the same terminal status are no-ops.
    async fn update_status(
        &self,
        id: Uuid,
        status: ReleaseStatus,
        error_message: Option<&str>,
    ) -> Result<(), EncliiError>;

    /// Sets `image_uri` and marks the release `Ready`. Rejected (Conflict) if
    /// the release is already terminal, enforcing I1/I2 at the store boundary.
    async fn mark_ready(&self, id: Uuid, image_uri: &str, cache_hit: bool) -> Result<(), EncliiError>;

    /// Attaches SBOM data exactly once; a second call is a Conflict, not a silent overwrite.
    async fn attach_sbom(&self, id: Uuid, sbom: &str, format: &str) -> Result<(), EncliiError>;

    /// Attaches a signature exactly once; a second call is a Conflict.
    async fn attach_signature(&self, id: Uuid, signature: &str) -> Result<(), EncliiError>;

    async fn append_build_log(&self, id: Uuid, chunk: &str) -> Result<(), EncliiError>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn create(&self, release_id: Uuid, environment_id: Uuid) -> Result<Deployment, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>, EncliiError>;
    async fn list_non_terminal(&self) -> Result<Vec<Deployment>, EncliiError>;
    async fn find_active_for_service_env(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<Deployment>, EncliiError>;

    /// Most recent `succeeded` deployments for a service/environment, newest
    /// first, for rollback's "immediately previous succeeded deployment"
    /// lookup (SPEC_FULL.md §4.5).
    async fn list_succeeded_for_service_env(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Deployment>, EncliiError>;

    async fn update_status(&self, id: Uuid, status: DeploymentStatus, error_message: Option<&str>) -> Result<(), EncliiError>;
    async fn update_health(&self, id: Uuid, health: crate::model::DeploymentHealth, ready_replicas: i32) -> Result<(), EncliiError>;
    async fn update_controller_metadata(&self, id: Uuid, metadata: &serde_json::Value) -> Result<(), EncliiError>;
}

#[async_trait]
pub trait EnvVarStore: Send + Sync {
    async fn set(
        &self,
        service_id: Uuid,
        environment_id: Option<Uuid>,
        key: &str,
        stored_value: &str,
        is_secret: bool,
    ) -> Result<EnvVar, EncliiError>;
    async fn list(&self, service_id: Uuid, environment_id: Option<Uuid>) -> Result<Vec<EnvVar>, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<EnvVar>, EncliiError>;
    async fn delete(&self, id: Uuid) -> Result<(), EncliiError>;

    /// Resolution order for deploy-time injection: environment-scoped value
    /// beats service-wide value, matching the lookup precedence in SPEC_FULL §4.7.
    async fn resolve_for_deploy(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<EnvVar>, EncliiError>;
}

#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn create_pending(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
        hostname: &str,
        dns_cname: &str,
        verification_token: &str,
    ) -> Result<CustomDomain, EncliiError>;
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<CustomDomain>, EncliiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<CustomDomain>, EncliiError>;
    async fn mark_verified(&self, id: Uuid, verified_at: DateTime<Utc>) -> Result<(), EncliiError>;
    async fn delete(&self, id: Uuid) -> Result<(), EncliiError>;
}
