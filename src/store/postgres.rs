//! Postgres-backed implementation of the store traits.
//!
//! Deliberately built on the runtime-checked `sqlx::query_as`/`sqlx::query` builders
//! rather than the `query_as!`/`query!` macros: those macros need either a live
//! database connection or a `.sqlx` offline-query cache at compile time, neither of
//! which is available here. See DESIGN.md.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EncliiError, ErrorKind};
use crate::model::{
    CustomDomain, Deployment, DeploymentHealth, DeploymentStatus, EnvVar, Environment, Project,
    Release, ReleaseStatus, Service, ServiceHealth,
};
use crate::statemachine;

use super::{
    DeploymentStore, DomainStore, EnvVarStore, EnvironmentStore, NewService, ProjectStore,
    ReleaseStore, ServiceStore,
};

pub struct PgProjectStore {
    pool: PgPool,
}

impl PgProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn create(&self, slug: &str, name: &str, default_branch: &str) -> Result<Project, EncliiError> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (id, slug, name, default_branch, created_at, updated_at)
            VALUES ($1, $2, $3, $4, now(), now())
            RETURNING id, slug, name, default_branch, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(slug)
        .bind(name)
        .bind(default_branch)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                EncliiError::new(ErrorKind::Conflict, format!("project slug '{slug}' already exists"))
            }
            _ => e.into(),
        })?;
        Ok(project)
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Project>, EncliiError> {
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, slug, name, default_branch, created_at, updated_at FROM projects WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Project>, EncliiError> {
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, slug, name, default_branch, created_at, updated_at FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }
}

pub struct PgEnvironmentStore {
    pool: PgPool,
}

impl PgEnvironmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnvironmentStore for PgEnvironmentStore {
    async fn create(&self, project_id: Uuid, name: &str, namespace: &str) -> Result<Environment, EncliiError> {
        let env = sqlx::query_as::<_, Environment>(
            r#"
            INSERT INTO environments (id, project_id, name, namespace, created_at)
            VALUES ($1, $2, $3, $4, now())
            RETURNING id, project_id, name, namespace, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(name)
        .bind(namespace)
        .fetch_one(&self.pool)
        .await?;
        Ok(env)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Environment>, EncliiError> {
        let env = sqlx::query_as::<_, Environment>(
            "SELECT id, project_id, name, namespace, created_at FROM environments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(env)
    }

    async fn find_by_project_and_name(&self, project_id: Uuid, name: &str) -> Result<Option<Environment>, EncliiError> {
        let env = sqlx::query_as::<_, Environment>(
            "SELECT id, project_id, name, namespace, created_at FROM environments WHERE project_id = $1 AND name = $2",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(env)
    }
}

pub struct PgServiceStore {
    pool: PgPool,
}

impl PgServiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SERVICE_COLUMNS: &str = "id, project_id, name, git_repo, app_path, build_config, auto_deploy, \
     auto_deploy_branch, auto_deploy_env, port, desired_replicas, ready_replicas, health, created_at, updated_at";

#[async_trait]
impl ServiceStore for PgServiceStore {
    async fn create(&self, new: NewService) -> Result<Service, EncliiError> {
        let query = format!(
            r#"
            INSERT INTO services
                (id, project_id, name, git_repo, app_path, build_config, auto_deploy,
                 auto_deploy_branch, auto_deploy_env, port, desired_replicas, ready_replicas,
                 health, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, 'unknown', now(), now())
            RETURNING {SERVICE_COLUMNS}
            "#
        );
        let service = sqlx::query_as::<_, Service>(&query)
            .bind(Uuid::new_v4())
            .bind(new.project_id)
            .bind(&new.name)
            .bind(&new.git_repo)
            .bind(&new.app_path)
            .bind(sqlx::types::Json(new.build_config))
            .bind(new.auto_deploy)
            .bind(&new.auto_deploy_branch)
            .bind(new.auto_deploy_env)
            .bind(new.port as i32)
            .bind(new.desired_replicas)
            .fetch_one(&self.pool)
            .await?;
        Ok(service)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Service>, EncliiError> {
        let query = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = $1");
        let service = sqlx::query_as::<_, Service>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(service)
    }

    async fn find_by_project_and_name(&self, project_id: Uuid, name: &str) -> Result<Option<Service>, EncliiError> {
        let query = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE project_id = $1 AND name = $2");
        let service = sqlx::query_as::<_, Service>(&query)
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(service)
    }

    async fn list_auto_deploy(&self) -> Result<Vec<Service>, EncliiError> {
        let query = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE auto_deploy = true");
        let services = sqlx::query_as::<_, Service>(&query).fetch_all(&self.pool).await?;
        Ok(services)
    }

    async fn update_health_rollup(&self, id: Uuid, health: ServiceHealth, ready_replicas: i32) -> Result<(), EncliiError> {
        sqlx::query("UPDATE services SET health = $1, ready_replicas = $2, updated_at = now() WHERE id = $3")
            .bind(health)
            .bind(ready_replicas)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct PgReleaseStore {
    pool: PgPool,
}

impl PgReleaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const RELEASE_COLUMNS: &str = "id, service_id, version, git_sha, image_uri, status, error_message, \
     sbom, sbom_format, signature, cache_hit, build_log, created_at";

#[async_trait]
impl ReleaseStore for PgReleaseStore {
    async fn create_pending(&self, service_id: Uuid, git_sha: &str, version: &str) -> Result<Release, EncliiError> {
        let query = format!(
            r#"
            INSERT INTO releases (id, service_id, version, git_sha, status, cache_hit, created_at)
            VALUES ($1, $2, $3, $4, 'pending', false, now())
            RETURNING {RELEASE_COLUMNS}
            "#
        );
        let release = sqlx::query_as::<_, Release>(&query)
            .bind(Uuid::new_v4())
            .bind(service_id)
            .bind(version)
            .bind(git_sha)
            .fetch_one(&self.pool)
            .await?;
        Ok(release)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Release>, EncliiError> {
        let query = format!("SELECT {RELEASE_COLUMNS} FROM releases WHERE id = $1");
        let release = sqlx::query_as::<_, Release>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(release)
    }

    async fn list_by_service(&self, service_id: Uuid) -> Result<Vec<Release>, EncliiError> {
        let query = format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE service_id = $1 ORDER BY created_at DESC"
        );
        let releases = sqlx::query_as::<_, Release>(&query)
            .bind(service_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(releases)
    }

    async fn latest_ready(&self, service_id: Uuid) -> Result<Option<Release>, EncliiError> {
        // Backed by a partial index on (service_id, created_at DESC) WHERE status = 'ready',
        // so this is a single index range scan regardless of release count.
        let query = format!(
            "SELECT {RELEASE_COLUMNS} FROM releases WHERE service_id = $1 AND status = 'ready' ORDER BY created_at DESC LIMIT 1"
        );
        let release = sqlx::query_as::<_, Release>(&query)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(release)
    }

    async fn update_status(&self, id: Uuid, status: ReleaseStatus, error_message: Option<&str>) -> Result<(), EncliiError> {
        let current = self.find_by_id(id).await?.ok_or_else(|| EncliiError::not_found("release not found"))?;

        if current.status == status {
            return Ok(()); // idempotent repeat
        }
        if !statemachine::release_valid_transition(current.status, status) {
            return Err(EncliiError::conflict(format!(
                "cannot transition release {id} from {} to {status}",
                current.status
            )));
        }

        sqlx::query(
            "UPDATE releases SET status = $1, error_message = $2 WHERE id = $3 AND status NOT IN ('ready', 'failed')",
        )
        .bind(status)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ready(&self, id: Uuid, image_uri: &str, cache_hit: bool) -> Result<(), EncliiError> {
        let result = sqlx::query(
            "UPDATE releases SET status = 'ready', image_uri = $1, cache_hit = $2 WHERE id = $3 AND status NOT IN ('ready', 'failed')",
        )
        .bind(image_uri)
        .bind(cache_hit)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EncliiError::conflict(format!("release {id} is already terminal")));
        }
        Ok(())
    }

    async fn attach_sbom(&self, id: Uuid, sbom: &str, format: &str) -> Result<(), EncliiError> {
        let result = sqlx::query("UPDATE releases SET sbom = $1, sbom_format = $2 WHERE id = $3 AND sbom IS NULL")
            .bind(sbom)
            .bind(format)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EncliiError::conflict(format!("release {id} already has an SBOM attached")));
        }
        Ok(())
    }

    async fn attach_signature(&self, id: Uuid, signature: &str) -> Result<(), EncliiError> {
        let result = sqlx::query("UPDATE releases SET signature = $1 WHERE id = $2 AND signature IS NULL")
            .bind(signature)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EncliiError::conflict(format!("release {id} already has a signature attached")));
        }
        Ok(())
    }

    async fn append_build_log(&self, id: Uuid, chunk: &str) -> Result<(), EncliiError> {
        sqlx::query("UPDATE releases SET build_log = COALESCE(build_log, '') || $1 WHERE id = $2")
            .bind(chunk)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct PgDeploymentStore {
    pool: PgPool,
}

impl PgDeploymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DEPLOYMENT_COLUMNS: &str = "id, release_id, environment_id, status, health, replicas, \
     controller_metadata, error_message, created_at, completed_at";

#[async_trait]
impl DeploymentStore for PgDeploymentStore {
    async fn create(&self, release_id: Uuid, environment_id: Uuid) -> Result<Deployment, EncliiError> {
        let query = format!(
            r#"
            INSERT INTO deployments (id, release_id, environment_id, status, health, replicas, controller_metadata, created_at)
            VALUES ($1, $2, $3, 'pending', 'unknown', 0, '{{}}'::jsonb, now())
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        );
        let deployment = sqlx::query_as::<_, Deployment>(&query)
            .bind(Uuid::new_v4())
            .bind(release_id)
            .bind(environment_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(deployment)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>, EncliiError> {
        let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1");
        let deployment = sqlx::query_as::<_, Deployment>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deployment)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Deployment>, EncliiError> {
        let query = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE status IN ('pending', 'progressing')"
        );
        let deployments = sqlx::query_as::<_, Deployment>(&query).fetch_all(&self.pool).await?;
        Ok(deployments)
    }

    async fn find_active_for_service_env(&self, service_id: Uuid, environment_id: Uuid) -> Result<Option<Deployment>, EncliiError> {
        let query = format!(
            r#"
            SELECT d.id, d.release_id, d.environment_id, d.status, d.health, d.replicas,
                   d.controller_metadata, d.error_message, d.created_at, d.completed_at
            FROM deployments d
            JOIN releases r ON r.id = d.release_id
            WHERE r.service_id = $1 AND d.environment_id = $2 AND d.status IN ('pending', 'progressing', 'succeeded')
            ORDER BY d.created_at DESC
            LIMIT 1
            "#
        );
        let deployment = sqlx::query_as::<_, Deployment>(&query)
            .bind(service_id)
            .bind(environment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deployment)
    }

    async fn list_succeeded_for_service_env(&self, service_id: Uuid, environment_id: Uuid, limit: i64) -> Result<Vec<Deployment>, EncliiError> {
        let query = format!(
            r#"
            SELECT d.id, d.release_id, d.environment_id, d.status, d.health, d.replicas,
                   d.controller_metadata, d.error_message, d.created_at, d.completed_at
            FROM deployments d
            JOIN releases r ON r.id = d.release_id
            WHERE r.service_id = $1 AND d.environment_id = $2 AND d.status = 'succeeded'
            ORDER BY d.created_at DESC
            LIMIT $3
            "#
        );
        let deployments = sqlx::query_as::<_, Deployment>(&query)
            .bind(service_id)
            .bind(environment_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(deployments)
    }

    async fn update_status(&self, id: Uuid, status: DeploymentStatus, error_message: Option<&str>) -> Result<(), EncliiError> {
        let current = self.find_by_id(id).await?.ok_or_else(|| EncliiError::not_found("deployment not found"))?;
        if current.status == status {
            return Ok(());
        }
        if !statemachine::deployment_valid_transition(current.status, status) {
            return Err(EncliiError::conflict(format!(
                "cannot transition deployment {id} from {} to {status}",
                current.status
            )));
        }
        let completed = matches!(
            status,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        );
        sqlx::query(
            "UPDATE deployments SET status = $1, error_message = $2, completed_at = CASE WHEN $3 THEN now() ELSE completed_at END WHERE id = $4",
        )
        .bind(status)
        .bind(error_message)
        .bind(completed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_health(&self, id: Uuid, health: DeploymentHealth, ready_replicas: i32) -> Result<(), EncliiError> {
        sqlx::query("UPDATE deployments SET health = $1, replicas = $2 WHERE id = $3")
            .bind(health)
            .bind(ready_replicas)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_controller_metadata(&self, id: Uuid, metadata: &serde_json::Value) -> Result<(), EncliiError> {
        sqlx::query("UPDATE deployments SET controller_metadata = $1 WHERE id = $2")
            .bind(sqlx::types::Json(metadata))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct PgEnvVarStore {
    pool: PgPool,
}

impl PgEnvVarStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnvVarStore for PgEnvVarStore {
    async fn set(
        &self,
        service_id: Uuid,
        environment_id: Option<Uuid>,
        key: &str,
        stored_value: &str,
        is_secret: bool,
    ) -> Result<EnvVar, EncliiError> {
        let env_var = sqlx::query_as::<_, EnvVar>(
            r#"
            INSERT INTO env_vars (id, service_id, environment_id, key, value, is_secret, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (service_id, environment_id, key)
            DO UPDATE SET value = EXCLUDED.value, is_secret = EXCLUDED.is_secret, updated_at = now()
            RETURNING id, service_id, environment_id, key, value, is_secret, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(service_id)
        .bind(environment_id)
        .bind(key)
        .bind(stored_value)
        .bind(is_secret)
        .fetch_one(&self.pool)
        .await?;
        Ok(env_var)
    }

    async fn list(&self, service_id: Uuid, environment_id: Option<Uuid>) -> Result<Vec<EnvVar>, EncliiError> {
        let env_vars = sqlx::query_as::<_, EnvVar>(
            "SELECT id, service_id, environment_id, key, value, is_secret, updated_at FROM env_vars \
             WHERE service_id = $1 AND (environment_id = $2 OR environment_id IS NULL)",
        )
        .bind(service_id)
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(env_vars)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EnvVar>, EncliiError> {
        let env_var = sqlx::query_as::<_, EnvVar>(
            "SELECT id, service_id, environment_id, key, value, is_secret, updated_at FROM env_vars WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(env_var)
    }

    async fn delete(&self, id: Uuid) -> Result<(), EncliiError> {
        sqlx::query("DELETE FROM env_vars WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn resolve_for_deploy(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<EnvVar>, EncliiError> {
        // DISTINCT ON (key) with environment-scoped rows ordered first implements the
        // "environment-scoped value beats service-wide value" precedence in one query.
        let env_vars = sqlx::query_as::<_, EnvVar>(
            r#"
            SELECT DISTINCT ON (key) id, service_id, environment_id, key, value, is_secret, updated_at
            FROM env_vars
            WHERE service_id = $1 AND (environment_id = $2 OR environment_id IS NULL)
            ORDER BY key, environment_id NULLS LAST
            "#,
        )
        .bind(service_id)
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(env_vars)
    }
}

pub struct PgDomainStore {
    pool: PgPool,
}

impl PgDomainStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DOMAIN_COLUMNS: &str = "id, service_id, environment_id, hostname, tls_enabled, tls_issuer, \
     verified, verified_at, verification_token, dns_cname, status, created_at";

#[async_trait]
impl DomainStore for PgDomainStore {
    async fn create_pending(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
        hostname: &str,
        dns_cname: &str,
        verification_token: &str,
    ) -> Result<CustomDomain, EncliiError> {
        let query = format!(
            r#"
            INSERT INTO custom_domains
                (id, service_id, environment_id, hostname, tls_enabled, verified, verification_token, dns_cname, status, created_at)
            VALUES ($1, $2, $3, $4, true, false, $5, $6, 'pending', now())
            RETURNING {DOMAIN_COLUMNS}
            "#
        );
        let domain = sqlx::query_as::<_, CustomDomain>(&query)
            .bind(Uuid::new_v4())
            .bind(service_id)
            .bind(environment_id)
            .bind(hostname)
            .bind(verification_token)
            .bind(dns_cname)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.constraint().is_some() => {
                    EncliiError::new(ErrorKind::Conflict, format!("hostname '{hostname}' already registered"))
                }
                _ => e.into(),
            })?;
        Ok(domain)
    }

    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<CustomDomain>, EncliiError> {
        let query = format!("SELECT {DOMAIN_COLUMNS} FROM custom_domains WHERE hostname = $1");
        let domain = sqlx::query_as::<_, CustomDomain>(&query)
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        Ok(domain)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<CustomDomain>, EncliiError> {
        let query = format!("SELECT {DOMAIN_COLUMNS} FROM custom_domains WHERE id = $1");
        let domain = sqlx::query_as::<_, CustomDomain>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(domain)
    }

    async fn mark_verified(&self, id: Uuid, verified_at: DateTime<Utc>) -> Result<(), EncliiError> {
        sqlx::query("UPDATE custom_domains SET verified = true, verified_at = $1, status = 'active' WHERE id = $2")
            .bind(verified_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), EncliiError> {
        sqlx::query("DELETE FROM custom_domains WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }
}
