//! Reconciler/Deployer: drives a service's running state in an environment
//! toward its latest ready release. Adapted from the teacher's
//! `DeploymentController` (`deployment/controller/mod.rs`) — the
//! `DeploymentBackend` trait here is `ReconcileBackend`, and the three
//! separate reconcile/health-check/termination loops collapse into a single
//! per-tick scan, since this spec has no Docker-container termination phase
//! to run as its own loop.

pub mod kubernetes;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EncliiError;
use crate::model::{Deployment, DeploymentHealth, DeploymentStatus, Release, Service};
use crate::statemachine;
use crate::store::{DeploymentStore, EnvironmentStore, ProjectStore, ReleaseStore, ServiceStore};

/// Resolves the environment variables (plaintext, secrets already decrypted)
/// a deployment's containers should run with. Implemented by
/// `secrets::EnvVarManager`; declared here so `reconcile` never depends on
/// that module's encryption machinery, only its resolved output.
#[async_trait]
pub trait EnvResolver: Send + Sync {
    async fn resolve_for_deploy(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Vec<(String, String)>, EncliiError>;
}

/// Everything a `ReconcileBackend` needs to compute and apply desired state
/// for one service/environment pair.
pub struct ReconcileTarget {
    pub project_slug: String,
    pub service: Service,
    pub release: Release,
    pub env_vars: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutHealth {
    Healthy { ready_replicas: i32 },
    Progressing { ready_replicas: i32, desired_replicas: i32 },
    Unhealthy { ready_replicas: i32, desired_replicas: i32, reason: Option<String> },
}

impl RolloutHealth {
    fn ready_replicas(&self) -> i32 {
        match self {
            RolloutHealth::Healthy { ready_replicas } => *ready_replicas,
            RolloutHealth::Progressing { ready_replicas, .. } => *ready_replicas,
            RolloutHealth::Unhealthy { ready_replicas, .. } => *ready_replicas,
        }
    }

    fn deployment_health(&self) -> DeploymentHealth {
        match self {
            RolloutHealth::Healthy { .. } => DeploymentHealth::Healthy,
            RolloutHealth::Progressing { .. } => DeploymentHealth::Unknown,
            RolloutHealth::Unhealthy { .. } => DeploymentHealth::Unhealthy,
        }
    }
}

/// Swap point for the runtime a reconcile target is applied against. The
/// only implementation today is `kubernetes::KubernetesBackend`, mirroring
/// how the teacher's `DeploymentBackend` has `DockerController` as its only
/// implementation today but leaves room for others.
#[async_trait]
pub trait ReconcileBackend: Send + Sync {
    async fn apply(&self, target: &ReconcileTarget, cancel: &CancellationToken) -> Result<(), EncliiError>;
    async fn poll_health(&self, target: &ReconcileTarget, cancel: &CancellationToken) -> Result<RolloutHealth, EncliiError>;
    async fn remove(&self, target: &ReconcileTarget, cancel: &CancellationToken) -> Result<(), EncliiError>;
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_apply_backoff_cap() -> Duration {
    Duration::from_secs(60)
}

pub struct ReconcilerConfig {
    pub tick_interval: Duration,
    pub apply_retry_backoff_cap: Duration,
    pub apply_retry_initial_backoff: Duration,
    pub max_apply_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            apply_retry_backoff_cap: default_apply_backoff_cap(),
            apply_retry_initial_backoff: Duration::from_secs(1),
            max_apply_attempts: 5,
        }
    }
}

/// Drives reconciliation for every service that has auto-deploy enabled or a
/// non-terminal deployment in flight. One tick does three things: pick up
/// new releases for auto-deploy services, push forward any deployment still
/// `pending`/`progressing`, and re-poll health for recently-succeeded
/// deployments so a crash-loop after rollout is caught.
pub struct Reconciler {
    projects: Arc<dyn ProjectStore>,
    environments: Arc<dyn EnvironmentStore>,
    services: Arc<dyn ServiceStore>,
    releases: Arc<dyn ReleaseStore>,
    deployments: Arc<dyn DeploymentStore>,
    env_resolver: Arc<dyn EnvResolver>,
    backend: Arc<dyn ReconcileBackend>,
    config: ReconcilerConfig,
    /// One lock per service so two ticks never apply concurrently for the
    /// same service, generalizing the teacher's per-backend dispatch to
    /// per-service dispatch across N services sharing one backend.
    locks: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        environments: Arc<dyn EnvironmentStore>,
        services: Arc<dyn ServiceStore>,
        releases: Arc<dyn ReleaseStore>,
        deployments: Arc<dyn DeploymentStore>,
        env_resolver: Arc<dyn EnvResolver>,
        backend: Arc<dyn ReconcileBackend>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            projects,
            environments,
            services,
            releases,
            deployments,
            env_resolver,
            backend,
            config,
            locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, service_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(service_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Runs until `cancel` fires. Intended to be spawned once by the
    /// scheduler alongside the cache-eviction and tunnel-drift tickers.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("reconciler loop started");
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&cancel).await {
                        error!(error = %e, "reconcile tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), EncliiError> {
        self.scan_auto_deploy_candidates(cancel).await?;
        self.refresh_non_terminal_deployments(cancel).await?;
        Ok(())
    }

    /// Finds services with auto-deploy enabled whose latest ready release
    /// has no active (pending/progressing/succeeded) deployment in the
    /// auto-deploy environment yet, and starts one.
    async fn scan_auto_deploy_candidates(&self, cancel: &CancellationToken) -> Result<(), EncliiError> {
        let candidates = self.services.list_auto_deploy().await?;
        for service in candidates {
            if cancel.is_cancelled() {
                return Err(EncliiError::cancelled("reconcile cancelled"));
            }
            let Some(environment_id) = service.auto_deploy_env else { continue };
            let Some(release) = self.releases.latest_ready(service.id).await? else { continue };

            let active = self.deployments.find_active_for_service_env(service.id, environment_id).await?;
            let already_deploying = match &active {
                Some(d) => d.release_id == release.id,
                None => false,
            };
            if already_deploying {
                continue;
            }

            if let Err(e) = self.deploy_release(service.id, release.id, environment_id, cancel).await {
                warn!(service_id = %service.id, release_id = %release.id, error = %e, "auto-deploy failed to start");
            }
        }
        Ok(())
    }

    /// Advances every deployment that hasn't reached a terminal status yet:
    /// applies desired state if it hasn't been applied, otherwise polls
    /// health and records a transition.
    async fn refresh_non_terminal_deployments(&self, cancel: &CancellationToken) -> Result<(), EncliiError> {
        let pending = self.deployments.list_non_terminal().await?;
        for deployment in pending {
            if cancel.is_cancelled() {
                return Err(EncliiError::cancelled("reconcile cancelled"));
            }
            if let Err(e) = self.refresh_deployment_health(&deployment, cancel).await {
                error!(deployment_id = %deployment.id, error = %e, "failed to refresh deployment");
            }
        }
        Ok(())
    }

    /// Starts a new deployment for `release_id` in `environment_id`,
    /// applying it against the backend and recording the outcome. Used by
    /// both auto-deploy and an explicit deploy request (the CLI/API surface
    /// that calls this crate is out of scope, but this is the entry point it
    /// would call).
    pub async fn deploy_release(
        &self,
        service_id: Uuid,
        release_id: Uuid,
        environment_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Deployment, EncliiError> {
        let lock = self.lock_for(service_id).await;
        let _guard = lock.lock().await;

        let deployment = self.deployments.create(release_id, environment_id).await?;
        self.apply_with_retry(&deployment, cancel).await?;
        Ok(deployment)
    }

    async fn build_target(&self, deployment: &Deployment) -> Result<(Service, ReconcileTarget), EncliiError> {
        let release = self
            .releases
            .find_by_id(deployment.release_id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("release {} not found", deployment.release_id)))?;
        let service = self
            .services
            .find_by_id(release.service_id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("service {} not found", release.service_id)))?;
        let environment = self
            .environments
            .find_by_id(deployment.environment_id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("environment {} not found", deployment.environment_id)))?;
        let project = self
            .projects
            .find_by_id(service.project_id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("project {} not found", service.project_id)))?;
        let env_vars = self.env_resolver.resolve_for_deploy(service.id, environment.id).await?;

        let target = ReconcileTarget {
            project_slug: project.slug,
            service: service.clone(),
            release,
            env_vars,
        };
        Ok((service, target))
    }

    /// Applies desired state with exponential backoff, honoring `cancel`
    /// during the sleep between attempts so a shutdown doesn't have to wait
    /// out a full retry window.
    async fn apply_with_retry(&self, deployment: &Deployment, cancel: &CancellationToken) -> Result<(), EncliiError> {
        let (_, target) = self.build_target(deployment).await?;

        let mut backoff = self.config.apply_retry_initial_backoff;
        let mut last_err = None;
        for attempt in 1..=self.config.max_apply_attempts {
            if cancel.is_cancelled() {
                return Err(EncliiError::cancelled("apply cancelled"));
            }
            match self.backend.apply(&target, cancel).await {
                Ok(()) => {
                    self.deployments
                        .update_status(deployment.id, DeploymentStatus::Progressing, None)
                        .await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(deployment_id = %deployment.id, attempt, error = %e, "apply attempt failed");
                    last_err = Some(e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EncliiError::cancelled("apply cancelled")),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.apply_retry_backoff_cap);
                }
            }
        }

        let message = last_err.map(|e| e.to_string()).unwrap_or_else(|| "apply failed".to_string());
        self.deployments
            .update_status(deployment.id, DeploymentStatus::Failed, Some(&message))
            .await?;
        Err(EncliiError::upstream(message))
    }

    async fn refresh_deployment_health(&self, deployment: &Deployment, cancel: &CancellationToken) -> Result<(), EncliiError> {
        if deployment.status == DeploymentStatus::Pending {
            return self.apply_with_retry(deployment, cancel).await;
        }

        let (service, target) = self.build_target(deployment).await?;
        self.poll_and_record(deployment, &service, &target).await
    }

    async fn poll_and_record(&self, deployment: &Deployment, service: &Service, target: &ReconcileTarget) -> Result<(), EncliiError> {
        let cancel = CancellationToken::new();
        let health = self.backend.poll_health(target, &cancel).await?;

        self.deployments
            .update_health(deployment.id, health.deployment_health(), health.ready_replicas())
            .await?;
        self.services
            .update_health_rollup(service.id, to_service_health(&health), health.ready_replicas())
            .await?;

        match &health {
            RolloutHealth::Healthy { .. } => {
                if statemachine::deployment_valid_transition(deployment.status, DeploymentStatus::Succeeded) {
                    self.deployments
                        .update_status(deployment.id, DeploymentStatus::Succeeded, None)
                        .await?;
                }
            }
            RolloutHealth::Unhealthy { reason, .. } => {
                if let Some(reason) = reason {
                    if statemachine::deployment_valid_transition(deployment.status, DeploymentStatus::Failed) {
                        self.deployments
                            .update_status(deployment.id, DeploymentStatus::Failed, Some(reason))
                            .await?;
                    }
                }
            }
            RolloutHealth::Progressing { .. } => {}
        }

        Ok(())
    }

    /// Rolls a service/environment back to `to_release`, or if `None`, to
    /// the release of the immediately previous succeeded deployment. Always
    /// creates a new deployment row — deployment history is append-only —
    /// and marks the deployment being rolled back from `RolledBack` only
    /// once the replacement has actually been applied.
    pub async fn rollback(
        &self,
        deployment_id: Uuid,
        to_release: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<Deployment, EncliiError> {
        let current = self
            .deployments
            .find_by_id(deployment_id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("deployment {deployment_id} not found")))?;
        let release = self
            .releases
            .find_by_id(current.release_id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("release {} not found", current.release_id)))?;

        let target_release_id = match to_release {
            Some(id) => id,
            None => {
                let candidates = self
                    .deployments
                    .list_succeeded_for_service_env(release.service_id, current.environment_id, 2)
                    .await?;
                candidates
                    .into_iter()
                    .find(|d| d.id != deployment_id)
                    .map(|d| d.release_id)
                    .ok_or_else(|| EncliiError::conflict("no previous succeeded deployment to roll back to"))?
            }
        };

        let lock = self.lock_for(release.service_id).await;
        let _guard = lock.lock().await;

        let new_deployment = self.deployments.create(target_release_id, current.environment_id).await?;
        self.apply_with_retry(&new_deployment, cancel).await?;

        self.deployments
            .update_status(deployment_id, DeploymentStatus::RolledBack, None)
            .await?;

        Ok(new_deployment)
    }
}

fn to_service_health(health: &RolloutHealth) -> crate::model::ServiceHealth {
    match health {
        RolloutHealth::Healthy { .. } => crate::model::ServiceHealth::Healthy,
        RolloutHealth::Progressing { .. } => crate::model::ServiceHealth::Progressing,
        RolloutHealth::Unhealthy { .. } => crate::model::ServiceHealth::Unhealthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_health_ready_replicas_matches_variant() {
        let h = RolloutHealth::Progressing { ready_replicas: 2, desired_replicas: 3 };
        assert_eq!(h.ready_replicas(), 2);
        assert_eq!(h.deployment_health(), DeploymentHealth::Unknown);
    }

    #[test]
    fn rollout_health_healthy_maps_to_healthy_service_health() {
        let h = RolloutHealth::Healthy { ready_replicas: 3 };
        assert_eq!(to_service_health(&h), crate::model::ServiceHealth::Healthy);
        assert_eq!(h.deployment_health(), DeploymentHealth::Healthy);
    }
}
