//! Build Orchestrator: sequences clone -> detect -> cache lookup -> build ->
//! push -> SBOM -> sign -> cleanup for a single release. See SPEC_FULL.md §4.3.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::BuildCache;
use crate::error::{EncliiError, ErrorKind};
use crate::gitfetch::GitFetcher;
use crate::model::{BuildCacheKey, BuildCacheMetadata, BuildConfig, ReleaseStatus, Service};
use crate::store::ReleaseStore;

use super::registry::RegistryProvider;
use super::runtime::{ContainerRuntimeBridge, LogRing};
use super::{detect_strategy, output_tag};

pub struct BuildPipelineConfig {
    pub workdir: PathBuf,
    pub registry_image_prefix: String,
    pub cache_prefix: String,
    pub pipeline_timeout: Duration,
    pub sbom_timeout: Duration,
    pub sign_timeout: Duration,
    pub log_cap_lines: usize,
}

pub struct BuildOutcome {
    pub image_uri: String,
    pub cache_hit: bool,
}

pub struct BuildPipeline {
    fetcher: GitFetcher,
    cache: Arc<BuildCache>,
    runtime: Arc<dyn ContainerRuntimeBridge>,
    registry: Arc<dyn RegistryProvider>,
    releases: Arc<dyn ReleaseStore>,
    config: BuildPipelineConfig,
}

impl BuildPipeline {
    pub fn new(
        cache: Arc<BuildCache>,
        runtime: Arc<dyn ContainerRuntimeBridge>,
        registry: Arc<dyn RegistryProvider>,
        releases: Arc<dyn ReleaseStore>,
        config: BuildPipelineConfig,
    ) -> Self {
        Self { fetcher: GitFetcher::new(config.workdir.clone()), cache, runtime, registry, releases, config }
    }

    /// Runs the full pipeline for one release. Clone, build, and push
    /// failures are fatal (release -> failed); SBOM/signing/metadata/cleanup
    /// failures are logged and swallowed.
    pub async fn run(&self, service: &Service, project_id: Uuid, release_id: Uuid, git_sha: &str, cancel: &CancellationToken) -> Result<BuildOutcome, EncliiError> {
        match timeout(self.config.pipeline_timeout, self.run_inner(service, project_id, release_id, git_sha, cancel)).await {
            Ok(result) => result,
            Err(_) => {
                let _ = self.releases.update_status(release_id, ReleaseStatus::Failed, Some("build pipeline timed out")).await;
                Err(EncliiError::new(ErrorKind::Timeout, "build pipeline timed out"))
            }
        }
    }

    async fn run_inner(&self, service: &Service, project_id: Uuid, release_id: Uuid, git_sha: &str, cancel: &CancellationToken) -> Result<BuildOutcome, EncliiError> {
        self.releases.update_status(release_id, ReleaseStatus::Building, None).await?;

        let workspace = match self.fetcher.clone(&service.git_repo, git_sha, cancel).await {
            Ok(ws) => ws,
            Err(e) => {
                self.releases.update_status(release_id, ReleaseStatus::Failed, Some(&e.message)).await.ok();
                return Err(e);
            }
        };

        let result = self.build_in_workspace(service, project_id, release_id, &workspace.path, &workspace.sha, cancel).await;

        workspace.cleanup().await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.releases.update_status(release_id, ReleaseStatus::Failed, Some(&e.message)).await.ok();
                Err(e)
            }
        }
    }

    async fn build_in_workspace(&self, service: &Service, project_id: Uuid, release_id: Uuid, workspace: &std::path::Path, git_sha: &str, cancel: &CancellationToken) -> Result<BuildOutcome, EncliiError> {
        let build_config: &BuildConfig = &service.build_config;
        let strategy = match build_config.strategy {
            crate::model::BuildStrategy::Auto => detect_strategy(workspace),
            other => other,
        };

        let now = Utc::now();
        let deps_hash = crate::cache::deps_fingerprint(workspace, now);
        let builder_hash = crate::cache::builder_fingerprint(workspace);
        let cache_key = BuildCacheKey { project_id, service_name: service.name.clone(), deps_hash, builder_hash };

        let cached = self.cache.lookup(&cache_key).await.unwrap_or(None);
        let cache_hit = cached.is_some();

        let image_tag = output_tag(&self.config.registry_image_prefix, &service.name, now, git_sha);

        let mut build_args = build_config.build_args.clone();
        build_args.insert("GIT_SHA".to_string(), git_sha.to_string());
        if let Some(cached_meta) = &cached {
            build_args.insert("CACHE_FROM".to_string(), cached_meta.cache_image_uri.clone());
        }

        let dockerfile_rel = if strategy == crate::model::BuildStrategy::Dockerfile { build_config.dockerfile.as_deref() } else { None };

        let mut log = LogRing::new(self.config.log_cap_lines);

        self.runtime.build(workspace, dockerfile_rel, &image_tag, &build_args, &mut log, cancel).await?;

        let credentials = self.registry.push_credentials(&service.name).await?;
        self.runtime.push(&image_tag, &credentials, &mut log, cancel).await?;

        self.releases.append_build_log(release_id, &log.render()).await.ok();
        self.releases.mark_ready(release_id, &image_tag, cache_hit).await?;

        if build_config.cache_enabled {
            let cache_image_uri = cache_key.cache_image_tag(&self.config.registry_image_prefix, &self.config.cache_prefix);
            let metadata = BuildCacheMetadata {
                key: cache_key,
                cache_image_uri,
                hit_count: cached.as_ref().map(|c| c.hit_count).unwrap_or(0),
                last_hit: now,
                size_bytes: 0,
                created_at: cached.as_ref().map(|_| now).unwrap_or(now),
            };
            if let Err(e) = self.cache.save(&metadata).await {
                warn!(error = %e, release_id = %release_id, "failed to persist build cache metadata, continuing");
            }
        }

        if build_config.signing_enabled {
            if let Err(e) = self.sign(release_id, &image_tag).await {
                warn!(error = %e, release_id = %release_id, "image signing failed, continuing without signature");
            }
        }
        if let Err(e) = self.sbom(release_id, &image_tag).await {
            warn!(error = %e, release_id = %release_id, "sbom generation failed, continuing without sbom");
        }

        info!(release_id = %release_id, image_uri = %image_tag, cache_hit, "build completed");

        Ok(BuildOutcome { image_uri: image_tag, cache_hit })
    }

    async fn sbom(&self, release_id: Uuid, image_ref: &str) -> Result<(), EncliiError> {
        let (format, content) = super::tools::generate_sbom(image_ref, self.config.sbom_timeout).await?;
        self.releases.attach_sbom(release_id, &content, &format).await
    }

    async fn sign(&self, release_id: Uuid, image_ref: &str) -> Result<(), EncliiError> {
        let signature = super::tools::sign_image(image_ref, self.config.sign_timeout).await?;
        self.releases.attach_signature(release_id, &signature).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BuildCache, InMemoryObjectStore};
    use crate::model::{BuildStrategy, Service, ServiceHealth};
    use crate::store::memory::{InMemoryReleaseStore, InMemoryServiceStore};
    use crate::store::{NewService, ServiceStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeRuntime {
        build_calls: Mutex<u32>,
    }

    #[async_trait]
    impl ContainerRuntimeBridge for FakeRuntime {
        async fn build(&self, _workspace: &std::path::Path, _dockerfile_rel: Option<&str>, _image_tag: &str, _build_args: &HashMap<String, String>, log: &mut LogRing, _cancel: &CancellationToken) -> Result<(), EncliiError> {
            *self.build_calls.lock().unwrap() += 1;
            log.push("build ok".into());
            Ok(())
        }

        async fn push(&self, _image_tag: &str, _credentials: &super::super::registry::RegistryCredentials, log: &mut LogRing, _cancel: &CancellationToken) -> Result<(), EncliiError> {
            log.push("push ok".into());
            Ok(())
        }
    }

    struct FakeRegistry;

    #[async_trait]
    impl RegistryProvider for FakeRegistry {
        async fn push_credentials(&self, _repository: &str) -> Result<super::super::registry::RegistryCredentials, EncliiError> {
            Ok(super::super::registry::RegistryCredentials {
                registry_url: "registry.example.com".into(),
                username: "x".into(),
                password: "y".into(),
                expires_in_secs: None,
            })
        }

        fn registry_host(&self) -> &str {
            "registry.example.com"
        }
    }

    fn config(workdir: PathBuf) -> BuildPipelineConfig {
        BuildPipelineConfig {
            workdir,
            registry_image_prefix: "registry.example.com".into(),
            cache_prefix: "cache".into(),
            pipeline_timeout: Duration::from_secs(30),
            sbom_timeout: Duration::from_secs(5),
            sign_timeout: Duration::from_secs(5),
            log_cap_lines: 100,
        }
    }

    #[tokio::test]
    async fn cache_disabled_build_marks_release_ready() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("Dockerfile"), "FROM scratch").unwrap();

        let service_store = InMemoryServiceStore::default();
        let project_id = Uuid::new_v4();
        let service = service_store
            .create(NewService {
                project_id,
                name: "api".into(),
                git_repo: workspace.path().to_string_lossy().to_string(),
                app_path: None,
                build_config: BuildConfig { strategy: BuildStrategy::Dockerfile, cache_enabled: false, ..Default::default() },
                auto_deploy: false,
                auto_deploy_branch: "main".into(),
                auto_deploy_env: None,
                port: 8080,
                desired_replicas: 1,
            })
            .await
            .unwrap();
        assert_eq!(service.health, ServiceHealth::Unknown);

        let releases = Arc::new(InMemoryReleaseStore::default());
        let release = releases.create_pending(service.id, "deadbeef00", "v1").await.unwrap();

        let cache = Arc::new(BuildCache::new(Arc::new(InMemoryObjectStore::default()), Duration::from_secs(60)));
        let runtime: Arc<dyn ContainerRuntimeBridge> = Arc::new(FakeRuntime { build_calls: Mutex::new(0) });
        let registry: Arc<dyn RegistryProvider> = Arc::new(FakeRegistry);

        let pipeline = BuildPipeline::new(cache, runtime, registry, releases.clone(), config(workspace.path().to_path_buf()));

        // Point git_repo at the local directory by cloning it directly is not
        // exercised here; the pipeline's build stage is what's under test, so
        // drive build_in_workspace directly against the prepared workspace.
        let cancel = CancellationToken::new();
        let outcome = pipeline
            .build_in_workspace(&service, project_id, release.id, workspace.path(), "deadbeef00", &cancel)
            .await
            .unwrap();

        assert!(!outcome.cache_hit);
        let stored = releases.find_by_id(release.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReleaseStatus::Ready);
        assert_eq!(stored.image_uri.as_deref(), Some(outcome.image_uri.as_str()));
    }
}
