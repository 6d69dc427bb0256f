pub mod audit;
pub mod auth;
pub mod build;
pub mod cache;
pub mod domain;
pub mod error;
pub mod gitfetch;
pub mod jobqueue;
pub mod model;
pub mod oci;
pub mod reconcile;
pub mod scheduler;
pub mod secrets;
pub mod settings;
pub mod statemachine;
pub mod store;
pub mod telemetry;
pub mod webhook;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use audit::TracingAuditSink;
use build::{provider_from_settings, BuildPipeline, BuildPipelineConfig, CliRuntimeBridge, RegistryProvider};
use cache::{BuildCache, S3ObjectStore};
use domain::{DomainController, HttpDnsProvider, HttpTunnelProvider};
use jobqueue::HttpJobQueueClient;
use reconcile::kubernetes::{KubernetesBackend, KubernetesBackendConfig};
use reconcile::{Reconciler, ReconcilerConfig};
use scheduler::Scheduler;
use secrets::EnvVarManager;
use settings::Settings;
use store::postgres::{
    PgDeploymentStore, PgDomainStore, PgEnvVarStore, PgEnvironmentStore, PgProjectStore, PgReleaseStore, PgServiceStore,
};
use webhook::WebhookIngest;

/// Constructs every engine and runs until a shutdown signal arrives. No HTTP
/// listener is started here; the out-of-scope REST surface is a separate
/// process that calls into these same stores and managers.
pub async fn run(settings: Settings) -> Result<()> {
    rustls::crypto::ring::default_provider().install_default().ok();

    let db_pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await
        .context("failed to connect to database")?;

    let projects = Arc::new(PgProjectStore::new(db_pool.clone()));
    let environments = Arc::new(PgEnvironmentStore::new(db_pool.clone()));
    let services = Arc::new(PgServiceStore::new(db_pool.clone()));
    let releases = Arc::new(PgReleaseStore::new(db_pool.clone()));
    let deployments = Arc::new(PgDeploymentStore::new(db_pool.clone()));
    let env_vars = Arc::new(PgEnvVarStore::new(db_pool.clone()));
    let domains = Arc::new(PgDomainStore::new(db_pool.clone()));

    let audit: Arc<dyn audit::AuditSink> = Arc::new(TracingAuditSink);

    let encryption_provider = secrets::init_provider(settings.encryption.as_ref())
        .await?
        .ok_or_else(|| anyhow!("encryption settings required: secrets cannot be stored without an encryption provider"))?;
    let env_manager = Arc::new(EnvVarManager::new(env_vars.clone(), encryption_provider, audit.clone()));

    let object_store = Arc::new(
        S3ObjectStore::new(
            settings.object_store.bucket.clone(),
            settings.object_store.region.clone(),
            settings.object_store.endpoint.clone(),
        )
        .await,
    );
    let build_cache = Arc::new(BuildCache::new(object_store, Duration::from_secs(300)));

    let registry_provider: Arc<dyn RegistryProvider> = Arc::from(provider_from_settings(&settings.registry).await);
    let runtime_bridge = Arc::new(CliRuntimeBridge::new("docker"));
    let registry_image_prefix = registry_provider.registry_host().to_string();

    let build_pipeline = Arc::new(BuildPipeline::new(
        build_cache.clone(),
        runtime_bridge,
        registry_provider,
        releases.clone(),
        BuildPipelineConfig {
            workdir: PathBuf::from("/tmp/enclii-builds"),
            registry_image_prefix,
            cache_prefix: settings.build.cache_prefix.clone().unwrap_or_default(),
            pipeline_timeout: Duration::from_secs(settings.build.pipeline_timeout_secs),
            sbom_timeout: Duration::from_secs(settings.build.sbom_timeout_secs),
            sign_timeout: Duration::from_secs(settings.build.sign_timeout_secs),
            log_cap_lines: 2000,
        },
    ));

    let kube_config = if settings.kubernetes.kubeconfig.is_some() {
        kube::Config::from_kubeconfig(&kube::config::KubeConfigOptions { context: None, cluster: None, user: None }).await?
    } else {
        kube::Config::infer().await?
    };
    let kube_client = kube::Client::try_from(kube_config)?;
    let reconcile_backend = Arc::new(KubernetesBackend::new(
        kube_client,
        KubernetesBackendConfig { namespace_format: settings.kubernetes.namespace_format.clone(), node_selector: settings.kubernetes.node_selector.clone() },
    ));

    let reconciler = Arc::new(Reconciler::new(
        projects.clone(),
        environments.clone(),
        services.clone(),
        releases.clone(),
        deployments.clone(),
        env_manager.clone(),
        reconcile_backend,
        ReconcilerConfig { tick_interval: Duration::from_secs(settings.scheduler.reconcile_interval_secs), ..Default::default() },
    ));

    let job_queue: Arc<dyn jobqueue::JobQueueClient> = Arc::new(HttpJobQueueClient::new(
        std::env::var("ENCLII_JOB_QUEUE_URL").unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
        std::env::var("ENCLII_JOB_QUEUE_TOKEN").unwrap_or_default(),
    ));
    let callback_url = std::env::var("ENCLII_BUILD_CALLBACK_URL").unwrap_or_else(|_| "http://enclii-controlplane.internal/internal/build-callback".to_string());
    let webhook_ingest = Arc::new(WebhookIngest::new(services.clone(), releases.clone(), job_queue, settings.webhook.clone(), callback_url));

    let dns_provider: Arc<dyn domain::DnsProvider> = Arc::new(HttpDnsProvider::new(&settings.dns));
    let tunnel_provider: Arc<dyn domain::TunnelProvider> = Arc::new(HttpTunnelProvider::new(&settings.tunnel));
    let domain_controller = Arc::new(DomainController::new(dns_provider, tunnel_provider, domains, audit.clone(), settings.tunnel.tunnel_domain_suffix.clone()));

    // build_pipeline and webhook_ingest are driven by the out-of-scope REST
    // surface (build trigger endpoint, webhook POST route); keep them alive
    // here so construction failures surface at startup instead of on first use.
    let _ = &build_pipeline;
    let _ = &webhook_ingest;
    let _ = &domain_controller;

    let mut scheduler = Scheduler::new();
    scheduler.start_reconcile_loop(reconciler);
    scheduler.start_cache_eviction(build_cache, Duration::from_secs(settings.scheduler.cache_eviction_interval_secs), Duration::from_secs(86_400 * 30));

    info!("enclii control plane started");
    shutdown_signal().await;
    info!("shutdown signal received, stopping scheduler");

    scheduler.shutdown();
    scheduler.join().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down gracefully"),
        _ = terminate => info!("received SIGTERM, shutting down gracefully"),
    }
}
