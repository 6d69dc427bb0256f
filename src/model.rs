use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A project groups the services and environments that belong to one application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A deploy target within a project, backed by a single Kubernetes namespace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum BuildStrategy {
    Auto,
    Buildpack,
    Dockerfile,
}

impl std::fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStrategy::Auto => write!(f, "auto"),
            BuildStrategy::Buildpack => write!(f, "buildpack"),
            BuildStrategy::Dockerfile => write!(f, "dockerfile"),
        }
    }
}

/// Build configuration for a service. Carries both cache and signing fields
/// unconditionally (see DESIGN.md, Open Question 1): absence of a key is
/// "disabled", not "feature not present".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(rename = "type")]
    pub strategy: BuildStrategy,
    pub dockerfile: Option<String>,
    pub build_args: std::collections::HashMap<String, String>,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub signing_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            strategy: BuildStrategy::Auto,
            dockerfile: None,
            build_args: std::collections::HashMap::new(),
            cache_enabled: true,
            signing_enabled: false,
        }
    }
}

/// A deployable unit within a project: one git repository (or monorepo subdirectory),
/// one build configuration, one desired runtime shape.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub git_repo: String,
    pub app_path: Option<String>,
    #[sqlx(json)]
    pub build_config: sqlx::types::Json<BuildConfig>,
    pub auto_deploy: bool,
    pub auto_deploy_branch: String,
    pub auto_deploy_env: Option<Uuid>,
    #[sqlx(try_from = "i32")]
    pub port: u16,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub health: ServiceHealth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum ServiceHealth {
    Unknown,
    Healthy,
    Unhealthy,
    Progressing,
}

/// An immutable record binding a git commit to a built container image.
///
/// Once `status` is `Ready` or `Failed` it is terminal: `image_uri`, `sbom` and
/// `signature` may each be attached exactly once afterwards (I1, I2).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Release {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version: String,
    pub git_sha: String,
    pub image_uri: Option<String>,
    pub status: ReleaseStatus,
    pub error_message: Option<String>,
    pub sbom: Option<String>,
    pub sbom_format: Option<String>,
    pub signature: Option<String>,
    pub cache_hit: bool,
    pub build_log: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum ReleaseStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseStatus::Pending => write!(f, "pending"),
            ReleaseStatus::Building => write!(f, "building"),
            ReleaseStatus::Ready => write!(f, "ready"),
            ReleaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An attempt to make a release the running state of a service in an environment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub release_id: Uuid,
    pub environment_id: Uuid,
    pub status: DeploymentStatus,
    pub health: DeploymentHealth,
    pub replicas: i32,
    #[sqlx(json)]
    pub controller_metadata: sqlx::types::Json<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum DeploymentStatus {
    Pending,
    Progressing,
    Succeeded,
    Failed,
    RolledBack,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::Progressing => write!(f, "progressing"),
            DeploymentStatus::Succeeded => write!(f, "succeeded"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum DeploymentHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// A key/value pair attached to a service, optionally scoped to one environment.
///
/// Secret values are stored as AES-256-GCM ciphertext (see `secrets` module) and
/// are never returned in plaintext by listing APIs (I6).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvVar {
    pub id: Uuid,
    pub service_id: Uuid,
    pub environment_id: Option<Uuid>,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
    pub updated_at: DateTime<Utc>,
}

/// A public hostname routed to a service through the tunnel ingress.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomDomain {
    pub id: Uuid,
    pub service_id: Uuid,
    pub environment_id: Uuid,
    pub hostname: String,
    pub tls_enabled: bool,
    pub tls_issuer: Option<String>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_token: String,
    pub dns_cname: String,
    pub status: DomainStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum DomainStatus {
    Pending,
    Active,
    Failed,
}

/// Identifies one cache lineage: a given project's service at a given dependency
/// fingerprint. Uniqueness is (project_id, service_name, deps_hash) exactly, per I3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildCacheKey {
    pub project_id: Uuid,
    pub service_name: String,
    pub deps_hash: String,
    pub builder_hash: String,
}

impl BuildCacheKey {
    pub fn metadata_object_key(&self) -> String {
        format!(
            "build-cache/{}-{}-{}.json",
            self.project_id, self.service_name, self.deps_hash
        )
    }

    pub fn cache_image_tag(&self, registry: &str, cache_prefix: &str) -> String {
        let project8: String = self.project_id.simple().to_string().chars().take(8).collect();
        let deps8: String = self.deps_hash.chars().take(8).collect();
        format!(
            "{registry}/{cache_prefix}:{project8}-{}-{deps8}",
            self.service_name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCacheMetadata {
    pub key: BuildCacheKey,
    pub cache_image_uri: String,
    /// Count of lookups that found this entry. Does not track misses: evicting
    /// an entry whose last hit predates the cutoff is treated as the entry's
    /// only signal, which approximates a hit rate rather than measuring one.
    pub hit_count: u64,
    pub last_hit: DateTime<Utc>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}
