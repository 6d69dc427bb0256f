use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    pub object_store: ObjectStoreSettings,
    pub registry: RegistrySettings,
    pub kubernetes: KubernetesSettings,
    pub dns: DnsSettings,
    pub tunnel: TunnelSettings,
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
    #[serde(default)]
    pub build: BuildSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_eviction_interval() -> u64 {
    86_400
}

fn default_drift_check_interval() -> u64 {
    300
}

/// Interval configuration for the periodic tasks the `Scheduler` (§4.9) drives.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_eviction_interval")]
    pub cache_eviction_interval_secs: u64,
    #[serde(default = "default_drift_check_interval")]
    pub tunnel_drift_check_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            cache_eviction_interval_secs: default_eviction_interval(),
            tunnel_drift_check_interval_secs: default_drift_check_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_repo_prefix() -> String {
    "enclii/".to_string()
}

/// Registry provider configuration. Keeps the teacher's tagged-enum shape for
/// swapping between a managed ECR-style registry and a generic OCI-client-auth
/// registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RegistrySettings {
    Ecr {
        region: String,
        account_id: String,
        #[serde(default = "default_repo_prefix")]
        repo_prefix: String,
        role_arn: String,
        push_role_arn: String,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    #[serde(rename = "oci-client-auth", alias = "docker")]
    OciClientAuth {
        registry_url: String,
        #[serde(default)]
        namespace: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

fn default_namespace_format() -> String {
    "enclii-{project_name}".to_string()
}

fn default_ingress_class() -> String {
    "nginx".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesSettings {
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,
    /// Namespace template. Must contain `{project_name}`.
    #[serde(default = "default_namespace_format")]
    pub namespace_format: String,
    #[serde(default)]
    pub node_selector: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    pub api_token: String,
    pub zone_name: String,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSettings {
    pub api_token: String,
    pub account_id: String,
    pub tunnel_id: String,
    pub tunnel_domain_suffix: String,
    pub api_base_url: String,
}

fn default_secret_expiry_secs() -> i64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    pub secret: String,
    #[serde(default)]
    pub previous_secret: Option<String>,
    #[serde(default = "default_secret_expiry_secs")]
    pub previous_secret_expires_in_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EncryptionSettings {
    Local {
        key: String,
    },
    AwsKms {
        region: String,
        key_id: String,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

fn default_build_timeout_secs() -> u64 {
    1800
}

fn default_sbom_timeout_secs() -> u64 {
    300
}

fn default_sign_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildSettings {
    #[serde(default = "default_build_timeout_secs")]
    pub pipeline_timeout_secs: u64,
    #[serde(default = "default_sbom_timeout_secs")]
    pub sbom_timeout_secs: u64,
    #[serde(default = "default_sign_timeout_secs")]
    pub sign_timeout_secs: u64,
    #[serde(default)]
    pub cache_prefix: Option<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            pipeline_timeout_secs: default_build_timeout_secs(),
            sbom_timeout_secs: default_sbom_timeout_secs(),
            sign_timeout_secs: default_sign_timeout_secs(),
            cache_prefix: None,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("ENCLII_CONFIG_DIR").unwrap_or_else(|_| "/config".into());

        let mut settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{config_dir}/default.toml")))
            .add_source(File::with_name(&format!("{config_dir}/{run_mode}")).required(false))
            .add_source(File::with_name(&format!("{config_dir}/local")).required(false))
            .add_source(Environment::with_prefix("ENCLII").separator("__"))
            .build()?
            .try_deserialize()?;

        if let Ok(database_url) = env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                settings.database.url = database_url;
            }
        }

        if settings.database.url.is_empty() {
            return Err(ConfigError::Message(
                "database URL not configured: set DATABASE_URL or [database] url in config"
                    .to_string(),
            ));
        }

        Self::validate_format_string(
            &settings.kubernetes.namespace_format,
            "namespace_format",
            "{project_name}",
        )?;

        Ok(settings)
    }

    fn validate_format_string(
        format_str: &str,
        field_name: &str,
        required_placeholder: &str,
    ) -> Result<(), ConfigError> {
        if !format_str.contains(required_placeholder) {
            return Err(ConfigError::Message(format!(
                "configuration error: '{field_name}' must contain '{required_placeholder}' placeholder, got '{format_str}'"
            )));
        }
        Ok(())
    }
}
