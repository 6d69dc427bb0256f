//! Registry credential vending: scoped push credentials for ECR, or a thin
//! pass-through for registries the operator has already authenticated
//! against out-of-band (client-side `docker login`).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ecr::Client as EcrClient;
use aws_sdk_sts::Client as StsClient;
use base64::Engine;

use crate::error::{EncliiError, ErrorKind, ResultExt};
use crate::settings::RegistrySettings;

#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub registry_url: String,
    pub username: String,
    pub password: String,
    pub expires_in_secs: Option<u64>,
}

/// Narrow capability over the one thing the build pipeline needs from a
/// registry provider: push-scoped credentials for a given repository, plus
/// the registry host the resulting image tag is addressed under.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    async fn push_credentials(&self, repository: &str) -> Result<RegistryCredentials, EncliiError>;
    fn registry_host(&self) -> &str;
}

pub struct EcrRegistryProvider {
    region: String,
    account_id: String,
    repo_prefix: String,
    push_role_arn: String,
    sts_client: StsClient,
    registry_host: String,
}

impl EcrRegistryProvider {
    pub async fn new(region: String, account_id: String, repo_prefix: String, push_role_arn: String, access_key_id: Option<String>, secret_access_key: Option<String>) -> Self {
        let aws_config = if let (Some(access_key), Some(secret_key)) = (&access_key_id, &secret_access_key) {
            let creds = aws_sdk_ecr::config::Credentials::new(access_key, secret_key, None, None, "static");
            aws_config::defaults(BehaviorVersion::latest())
                .credentials_provider(creds)
                .region(aws_config::Region::new(region.clone()))
                .load()
                .await
        } else {
            aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(region.clone()))
                .load()
                .await
        };

        let sts_client = StsClient::new(&aws_config);
        let registry_host = format!("{account_id}.dkr.ecr.{region}.amazonaws.com");

        Self {
            region,
            account_id,
            repo_prefix,
            push_role_arn,
            sts_client,
            registry_host,
        }
    }
}

#[async_trait]
impl RegistryProvider for EcrRegistryProvider {
    async fn push_credentials(&self, repository: &str) -> Result<RegistryCredentials, EncliiError> {
        tracing::info!(repository, "requesting scoped ecr push credentials");

        let full_path = format!("{}{repository}", self.repo_prefix);
        let repo_arn = format!("arn:aws:ecr:{}:{}:repository/{full_path}*", self.region, self.account_id);

        let inline_policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": ["ecr:GetAuthorizationToken"],
                "Resource": "*"
            }, {
                "Effect": "Allow",
                "Action": [
                    "ecr:BatchCheckLayerAvailability",
                    "ecr:InitiateLayerUpload",
                    "ecr:UploadLayerPart",
                    "ecr:CompleteLayerUpload",
                    "ecr:PutImage",
                    "ecr:BatchGetImage",
                    "ecr:GetDownloadUrlForLayer"
                ],
                "Resource": repo_arn
            }]
        });

        let assumed_role = self
            .sts_client
            .assume_role()
            .role_arn(&self.push_role_arn)
            .role_session_name(format!("enclii-push-{repository}"))
            .policy(inline_policy.to_string())
            .send()
            .await
            .into_kind(ErrorKind::Upstream, "sts assume_role for ecr push")?;

        let creds = assumed_role
            .credentials()
            .ok_or_else(|| EncliiError::upstream("no credentials in assume_role response"))?;

        let expiration: Option<std::time::SystemTime> = std::time::SystemTime::try_from(creds.expiration().clone()).ok();
        let scoped_creds = aws_sdk_ecr::config::Credentials::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            Some(creds.session_token().to_string()),
            expiration,
            "assume_role",
        );

        let scoped_config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(scoped_creds)
            .region(aws_config::Region::new(self.region.clone()))
            .load()
            .await;
        let ecr_client = EcrClient::new(&scoped_config);

        let response = ecr_client
            .get_authorization_token()
            .send()
            .await
            .into_kind(ErrorKind::Upstream, "ecr get_authorization_token")?;

        let auth_data = response
            .authorization_data()
            .first()
            .ok_or_else(|| EncliiError::upstream("no authorization data in ecr response"))?;
        let token = auth_data.authorization_token().ok_or_else(|| EncliiError::upstream("no authorization token in ecr response"))?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .into_kind(ErrorKind::Upstream, "decode ecr auth token")?;
        let decoded_str = String::from_utf8(decoded).into_kind(ErrorKind::Upstream, "ecr token is not utf-8")?;
        let (username, password) = decoded_str
            .split_once(':')
            .ok_or_else(|| EncliiError::upstream("malformed ecr auth token"))?;

        Ok(RegistryCredentials {
            registry_url: self.registry_host.clone(),
            username: username.to_string(),
            password: password.to_string(),
            expires_in_secs: Some(12 * 60 * 60),
        })
    }

    fn registry_host(&self) -> &str {
        &self.registry_host
    }
}

/// For registries the operator authenticates against with their own tooling
/// (`docker login`) ahead of time; the pipeline gets a registry host to
/// address images under but no credentials to vend.
pub struct OciClientAuthRegistryProvider {
    registry_host: String,
    username: Option<String>,
    password: Option<String>,
}

impl OciClientAuthRegistryProvider {
    pub fn new(registry_url: String, username: Option<String>, password: Option<String>) -> Self {
        Self { registry_host: registry_url, username, password }
    }
}

#[async_trait]
impl RegistryProvider for OciClientAuthRegistryProvider {
    async fn push_credentials(&self, _repository: &str) -> Result<RegistryCredentials, EncliiError> {
        Ok(RegistryCredentials {
            registry_url: self.registry_host.clone(),
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            expires_in_secs: None,
        })
    }

    fn registry_host(&self) -> &str {
        &self.registry_host
    }
}

pub async fn provider_from_settings(settings: &RegistrySettings) -> Box<dyn RegistryProvider> {
    match settings.clone() {
        RegistrySettings::Ecr { region, account_id, repo_prefix, push_role_arn, access_key_id, secret_access_key, .. } => {
            Box::new(EcrRegistryProvider::new(region, account_id, repo_prefix, push_role_arn, access_key_id, secret_access_key).await)
        }
        RegistrySettings::OciClientAuth { registry_url, username, password, .. } => Box::new(OciClientAuthRegistryProvider::new(registry_url, username, password)),
    }
}
