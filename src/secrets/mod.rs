//! Secret & Env Manager: set/list/reveal/delete environment variables, with
//! secrets encrypted at rest and masked everywhere except the explicit
//! reveal path (I6). See SPEC_FULL.md §4.7.

pub mod providers;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::EncliiError;
use crate::reconcile::EnvResolver;
use crate::settings::EncryptionSettings;
use crate::store::EnvVarStore;

const MASK: &str = "••••••••";

/// Encrypt/decrypt a secret's at-rest representation. Implemented by
/// `providers::local::LocalEncryptionProvider` (AES-256-GCM) or
/// `providers::aws_kms::AwsKmsEncryptionProvider`, selected by
/// `EncryptionSettings` exactly the way the teacher's `encryption::init_provider` does.
#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String, EncliiError>;
    async fn decrypt(&self, ciphertext: &str) -> Result<String, EncliiError>;
    fn provider_name(&self) -> &str;
}

pub async fn init_provider(settings: Option<&EncryptionSettings>) -> Result<Option<Arc<dyn EncryptionProvider>>, EncliiError> {
    let Some(settings) = settings else { return Ok(None) };
    let provider: Arc<dyn EncryptionProvider> = match settings {
        EncryptionSettings::Local { key } => Arc::new(providers::LocalEncryptionProvider::new(key)?),
        EncryptionSettings::AwsKms { region, key_id, access_key_id, secret_access_key } => {
            Arc::new(providers::AwsKmsEncryptionProvider::new(region, key_id.clone(), access_key_id.clone(), secret_access_key.clone()).await)
        }
    };
    Ok(Some(provider))
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvVarView {
    pub id: Uuid,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
}

fn mask(value: String, is_secret: bool) -> String {
    if is_secret {
        MASK.to_string()
    } else {
        value
    }
}

/// Sets, masks, and reveals a service's environment variables, and resolves
/// the plaintext set a deployment's containers should run with.
pub struct EnvVarManager {
    store: Arc<dyn EnvVarStore>,
    encryption: Arc<dyn EncryptionProvider>,
    audit: Arc<dyn AuditSink>,
}

impl EnvVarManager {
    pub fn new(store: Arc<dyn EnvVarStore>, encryption: Arc<dyn EncryptionProvider>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, encryption, audit }
    }

    pub async fn set(&self, service_id: Uuid, environment_id: Option<Uuid>, key: &str, value: &str, is_secret: bool) -> Result<EnvVarView, EncliiError> {
        let stored_value = if is_secret { self.encryption.encrypt(value).await? } else { value.to_string() };
        let env_var = self.store.set(service_id, environment_id, key, &stored_value, is_secret).await?;
        Ok(EnvVarView { id: env_var.id, key: env_var.key, value: mask(stored_value, is_secret), is_secret })
    }

    pub async fn bulk_set(&self, service_id: Uuid, environment_id: Option<Uuid>, vars: &[(String, String, bool)]) -> Result<Vec<EnvVarView>, EncliiError> {
        let mut views = Vec::with_capacity(vars.len());
        for (key, value, is_secret) in vars {
            views.push(self.set(service_id, environment_id, key, value, *is_secret).await?);
        }
        Ok(views)
    }

    pub async fn list(&self, service_id: Uuid, environment_id: Option<Uuid>) -> Result<Vec<EnvVarView>, EncliiError> {
        let env_vars = self.store.list(service_id, environment_id).await?;
        Ok(env_vars
            .into_iter()
            .map(|v| EnvVarView { id: v.id, key: v.key, value: mask(v.value, v.is_secret), is_secret: v.is_secret })
            .collect())
    }

    /// Unmasks a single env var and emits an audit event (I6). Called by the
    /// out-of-scope HTTP layer's reveal endpoint, which is responsible for
    /// resolving `actor` from the authenticated principal.
    pub async fn reveal(&self, id: Uuid, actor: &str) -> Result<EnvVarView, EncliiError> {
        let env_var = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EncliiError::not_found(format!("env var {id} not found")))?;

        let plaintext = if env_var.is_secret { self.encryption.decrypt(&env_var.value).await? } else { env_var.value.clone() };

        self.audit
            .record(
                AuditEvent::new("env_var.reveal", "env_var", id)
                    .with_actor(actor)
                    .with_metadata(serde_json::json!({ "key": env_var.key, "service_id": env_var.service_id })),
            )
            .await;

        Ok(EnvVarView { id: env_var.id, key: env_var.key, value: plaintext, is_secret: env_var.is_secret })
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), EncliiError> {
        self.store.delete(id).await
    }
}

#[async_trait]
impl EnvResolver for EnvVarManager {
    async fn resolve_for_deploy(&self, service_id: Uuid, environment_id: Uuid) -> Result<Vec<(String, String)>, EncliiError> {
        let env_vars = self.store.resolve_for_deploy(service_id, environment_id).await?;
        let mut resolved = Vec::with_capacity(env_vars.len());
        for env_var in env_vars {
            let value = if env_var.is_secret { self.encryption.decrypt(&env_var.value).await? } else { env_var.value };
            resolved.push((env_var.key, value));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::store::memory::InMemoryEnvVarStore;

    fn test_encryption_key() -> String {
        use aes_gcm::aead::OsRng;
        use aes_gcm::{Aes256Gcm, KeyInit};
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        BASE64.encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    async fn manager() -> EnvVarManager {
        let encryption: Arc<dyn EncryptionProvider> = Arc::new(providers::LocalEncryptionProvider::new(&test_encryption_key()).unwrap());
        EnvVarManager::new(Arc::new(InMemoryEnvVarStore::default()), encryption, Arc::new(TracingAuditSink))
    }

    #[tokio::test]
    async fn secret_values_are_masked_on_list() {
        let manager = manager().await;
        let service_id = Uuid::new_v4();
        manager.set(service_id, None, "DATABASE_URL", "postgres://secret", true).await.unwrap();

        let listed = manager.list(service_id, None).await.unwrap();
        assert_eq!(listed[0].value, MASK);
    }

    #[tokio::test]
    async fn reveal_returns_plaintext_and_audits() {
        let manager = manager().await;
        let service_id = Uuid::new_v4();
        let created = manager.set(service_id, None, "API_KEY", "sk-abc123", true).await.unwrap();

        let revealed = manager.reveal(created.id, "user-1").await.unwrap();
        assert_eq!(revealed.value, "sk-abc123");
    }

    #[tokio::test]
    async fn non_secret_values_pass_through_unmasked() {
        let manager = manager().await;
        let service_id = Uuid::new_v4();
        manager.set(service_id, None, "LOG_LEVEL", "debug", false).await.unwrap();

        let listed = manager.list(service_id, None).await.unwrap();
        assert_eq!(listed[0].value, "debug");
    }
}
