//! AWS KMS-backed secret encryption, adapted from the teacher's
//! `encryption/providers/aws_kms.rs`.

use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{EncliiError, ErrorKind};

use super::super::EncryptionProvider;

pub struct AwsKmsEncryptionProvider {
    client: KmsClient,
    key_id: String,
}

impl AwsKmsEncryptionProvider {
    pub async fn new(region: &str, key_id: String, access_key_id: Option<String>, secret_access_key: Option<String>) -> Self {
        let config = if let (Some(access_key), Some(secret_key)) = (access_key_id, secret_access_key) {
            let creds = aws_sdk_kms::config::Credentials::new(access_key, secret_key, None, None, "static");
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .credentials_provider(creds)
                .load()
                .await
        } else {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        };

        let client = KmsClient::new(&config);
        Self { client, key_id }
    }
}

#[async_trait]
impl EncryptionProvider for AwsKmsEncryptionProvider {
    async fn encrypt(&self, plaintext: &str) -> Result<String, EncliiError> {
        let response = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext.as_bytes()))
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("KMS encryption failed: {e}")))?;

        let ciphertext_blob = response
            .ciphertext_blob()
            .ok_or_else(|| EncliiError::new(ErrorKind::Upstream, "no ciphertext blob in KMS response"))?;

        Ok(BASE64.encode(ciphertext_blob.as_ref()))
    }

    async fn decrypt(&self, ciphertext_base64: &str) -> Result<String, EncliiError> {
        let ciphertext_bytes = BASE64
            .decode(ciphertext_base64)
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("failed to decode ciphertext from base64: {e}")))?;

        let response = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext_bytes))
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("KMS decryption failed: {e}")))?;

        let plaintext_blob = response
            .plaintext()
            .ok_or_else(|| EncliiError::new(ErrorKind::Upstream, "no plaintext in KMS response"))?;

        String::from_utf8(plaintext_blob.clone().into_inner())
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("decrypted data is not valid UTF-8: {e}")))
    }

    fn provider_name(&self) -> &str {
        "aws-kms"
    }
}
