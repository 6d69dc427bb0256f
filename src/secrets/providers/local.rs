//! AES-256-GCM secret encryption, carried near-verbatim from the teacher's
//! `encryption/providers/local.rs`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{EncliiError, ErrorKind};

use super::super::EncryptionProvider;

pub struct LocalEncryptionProvider {
    cipher: Aes256Gcm,
}

impl LocalEncryptionProvider {
    pub fn new(key_base64: &str) -> Result<Self, EncliiError> {
        let key_bytes = BASE64
            .decode(key_base64)
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("failed to decode encryption key from base64: {e}")))?;

        if key_bytes.len() != 32 {
            return Err(EncliiError::new(
                ErrorKind::Internal,
                format!("encryption key must be 32 bytes (256 bits) for AES-256-GCM, got {} bytes", key_bytes.len()),
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("failed to create AES-256-GCM cipher: {e}")))?;

        Ok(Self { cipher })
    }
}

#[async_trait]
impl EncryptionProvider for LocalEncryptionProvider {
    async fn encrypt(&self, plaintext: &str) -> Result<String, EncliiError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("encryption failed: {e}")))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    async fn decrypt(&self, ciphertext_base64: &str) -> Result<String, EncliiError> {
        let combined = BASE64
            .decode(ciphertext_base64)
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("failed to decode ciphertext from base64: {e}")))?;

        if combined.len() < 12 {
            return Err(EncliiError::new(ErrorKind::Internal, "invalid ciphertext: too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext_bytes)
            .map_err(|e| EncliiError::new(ErrorKind::Internal, format!("decrypted data is not valid UTF-8: {e}")))
    }

    fn provider_name(&self) -> &str {
        "local-aes-256-gcm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key() -> String {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let provider = LocalEncryptionProvider::new(&random_key()).unwrap();
        let ciphertext = provider.encrypt("my secret password").await.unwrap();
        assert_eq!(provider.decrypt(&ciphertext).await.unwrap(), "my secret password");
    }

    #[tokio::test]
    async fn nonces_differ_across_calls() {
        let provider = LocalEncryptionProvider::new(&random_key()).unwrap();
        let a = provider.encrypt("same message").await.unwrap();
        let b = provider.encrypt("same message").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(provider.decrypt(&a).await.unwrap(), "same message");
        assert_eq!(provider.decrypt(&b).await.unwrap(), "same message");
    }

    #[test]
    fn rejects_short_key() {
        let short_key = BASE64.encode(b"tooshort");
        assert!(LocalEncryptionProvider::new(&short_key).is_err());
    }
}
