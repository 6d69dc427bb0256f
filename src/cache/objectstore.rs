use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{EncliiError, ErrorKind};

/// Narrow capability trait over a blob store, in the shape of the other
/// swap-point traits (`RegistryProvider`-style): upload/download/list/delete,
/// nothing else. The production implementation wraps `aws-sdk-s3`; tests use
/// `InMemoryObjectStore`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), EncliiError>;
    async fn download(&self, key: &str) -> Result<Vec<u8>, EncliiError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, EncliiError>;
    async fn delete(&self, key: &str) -> Result<(), EncliiError>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(bucket: String, region: Option<String>, endpoint: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared_config = loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        let client = aws_sdk_s3::Client::from_conf(s3_config.build());
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), EncliiError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(bytes.into())
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("s3 put_object {key}: {e}")))?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, EncliiError> {
        let output = self.client.get_object().bucket(&self.bucket).key(key).send().await.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("NoSuchKey") || msg.contains("NotFound") {
                EncliiError::new(ErrorKind::NotFound, format!("object not found: {key}"))
            } else {
                EncliiError::new(ErrorKind::Upstream, format!("s3 get_object {key}: {msg}"))
            }
        })?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("s3 body read {key}: {e}")))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, EncliiError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("s3 list_objects_v2 {prefix}: {e}")))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), EncliiError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("s3 delete_object {key}: {e}")))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), EncliiError> {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, EncliiError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| EncliiError::new(ErrorKind::NotFound, format!("object not found: {key}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, EncliiError> {
        Ok(self.objects.lock().unwrap().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), EncliiError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryObjectStore::default();
        store.upload("a/b.json", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.download("a/b.json").await.unwrap(), b"hello");
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/b.json".to_string()]);
        store.delete("a/b.json").await.unwrap();
        assert!(store.download("a/b.json").await.is_err());
    }
}
