//! Build cache: content-addressed, project-scoped cache of build metadata,
//! backed by an object store. See SPEC_FULL.md §4.1.

mod fingerprint;
mod objectstore;

pub use fingerprint::{builder_fingerprint, deps_fingerprint, monorepo_fingerprint};
pub use objectstore::{InMemoryObjectStore, ObjectStore, S3ObjectStore};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache as AsyncCache;

use crate::error::EncliiError;
use crate::model::{BuildCacheKey, BuildCacheMetadata};

/// Advisory at-most-one-in-flight-build record (I3). A short-lived TTL entry
/// keyed by the metadata object key; the cache itself never blocks on it, the
/// build orchestrator consults it before starting a build.
pub struct BuildDedupeCache {
    inflight: AsyncCache<String, ()>,
}

impl BuildDedupeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inflight: AsyncCache::builder().time_to_live(ttl).build(),
        }
    }

    /// Returns true if this caller won the race to start the build (i.e. no
    /// other build for this key was already in flight).
    pub async fn try_claim(&self, key: &str) -> bool {
        if self.inflight.get(key).await.is_some() {
            return false;
        }
        self.inflight.insert(key.to_string(), ()).await;
        true
    }

    pub async fn release(&self, key: &str) {
        self.inflight.invalidate(key).await;
    }
}

pub struct BuildCache {
    store: Arc<dyn ObjectStore>,
    dedupe: BuildDedupeCache,
}

impl BuildCache {
    pub fn new(store: Arc<dyn ObjectStore>, build_dedupe_ttl: Duration) -> Self {
        Self {
            store,
            dedupe: BuildDedupeCache::new(build_dedupe_ttl),
        }
    }

    pub async fn try_claim_build(&self, key: &BuildCacheKey) -> bool {
        self.dedupe.try_claim(&key.metadata_object_key()).await
    }

    pub async fn release_build(&self, key: &BuildCacheKey) {
        self.dedupe.release(&key.metadata_object_key()).await;
    }

    /// Returns `None` on a cache miss; never turns "not found" into an error.
    pub async fn lookup(&self, key: &BuildCacheKey) -> Result<Option<BuildCacheMetadata>, EncliiError> {
        let object_key = key.metadata_object_key();
        match self.store.download(&object_key).await {
            Ok(bytes) => {
                let mut metadata: BuildCacheMetadata = serde_json::from_slice(&bytes)
                    .map_err(|e| EncliiError::internal(format!("corrupt cache metadata at {object_key}: {e}")))?;
                metadata.hit_count += 1;
                metadata.last_hit = Utc::now();
                Ok(Some(metadata))
            }
            Err(e) if e.kind == crate::error::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, metadata: &BuildCacheMetadata) -> Result<(), EncliiError> {
        let object_key = metadata.key.metadata_object_key();
        let bytes = serde_json::to_vec(metadata)
            .map_err(|e| EncliiError::internal(format!("failed to serialize cache metadata: {e}")))?;
        self.store.upload(&object_key, bytes).await
    }

    /// Deletes entries whose `last_hit`/`created_at` predate `cutoff`. Failures
    /// on individual deletes are logged by the caller via the returned error
    /// count mismatch; deletion continues past individual failures.
    pub async fn evict(&self, project_prefix: &str, cutoff: chrono::DateTime<Utc>) -> Result<u64, EncliiError> {
        let keys = self.store.list(&format!("build-cache/{project_prefix}")).await?;
        let mut evicted = 0u64;
        for object_key in keys {
            let bytes = match self.store.download(&object_key).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            let metadata: BuildCacheMetadata = match serde_json::from_slice(&bytes) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.last_hit < cutoff || metadata.created_at < cutoff {
                if self.store.delete(&object_key).await.is_ok() {
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    fn key() -> BuildCacheKey {
        BuildCacheKey {
            project_id: Uuid::new_v4(),
            service_name: "api".into(),
            deps_hash: "abc1230000000000".into(),
            builder_hash: "default".into(),
        }
    }

    #[tokio::test]
    async fn lookup_on_empty_store_is_a_miss_not_an_error() {
        let cache = BuildCache::new(Arc::new(InMemoryObjectStore::default()), StdDuration::from_secs(60));
        let result = cache.lookup(&key()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn save_then_lookup_round_trips_and_increments_hit_count() {
        let cache = BuildCache::new(Arc::new(InMemoryObjectStore::default()), StdDuration::from_secs(60));
        let k = key();
        let metadata = BuildCacheMetadata {
            key: k.clone(),
            cache_image_uri: "registry/cache:abc".into(),
            hit_count: 0,
            last_hit: Utc::now(),
            size_bytes: 1024,
            created_at: Utc::now(),
        };
        cache.save(&metadata).await.unwrap();
        let hit = cache.lookup(&k).await.unwrap().unwrap();
        assert_eq!(hit.hit_count, 1);
        assert_eq!(hit.cache_image_uri, "registry/cache:abc");
    }

    #[tokio::test]
    async fn dedupe_cache_only_lets_one_caller_claim_a_key() {
        let cache = BuildCache::new(Arc::new(InMemoryObjectStore::default()), StdDuration::from_secs(60));
        let k = key();
        assert!(cache.try_claim_build(&k).await);
        assert!(!cache.try_claim_build(&k).await);
        cache.release_build(&k).await;
        assert!(cache.try_claim_build(&k).await);
    }
}
