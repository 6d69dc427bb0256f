use oci_distribution::{secrets::RegistryAuth, Client, Reference};

use super::error::OciError;

/// Resolves image references to digest-pinned references against the OCI
/// distribution API, used to verify release image provenance (SPEC_FULL.md §8:
/// "∀ releases R in state ready: registry GET on R.image_uri returns a manifest").
pub struct OciClient {
    client: Client,
}

impl Default for OciClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OciClient {
    pub fn new() -> Self {
        Self { client: Client::new(Default::default()) }
    }

    /// Fetches the manifest only (a few KB) and returns `registry/repo@sha256:digest`.
    pub async fn resolve_image_digest(&self, image_ref: &str) -> Result<String, OciError> {
        let reference = Reference::try_from(image_ref).map_err(|e| OciError::InvalidReference(format!("{image_ref}: {e}")))?;

        let auth = RegistryAuth::Anonymous;
        let (_manifest, digest) = self
            .client
            .pull_manifest(&reference, &auth)
            .await
            .map_err(|e| classify_error(e, image_ref))?;

        Ok(format!("{}{}@{}", reference.registry(), reference.repository(), digest))
    }
}

fn classify_error(err: oci_distribution::errors::OciDistributionError, image: &str) -> OciError {
    let error_string = err.to_string();
    if error_string.contains("404") || error_string.contains("not found") {
        OciError::ImageNotFound(image.to_string())
    } else if error_string.contains("401") || error_string.contains("403") || error_string.contains("unauthorized") {
        OciError::PrivateImage(image.to_string())
    } else {
        OciError::Network(error_string)
    }
}
