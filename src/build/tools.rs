//! SBOM generation and image signing: both shell out to an external CLI
//! (`syft`, `cosign`) that may not be installed, so every call is gated
//! behind a presence probe first. Mirrors `build/docker.rs`'s
//! `Command::new(cli).arg("--version")` tool-check idiom.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{EncliiError, ErrorKind};

pub async fn tool_is_available(cli: &str) -> bool {
    Command::new(cli).arg("--version").output().await.map(|o| o.status.success()).unwrap_or(false)
}

/// Generates an SBOM for `image_ref` using `syft`, returning `(format,
/// content)`. Failure here is non-fatal to the release per §4.3 — the
/// caller logs and continues rather than propagating to the build's
/// terminal status.
pub async fn generate_sbom(image_ref: &str, inner_timeout: Duration) -> Result<(String, String), EncliiError> {
    if !tool_is_available("syft").await {
        return Err(EncliiError::new(ErrorKind::NotFound, "syft is not installed"));
    }

    let output = timeout(inner_timeout, Command::new("syft").args(["scan", image_ref, "-o", "cyclonedx-json"]).output())
        .await
        .map_err(|_| EncliiError::new(ErrorKind::Timeout, "sbom generation timed out"))?
        .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to spawn syft: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncliiError::new(ErrorKind::Upstream, format!("syft failed: {stderr}")));
    }

    Ok(("cyclonedx-json".to_string(), String::from_utf8_lossy(&output.stdout).to_string()))
}

/// Signs `image_ref` keylessly using `cosign`, returning the signature
/// bundle. Failure here is non-fatal per §4.3.
pub async fn sign_image(image_ref: &str, inner_timeout: Duration) -> Result<String, EncliiError> {
    if !tool_is_available("cosign").await {
        return Err(EncliiError::new(ErrorKind::NotFound, "cosign is not installed"));
    }

    let output = timeout(inner_timeout, Command::new("cosign").args(["sign", "--yes", image_ref]).output())
        .await
        .map_err(|_| EncliiError::new(ErrorKind::Timeout, "image signing timed out"))?
        .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to spawn cosign: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncliiError::new(ErrorKind::Upstream, format!("cosign failed: {stderr}")));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_is_not_available() {
        assert!(!tool_is_available("enclii-definitely-not-a-real-binary").await);
    }

    #[tokio::test]
    async fn sbom_generation_fails_fast_when_syft_absent() {
        let err = generate_sbom("registry.example.com/x:y", Duration::from_secs(1)).await;
        if !tool_is_available("syft").await {
            assert!(err.is_err());
        }
    }
}
