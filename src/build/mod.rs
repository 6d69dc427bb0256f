//! Build Orchestrator: clone -> detect -> build -> SBOM -> sign -> cleanup.
//! See SPEC_FULL.md §4.3.

mod pipeline;
mod registry;
mod runtime;
mod tools;

pub use pipeline::{BuildOutcome, BuildPipeline, BuildPipelineConfig};
pub use registry::{provider_from_settings, EcrRegistryProvider, OciClientAuthRegistryProvider, RegistryCredentials, RegistryProvider};
pub use runtime::{CliRuntimeBridge, ContainerRuntimeBridge, LogRing};
pub use tools::{generate_sbom, sign_image, tool_is_available};

use crate::model::BuildStrategy;
use std::path::Path;

const BUILDPACK_MANIFESTS: &[&str] = &[
    "package.json",
    "go.mod",
    "requirements.txt",
    "Gemfile",
    "pom.xml",
    "Cargo.toml",
];

/// Detects the build strategy for a cloned workspace when the service's
/// `build_config.strategy` is `Auto`. A root `Dockerfile` wins; otherwise any
/// well-known manifest selects buildpack; the fallback is buildpack.
pub fn detect_strategy(workspace: &Path) -> BuildStrategy {
    if workspace.join("Dockerfile").is_file() {
        return BuildStrategy::Dockerfile;
    }
    if BUILDPACK_MANIFESTS.iter().any(|m| workspace.join(m).is_file()) {
        return BuildStrategy::Buildpack;
    }
    BuildStrategy::Buildpack
}

/// Builds the output image tag deterministically: timestamp plus short SHA
/// guarantees distinct tags across consecutive builds of the same commit.
pub fn output_tag(registry: &str, service_name: &str, now: chrono::DateTime<chrono::Utc>, git_sha: &str) -> String {
    let short_sha: String = git_sha.chars().take(7).collect();
    format!("{registry}/{service_name}:v{}-{short_sha}", now.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn detects_dockerfile_over_manifests() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_strategy(dir.path()), BuildStrategy::Dockerfile);
    }

    #[test]
    fn detects_buildpack_from_manifest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("go.mod"), "module x").unwrap();
        assert_eq!(detect_strategy(dir.path()), BuildStrategy::Buildpack);
    }

    #[test]
    fn output_tags_differ_for_consecutive_builds_of_same_sha() {
        let t1 = chrono::Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);
        let tag1 = output_tag("registry.example.com", "api", t1, "abc1234def5");
        let tag2 = output_tag("registry.example.com", "api", t2, "abc1234def5");
        assert_ne!(tag1, tag2);
        assert!(tag1.starts_with("registry.example.com/api:v"));
    }
}
