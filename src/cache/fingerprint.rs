//! Deterministic content fingerprints driving the build cache key.

use sha2::{Digest, Sha256};
use std::path::Path;

const DEPENDENCY_MANIFESTS: &[&str] = &[
    "package.json",
    "package-lock.json",
    "go.mod",
    "go.sum",
    "requirements.txt",
    "Pipfile.lock",
    "Cargo.lock",
    "pom.xml",
    "Gemfile.lock",
];

const BUILDER_MANIFESTS: &[&str] = &["Dockerfile", "project.toml", "service.yaml", "service.yml"];

const SKIP_PATTERNS: &[&str] = &[
    "/.git/",
    "/node_modules/",
    "/target/",
    "/dist/",
    "/build/",
    "/.DS_Store",
    "/__pycache__/",
    "/.venv/",
];

/// First 16 hex chars of a SHA-256 over `filename || contents` for each present
/// dependency manifest, in the fixed order above. If none are present, hashes
/// the current wall-clock time so the caller always gets a fresh fingerprint.
pub fn deps_fingerprint(workspace: &Path, now: chrono::DateTime<chrono::Utc>) -> String {
    let mut hasher = Sha256::new();
    let mut any_present = false;
    for filename in DEPENDENCY_MANIFESTS {
        let path = workspace.join(filename);
        if let Ok(contents) = std::fs::read(&path) {
            any_present = true;
            hasher.update(filename.as_bytes());
            hasher.update(&contents);
        }
    }
    if !any_present {
        hasher.update(now.to_rfc3339().as_bytes());
    }
    hex_prefix(hasher, 16)
}

/// First 8 hex chars of a SHA-256 over present builder-config files. Returns
/// the literal `default` when none are present.
pub fn builder_fingerprint(workspace: &Path) -> String {
    let mut hasher = Sha256::new();
    let mut any_present = false;
    for filename in BUILDER_MANIFESTS {
        let path = workspace.join(filename);
        if let Ok(contents) = std::fs::read(&path) {
            any_present = true;
            hasher.update(filename.as_bytes());
            hasher.update(&contents);
        }
    }
    if !any_present {
        return "default".to_string();
    }
    hex_prefix(hasher, 8)
}

/// Monorepo variant: restricts inputs to a sorted, whitelisted set of watch
/// paths, skipping well-known derived/VCS directories, ordered by sorted
/// traversal so the fingerprint is stable regardless of filesystem walk order.
pub fn monorepo_fingerprint(workspace: &Path, watch_paths: &[String]) -> String {
    let mut files = Vec::new();
    let mut sorted_watch = watch_paths.to_vec();
    sorted_watch.sort();

    for watch_path in &sorted_watch {
        let root = workspace.join(watch_path);
        collect_files(&root, &mut files);
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let relative = file.strip_prefix(workspace).unwrap_or(&file);
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        if SKIP_PATTERNS.iter().any(|p| format!("/{relative_str}").contains(p)) {
            continue;
        }
        if let Ok(contents) = std::fs::read(&file) {
            hasher.update(relative_str.as_bytes());
            hasher.update(&contents);
        }
    }
    hex_prefix(hasher, 16)
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

fn hex_prefix(hasher: Sha256, len: usize) -> String {
    let digest = hasher.finalize();
    let full = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    full.chars().take(len).collect()
}

/// Determines whether a service needs a rebuild given a monorepo watch-path
/// set and a list of changed files, per the "monorepo skip" scenario in
/// SPEC_FULL.md §8 scenario 3.
pub fn should_rebuild(watch_paths: &[String], changed_files: &[String]) -> bool {
    if watch_paths.is_empty() {
        return true;
    }
    changed_files
        .iter()
        .any(|changed| watch_paths.iter().any(|watch| changed.starts_with(watch.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn deps_fingerprint_is_stable_for_same_contents() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), b"{\"name\":\"x\"}").unwrap();
        let now = chrono::Utc::now();
        let a = deps_fingerprint(dir.path(), now);
        let b = deps_fingerprint(dir.path(), now);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn deps_fingerprint_changes_with_contents() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), b"{\"name\":\"x\"}").unwrap();
        let a = deps_fingerprint(dir.path(), chrono::Utc::now());
        fs::write(dir.path().join("package.json"), b"{\"name\":\"y\"}").unwrap();
        let b = deps_fingerprint(dir.path(), chrono::Utc::now());
        assert_ne!(a, b);
    }

    #[test]
    fn builder_fingerprint_defaults_when_no_manifest_present() {
        let dir = tempdir().unwrap();
        assert_eq!(builder_fingerprint(dir.path()), "default");
    }

    #[test]
    fn monorepo_skip_true_when_unwatched_path_changes() {
        assert!(!should_rebuild(&["apps/api/".to_string()], &["apps/web/index.tsx".to_string()]));
        assert!(should_rebuild(&["apps/api/".to_string()], &["apps/api/main.rs".to_string()]));
    }
}
