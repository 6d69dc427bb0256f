//! Git Fetcher: clone/validate a ref into an ephemeral workspace, with
//! cancellation observable through a `CancellationToken`. See SPEC_FULL.md §4.2.

use std::path::PathBuf;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{EncliiError, ErrorKind};

pub struct ClonedWorkspace {
    pub path: PathBuf,
    pub sha: String,
}

impl ClonedWorkspace {
    /// Idempotent: safe to call more than once, including after the directory
    /// has already been removed.
    pub async fn cleanup(&self) {
        let _ = tokio::fs::remove_dir_all(&self.path).await;
    }
}

pub struct GitFetcher {
    workdir: PathBuf,
}

impl GitFetcher {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }

    /// Clones `repo_url` at `git_ref`, which may be a full 40-char commit SHA
    /// or a branch/tag name. Prefers a depth-1 clone when `git_ref` looks like
    /// a full SHA, falling back to a full clone if the shallow clone rejects it.
    pub async fn clone(&self, repo_url: &str, git_ref: &str, cancel: &CancellationToken) -> Result<ClonedWorkspace, EncliiError> {
        if git_ref.len() < 7 {
            return Err(EncliiError::new(ErrorKind::Validation, format!("git ref '{git_ref}' is shorter than 7 characters")));
        }

        let short_sha: String = git_ref.chars().take(7).collect();
        let dest = self.workdir.join(format!("build-{short_sha}"));
        let _ = tokio::fs::remove_dir_all(&dest).await;

        let is_full_sha = git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit());

        let clone_result = if is_full_sha {
            self.run_cancellable(
                Command::new("git").args(["clone", "--depth", "1", "--branch", git_ref, repo_url, dest.to_str().unwrap_or_default()]),
                cancel,
            )
            .await
        } else {
            self.run_cancellable(
                Command::new("git").args(["clone", repo_url, dest.to_str().unwrap_or_default()]),
                cancel,
            )
            .await
        };

        if clone_result.is_err() {
            // Shallow clone of a bare SHA fails because git can't resolve an
            // arbitrary commit as a shallow branch ref; retry with a full clone.
            let _ = tokio::fs::remove_dir_all(&dest).await;
            self.run_cancellable(
                Command::new("git").args(["clone", repo_url, dest.to_str().unwrap_or_default()]),
                cancel,
            )
            .await?;
            self.run_cancellable(
                Command::new("git").args(["-C", dest.to_str().unwrap_or_default(), "checkout", git_ref]),
                cancel,
            )
            .await?;
        } else if !is_full_sha {
            self.run_cancellable(
                Command::new("git").args(["-C", dest.to_str().unwrap_or_default(), "checkout", git_ref]),
                cancel,
            )
            .await?;
        }

        let sha = self.resolved_sha(&dest, cancel).await?;

        Ok(ClonedWorkspace { path: dest, sha })
    }

    /// Lists refs on the remote without materializing a working copy.
    pub async fn validate(&self, repo_url: &str, cancel: &CancellationToken) -> Result<(), EncliiError> {
        self.run_cancellable(Command::new("git").args(["ls-remote", "--exit-code", repo_url]), cancel).await?;
        Ok(())
    }

    async fn resolved_sha(&self, dest: &std::path::Path, cancel: &CancellationToken) -> Result<String, EncliiError> {
        let output = self
            .run_cancellable_output(Command::new("git").args(["-C", dest.to_str().unwrap_or_default(), "rev-parse", "HEAD"]), cancel)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_cancellable(&self, command: &mut Command, cancel: &CancellationToken) -> Result<(), EncliiError> {
        self.run_cancellable_output(command, cancel).await.map(|_| ())
    }

    async fn run_cancellable_output(&self, command: &mut Command, cancel: &CancellationToken) -> Result<std::process::Output, EncliiError> {
        let mut child = command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to spawn git: {e}")))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(EncliiError::cancelled("git operation cancelled"))
            }
            result = child.wait_with_output() => {
                let output = result.map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("git process error: {e}")))?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(EncliiError::new(ErrorKind::Upstream, format!("git command failed: {stderr}")));
                }
                Ok(output)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_short_sha() {
        let fetcher = GitFetcher::new(std::env::temp_dir());
        let cancel = CancellationToken::new();
        let err = fetcher.clone("https://example.invalid/repo.git", "abc12", &cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
