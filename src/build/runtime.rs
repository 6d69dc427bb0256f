//! Container runtime bridge: build an image from a cloned workspace and push
//! it to a registry, streaming logs as it goes.
//!
//! Shells out to the system container CLI (`docker` or `podman`) via
//! `tokio::process::Command` rather than talking to the daemon API directly —
//! the async counterpart of the teacher's `build/docker.rs`, which drives the
//! same CLI synchronously; adapted here so build/push compose with
//! `tokio::select!`/`CancellationToken` the way `gitfetch.rs` does.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{EncliiError, ErrorKind};

use super::registry::RegistryCredentials;

/// Bounded ring buffer for build log lines: oldest lines are dropped once the
/// cap is hit, with a marker line recording that truncation happened (§5).
pub struct LogRing {
    lines: Vec<String>,
    cap: usize,
    dropped: u64,
}

impl LogRing {
    pub fn new(cap: usize) -> Self {
        Self { lines: Vec::new(), cap, dropped: 0 }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.cap {
            self.lines.remove(0);
            self.dropped += 1;
        }
        self.lines.push(line);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dropped > 0 {
            out.push_str(&format!("[... {} earlier lines dropped ...]\n", self.dropped));
        }
        out.push_str(&self.lines.join("\n"));
        out
    }
}

/// Narrow capability over the container engine: build, push, capture logs.
/// A test double can substitute an in-memory fake that records calls without
/// a real daemon.
#[async_trait]
pub trait ContainerRuntimeBridge: Send + Sync {
    async fn build(&self, workspace: &Path, dockerfile_rel: Option<&str>, image_tag: &str, build_args: &HashMap<String, String>, log: &mut LogRing, cancel: &CancellationToken) -> Result<(), EncliiError>;

    async fn push(&self, image_tag: &str, credentials: &RegistryCredentials, log: &mut LogRing, cancel: &CancellationToken) -> Result<(), EncliiError>;
}

pub struct CliRuntimeBridge {
    container_cli: String,
}

impl CliRuntimeBridge {
    pub fn new(container_cli: impl Into<String>) -> Self {
        Self { container_cli: container_cli.into() }
    }

    async fn stream_output(&self, mut command: Command, log: &mut LogRing, cancel: &CancellationToken) -> Result<(), EncliiError> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("failed to spawn {}: {e}", self.container_cli)))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EncliiError::cancelled(format!("{} operation cancelled", self.container_cli)));
                }
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => log.push(l),
                        Ok(None) => {}
                        Err(e) => return Err(EncliiError::new(ErrorKind::Upstream, format!("stdout read error: {e}"))),
                    }
                }
                line = stderr_lines.next_line() => {
                    match line {
                        Ok(Some(l)) => log.push(l),
                        Ok(None) => {}
                        Err(e) => return Err(EncliiError::new(ErrorKind::Upstream, format!("stderr read error: {e}"))),
                    }
                }
                status = child.wait() => {
                    let status = status.map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("{} process error: {e}", self.container_cli)))?;
                    if !status.success() {
                        return Err(EncliiError::new(ErrorKind::Upstream, format!("{} exited with {status}", self.container_cli)));
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl ContainerRuntimeBridge for CliRuntimeBridge {
    async fn build(&self, workspace: &Path, dockerfile_rel: Option<&str>, image_tag: &str, build_args: &HashMap<String, String>, log: &mut LogRing, cancel: &CancellationToken) -> Result<(), EncliiError> {
        let mut command = Command::new(&self.container_cli);
        command.arg("build").arg("-t").arg(image_tag);
        if let Some(dockerfile) = dockerfile_rel {
            command.arg("-f").arg(workspace.join(dockerfile));
        }
        for (key, value) in build_args {
            command.arg("--build-arg").arg(format!("{key}={value}"));
        }
        command.arg(workspace);

        self.stream_output(command, log, cancel).await
    }

    async fn push(&self, image_tag: &str, credentials: &RegistryCredentials, log: &mut LogRing, cancel: &CancellationToken) -> Result<(), EncliiError> {
        if !credentials.username.is_empty() {
            let mut login = std::process::Command::new(&self.container_cli);
            login
                .arg("login")
                .arg(&credentials.registry_url)
                .arg("--username")
                .arg(&credentials.username)
                .arg("--password-stdin")
                .stdin(Stdio::piped());
            let status = login
                .spawn()
                .and_then(|mut child| {
                    if let Some(mut stdin) = child.stdin.take() {
                        stdin.write_all(credentials.password.as_bytes())?;
                    }
                    child.wait()
                })
                .map_err(|e| EncliiError::new(ErrorKind::Upstream, format!("{} login failed to run: {e}", self.container_cli)))?;
            if !status.success() {
                return Err(EncliiError::new(ErrorKind::Upstream, format!("{} login exited with {status}", self.container_cli)));
            }
        }

        let mut command = Command::new(&self.container_cli);
        command.arg("push").arg(image_tag);
        self.stream_output(command, log, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_drops_oldest_past_cap() {
        let mut ring = LogRing::new(2);
        ring.push("a".into());
        ring.push("b".into());
        ring.push("c".into());
        let rendered = ring.render();
        assert!(rendered.contains("1 earlier lines dropped"));
        assert!(rendered.contains('b'));
        assert!(rendered.contains('c'));
        assert!(!rendered.contains('a'));
    }
}
