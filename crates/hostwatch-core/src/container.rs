//! Container runtime access through the `docker` CLI.

use std::fmt;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// Lifecycle action applied to a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

impl ContainerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seam over the container runtime so inspection and execution can be
/// tested without a daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve a container id to its name. `Ok(None)` when the runtime
    /// answers with an empty name.
    async fn inspect_name(&self, id: &str) -> Result<Option<String>>;

    /// Build (but do not spawn) the command that applies `action` to the
    /// container called `name`.
    fn command(&self, action: ContainerAction, name: &str) -> Command;

    /// Printable form of [`ContainerRuntime::command`], for logs and errors.
    fn describe(&self, action: ContainerAction, name: &str) -> String;
}

/// [`ContainerRuntime`] backed by the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub const DEFAULT_BINARY: &str = "docker";

    pub fn new() -> Self {
        Self::with_binary(Self::DEFAULT_BINARY)
    }

    /// Use a different binary, e.g. `podman` or an absolute path.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect_name(&self, id: &str) -> Result<Option<String>> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.Name}}", id])
            .output()
            .await
            .with_context(|| format!("failed to run {} inspect", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} inspect {id} failed: {}", self.binary, stderr.trim());
        }

        Ok(parse_inspect_name(&String::from_utf8_lossy(&output.stdout)))
    }

    fn command(&self, action: ContainerAction, name: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(action.as_str()).arg(name);
        cmd
    }

    fn describe(&self, action: ContainerAction, name: &str) -> String {
        format!("{} {action} {name}", self.binary)
    }
}

/// `docker inspect --format {{.Name}}` prints `/name`; drop the slash.
fn parse_inspect_name(stdout: &str) -> Option<String> {
    let name = stdout.trim().trim_start_matches('/');
    (!name.is_empty()).then(|| name.to_owned())
}
