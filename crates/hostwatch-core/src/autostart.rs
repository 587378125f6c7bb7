//! Autostart lookup: is a service registered with the init system and
//! enabled at boot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait AutostartRegistrar: Send + Sync {
    /// Whether `name` is registered and enabled.
    async fn is_enabled(&self, name: &str) -> Result<bool>;
}

/// [`AutostartRegistrar`] that asks `systemctl is-enabled <name>.service`.
#[derive(Debug, Clone)]
pub struct SystemctlRegistrar {
    binary: String,
}

impl SystemctlRegistrar {
    pub const DEFAULT_BINARY: &str = "systemctl";

    pub fn new() -> Self {
        Self::with_binary(Self::DEFAULT_BINARY)
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SystemctlRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit name for a service name; an existing `.service` suffix is kept.
pub fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_owned()
    } else {
        format!("{name}.service")
    }
}

#[async_trait]
impl AutostartRegistrar for SystemctlRegistrar {
    async fn is_enabled(&self, name: &str) -> Result<bool> {
        let unit = unit_name(name);
        let output = Command::new(&self.binary)
            .arg("is-enabled")
            .arg(&unit)
            .output()
            .await
            .with_context(|| format!("failed to run {} is-enabled {unit}", self.binary))?;

        // Non-zero exit with a state on stdout ("disabled", "not-found")
        // is an answer, not a failure.
        let state = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        debug!(unit = %unit, state = %state, code = ?output.status.code(), "autostart state");
        Ok(output.status.success() && state == "enabled")
    }
}
