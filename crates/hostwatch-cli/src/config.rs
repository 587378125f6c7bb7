//! Configuration file management for hostwatch.
//!
//! Provides a TOML-based config file at `~/.config/hostwatch/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hostwatch_core::container::DockerCli;
use hostwatch_core::exec::ExecutorConfig;
use hostwatch_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub executor: ExecutorSection,
    pub container: ContainerSection,
    pub reconcile: ReconcileSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        let d = DbConfig::new(DbConfig::DEFAULT_URL);
        Self {
            url: d.database_url,
            max_connections: d.max_connections,
        }
    }
}

/// Executor timings. Durations in milliseconds unless suffixed `_secs`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub kill_grace_ms: u64,
    pub stop_grace_ms: u64,
    pub drain_grace_ms: u64,
    pub observe_window_secs: u64,
    pub script_timeout_secs: u64,
    pub container_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let d = ExecutorConfig::default();
        Self {
            kill_grace_ms: millis(d.kill_grace),
            stop_grace_ms: millis(d.stop_grace),
            drain_grace_ms: millis(d.drain_grace),
            observe_window_secs: d.observe_window.as_secs(),
            script_timeout_secs: d.script_timeout.as_secs(),
            container_timeout_secs: d.container_timeout.as_secs(),
            stop_timeout_secs: d.stop_timeout.as_secs(),
        }
    }
}

impl ExecutorSection {
    pub fn to_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            observe_window: Duration::from_secs(self.observe_window_secs),
            script_timeout: Duration::from_secs(self.script_timeout_secs),
            container_timeout: Duration::from_secs(self.container_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            ..ExecutorConfig::default()
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    /// Container CLI binary.
    pub binary: String,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            binary: DockerCli::DEFAULT_BINARY.to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// Seconds between passes for `hostwatch watch`.
    pub interval_secs: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the hostwatch config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/hostwatch` or
/// `~/.config/hostwatch`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("hostwatch");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("hostwatch")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct HostwatchConfig {
    pub db_config: DbConfig,
    pub executor: ExecutorConfig,
    pub container_binary: String,
    pub reconcile_interval: Duration,
}

impl HostwatchConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// Only the database URL has an env var (`HOSTWATCH_DATABASE_URL`).
    /// A missing config file means defaults; a malformed one is an error.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };
        Ok(Self::from_parts(
            cli_db_url,
            std::env::var(DbConfig::ENV_VAR).ok(),
            file_config,
        ))
    }

    fn from_parts(cli_db_url: Option<&str>, env_db_url: Option<String>, file: ConfigFile) -> Self {
        let db_url = cli_db_url
            .map(str::to_owned)
            .or(env_db_url)
            .unwrap_or(file.database.url);

        Self {
            db_config: DbConfig::new(db_url).with_max_connections(file.database.max_connections),
            executor: file.executor.to_config(),
            container_binary: file.container.binary,
            reconcile_interval: Duration::from_secs(file.reconcile.interval_secs.max(1)),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
