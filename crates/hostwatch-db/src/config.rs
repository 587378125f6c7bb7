use std::time::Duration;

use anyhow::{Result, bail};

/// Where the registry lives and how many connections to hold.
///
/// A worker runs one reconcile pass at a time but any number of live
/// sessions, each writing its entry once or twice, so a small pool is
/// enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/hostwatch";

    /// Environment override for the registry URL.
    pub const ENV_VAR: &str = "HOSTWATCH_DATABASE_URL";

    const DEFAULT_MAX_CONNECTIONS: u32 = 5;
    const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// `(everything before the database name, name, query string)`.
    fn split(&self) -> Option<(&str, &str, Option<&str>)> {
        let (base, query) = match self.database_url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (self.database_url.as_str(), None),
        };
        let (prefix, name) = base.rsplit_once('/')?;
        // `postgresql://host` has no path at all.
        if prefix.ends_with('/') {
            return None;
        }
        Some((prefix, name, query))
    }

    /// Database name from the URL path, or `None` when the path is empty.
    pub fn database_name(&self) -> Option<&str> {
        self.split().map(|(_, name, _)| name).filter(|n| !n.is_empty())
    }

    /// The name, checked for use in `CREATE DATABASE`, which cannot take a
    /// bind parameter.
    pub fn creatable_name(&self) -> Result<&str> {
        let Some(name) = self.database_name() else {
            bail!("no database name in {}", self.database_url);
        };
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("database name {name:?} contains invalid characters");
        }
        Ok(name)
    }

    /// Same server and options, `postgres` maintenance database.
    pub fn maintenance_url(&self) -> String {
        match self.split() {
            Some((prefix, _, Some(query))) => format!("{prefix}/postgres?{query}"),
            Some((prefix, _, None)) => format!("{prefix}/postgres"),
            None => self.database_url.clone(),
        }
    }
}
