use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether a registry entry's process is believed to be running.
///
/// Stored as an integer (`0` stopped, `1` running).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Stopped = 0,
    Running = 1,
}

impl EntryStatus {
    /// The integer stored in the `status` column.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
        };
        f.write_str(s)
    }
}

impl FromStr for EntryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" | "0" => Ok(Self::Stopped),
            "running" | "1" => Ok(Self::Running),
            other => Err(ParseEnumError::new("entry status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// How a registry entry is launched.
///
/// Stored as an integer (`1` docker, `2` native).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum LaunchWay {
    Docker = 1,
    Native = 2,
}

impl LaunchWay {
    /// The integer stored in the `way` column.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LaunchWay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Docker => "docker",
            Self::Native => "native",
        };
        f.write_str(s)
    }
}

impl FromStr for LaunchWay {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" | "1" => Ok(Self::Docker),
            "native" | "2" => Ok(Self::Native),
            other => Err(ParseEnumError::new("launch way", other)),
        }
    }
}

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A row from the `registry_entries` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RegistryEntry {
    pub id: i64,
    pub name: String,
    /// Comma-joined port list, e.g. `"8080,9090"`.
    pub ports: String,
    /// Last known OS pid. Advisory only.
    pub pid: i32,
    /// Working directory the service runs from.
    pub catalog: String,
    pub run: String,
    pub script: String,
    pub worker: String,
    pub status: EntryStatus,
    pub description: String,
    pub way: LaunchWay,
    pub autostart: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    /// The entry's ports as individual values, empty segments dropped.
    pub fn port_list(&self) -> Vec<String> {
        split_ports(&self.ports)
    }

    pub fn is_running(&self) -> bool {
        self.status == EntryStatus::Running
    }
}

/// Fields for inserting a new registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub name: String,
    pub ports: String,
    pub pid: i32,
    pub catalog: String,
    pub run: String,
    pub worker: String,
    pub status: EntryStatus,
    pub way: LaunchWay,
}

/// Fields a discovery pass overwrites on an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryUpdate {
    pub pid: i32,
    pub name: String,
    pub catalog: String,
    pub run: String,
    pub way: LaunchWay,
}

/// Operator-edited fields. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryInfoUpdate {
    pub script: Option<String>,
    pub catalog: Option<String>,
    pub description: Option<String>,
}

impl EntryInfoUpdate {
    pub fn is_empty(&self) -> bool {
        self.script.is_none() && self.catalog.is_none() && self.description.is_none()
    }
}

/// Split a comma-joined port string, trimming and dropping empty segments.
pub fn split_ports(ports: &str) -> Vec<String> {
    ports
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Join ports into the comma-separated form stored in the `ports` column.
pub fn join_ports<S: AsRef<str>>(ports: &[S]) -> String {
    ports
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}
