//! Error types shared by the inspector, reconciler and executor.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used to carry query failures out of the store layer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the hostwatch core.
#[derive(Debug, Error)]
pub enum HostwatchError {
    /// The process table itself could not be enumerated.
    #[error("process scan failed: {message}")]
    Scan {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A registry entry (by id or pid) does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The request is refused in the entry's current state.
    #[error("entry {entry_id}: {reason}")]
    Conflict { entry_id: i64, reason: String },

    /// A launch or stop command could not be started or exited with failure.
    #[error("command {command:?} for entry {entry_id} failed: {message}")]
    Execution {
        entry_id: i64,
        command: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A command ran past its deadline and was killed.
    #[error("command {command:?} for entry {entry_id} timed out after {}s", after.as_secs_f64())]
    Timeout {
        entry_id: i64,
        command: String,
        after: Duration,
    },

    /// A registry read or write failed.
    #[error("registry {op} failed")]
    Persistence {
        op: String,
        #[source]
        source: BoxError,
    },

    /// An event was sent after the stream was closed or disconnected.
    #[error("event stream closed")]
    StreamClosed,
}

impl HostwatchError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(entry_id: i64, reason: impl Into<String>) -> Self {
        Self::Conflict {
            entry_id,
            reason: reason.into(),
        }
    }

    /// Wrap a query failure, keeping its context chain as the source.
    pub fn persistence(op: impl Into<String>, err: anyhow::Error) -> Self {
        Self::Persistence {
            op: op.into(),
            source: err.into(),
        }
    }

    pub fn execution(entry_id: i64, command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            entry_id,
            command: command.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn spawn_failed(entry_id: i64, command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Execution {
            entry_id,
            command: command.into(),
            message: format!("failed to spawn: {source}"),
            source: Some(source),
        }
    }
}

/// Convenience alias for core results.
pub type Result<T, E = HostwatchError> = std::result::Result<T, E>;

/// A non-fatal problem resolving one detail of one process.
///
/// The process is kept with whatever was resolved; the warning is logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionWarning {
    pub pid: u32,
    pub stage: ResolutionStage,
    pub message: String,
}

/// Which part of process inspection produced a [`ResolutionWarning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStage {
    Sockets,
    WorkingDir,
    Cgroup,
    ContainerName,
}

impl ResolutionWarning {
    pub fn new(pid: u32, stage: ResolutionStage, message: impl Into<String>) -> Self {
        Self {
            pid,
            stage,
            message: message.into(),
        }
    }

    /// Emit the warning through `tracing`.
    pub fn log(&self) {
        tracing::debug!(pid = self.pid, stage = ?self.stage, "{}", self.message);
    }
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} ({:?}): {}", self.pid, self.stage, self.message)
    }
}
