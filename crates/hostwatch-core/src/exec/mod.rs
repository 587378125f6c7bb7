//! Live execution: launch an entry's command, stream its output to one
//! reader and record the outcome in the registry.
//!
//! ```text
//! starting -> running -> completed
//!                     -> failed
//!                     -> timed_out
//! ```
//!
//! A deadline and [`CancelHandle::cancel`] trip the same token and get
//! the same SIGTERM, grace and SIGKILL escalation. They differ only in the
//! terminal state: an expired deadline ends `timed_out`, an external cancel
//! ends `failed` with the message `cancelled`. The caller asked for the stop,
//! so reporting it as a timeout would misstate what happened, and the
//! registry write for each kind is the same either way.
//!
//! A session is created by [`LiveExecutor::launch`], which spawns the
//! process (spawn failures are returned directly) and hands the rest to a
//! background task. The caller reads [`ExecutionSession::events`] and
//! collects the [`LaunchOutcome`] with [`ExecutionSession::finish`].

mod background;
mod child;
mod executor;
pub mod stream;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use executor::LiveExecutor;
pub use stream::{EventKind, EventSink, EventStream, ExecEvent, event_channel};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// What to launch for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// The entry's `run` command via `bash -c`. With `background`, the
    /// command is detached under `nohup` and its log is tailed for a while.
    Run { background: bool },
    /// The entry's `script` command via `sh -c`; short-lived.
    Script,
    /// Start the entry's container, or restart it when `reset` is set.
    Container { reset: bool },
}

/// Foreground or background execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Foreground,
    Background,
}

impl LaunchKind {
    pub fn mode(self) -> LaunchMode {
        match self {
            Self::Run { background: true } => LaunchMode::Background,
            _ => LaunchMode::Foreground,
        }
    }
}

/// A launch request: the kind plus an optional deadline override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub kind: LaunchKind,
    /// Overrides the kind's default deadline. Foreground runs have none by
    /// default.
    pub deadline: Option<Duration>,
}

impl LaunchRequest {
    pub fn new(kind: LaunchKind) -> Self {
        Self {
            kind,
            deadline: None,
        }
    }

    pub fn foreground() -> Self {
        Self::new(LaunchKind::Run { background: false })
    }

    pub fn background() -> Self {
        Self::new(LaunchKind::Run { background: true })
    }

    pub fn script() -> Self {
        Self::new(LaunchKind::Script)
    }

    pub fn container(reset: bool) -> Self {
        Self::new(LaunchKind::Container { reset })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing knobs for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// SIGTERM-to-SIGKILL grace when a session is cancelled.
    pub kill_grace: Duration,
    /// SIGTERM-to-SIGKILL grace for [`LiveExecutor::stop`] on native entries.
    pub stop_grace: Duration,
    /// How long output draining may lag behind process exit.
    pub drain_grace: Duration,
    /// How long a background launch tails `nohup.log`.
    pub observe_window: Duration,
    /// Default deadline for script launches.
    pub script_timeout: Duration,
    /// Default deadline for container start/restart.
    pub container_timeout: Duration,
    /// Deadline for `docker stop`.
    pub stop_timeout: Duration,
    /// How long to wait for the background pid file to appear.
    pub pid_file_wait: Duration,
    /// Settle time before scanning for the pid a script started.
    pub script_settle: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            drain_grace: Duration::from_secs(3),
            observe_window: Duration::from_secs(60),
            script_timeout: Duration::from_secs(30),
            container_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(30),
            pid_file_wait: Duration::from_secs(2),
            script_settle: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    /// Edges of the session state graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchOutcome {
    pub state: SessionState,
    /// Pid the session resolved for the launched service, if any.
    pub pid: Option<u32>,
    /// Every output line, newline-terminated, in arrival order.
    pub output: String,
    /// Human summary (for `completed`) or error description.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Cancels a running session. Cloneable; cancelling twice is harmless.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A launched session. Read the events, then [`finish`](Self::finish).
#[derive(Debug)]
pub struct ExecutionSession {
    entry_id: i64,
    mode: LaunchMode,
    pid: Option<u32>,
    events: Option<EventStream>,
    cancel: CancelHandle,
    task: JoinHandle<LaunchOutcome>,
}

impl ExecutionSession {
    pub fn entry_id(&self) -> i64 {
        self.entry_id
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    /// Pid of the spawned process (the shell or container CLI for
    /// indirect launches).
    pub fn spawned_pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the event stream. Only the first call returns `Some`.
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the session to end.
    ///
    /// An event stream that was never taken is dropped first, so an
    /// unobserved session does not stall on delivery.
    pub async fn finish(mut self) -> LaunchOutcome {
        drop(self.events.take());
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(entry_id = self.entry_id, error = %e, "session task ended abnormally");
                LaunchOutcome {
                    state: SessionState::Failed,
                    pid: self.pid,
                    output: String::new(),
                    message: format!("session task ended abnormally: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_accepted() {
        use SessionState::*;
        for (from, to) in [
            (Starting, Running),
            (Starting, Failed),
            (Running, Completed),
            (Running, Failed),
            (Running, TimedOut),
        ] {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use SessionState::*;
        for from in [Completed, Failed, TimedOut] {
            assert!(from.is_terminal());
            for to in [Starting, Running, Completed, Failed, TimedOut] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(!Starting.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn request_builders() {
        assert_eq!(LaunchRequest::background().kind.mode(), LaunchMode::Background);
        assert_eq!(LaunchRequest::script().kind.mode(), LaunchMode::Foreground);
        let r = LaunchRequest::container(true).with_deadline(Duration::from_secs(9));
        assert_eq!(r.kind, LaunchKind::Container { reset: true });
        assert_eq!(r.deadline, Some(Duration::from_secs(9)));
    }

    #[test]
    fn state_display_uses_snake_case() {
        assert_eq!(SessionState::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn outcome_serializes_state_like_display() {
        let outcome = LaunchOutcome {
            state: SessionState::TimedOut,
            pid: Some(42),
            output: "a\n".into(),
            message: "too slow".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "timed_out");
        assert_eq!(json["pid"], 42);
    }
}
