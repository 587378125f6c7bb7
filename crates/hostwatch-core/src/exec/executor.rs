//! [`LiveExecutor`]: spawn, drive and persist one launch per session.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostwatch_db::models::{EntryStatus, LaunchWay, RegistryEntry};

use super::background::{self, LaunchFiles, PidSource, TailEvent, Tracked};
use super::child::{ChildEnd, DriveOptions, Forwarder, Tracker, drive, merged_output};
use super::stream::{EventSink, ExecEvent, event_channel};
use super::{
    CancelHandle, ExecutionSession, ExecutorConfig, LaunchKind, LaunchOutcome, LaunchRequest,
    SessionState,
};
use crate::container::{ContainerAction, ContainerRuntime};
use crate::error::{HostwatchError, Result};
use crate::inspect::ProcessInspector;
use crate::registry::{EntryLocks, RegistryStore, db_pid};
use crate::signal::{self, StopOutcome};

/// Launches and stops registry entries.
///
/// Cheap to clone; every session task holds its own clone.
#[derive(Clone)]
pub struct LiveExecutor {
    store: Arc<dyn RegistryStore>,
    locks: EntryLocks,
    inspector: Arc<dyn ProcessInspector>,
    containers: Arc<dyn ContainerRuntime>,
    config: Arc<ExecutorConfig>,
}

impl std::fmt::Debug for LiveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A registry write to make once a session ends.
#[derive(Debug, Clone, Copy)]
enum Persist {
    Nothing,
    Status(EntryStatus),
    PidStatus(u32, EntryStatus),
}

/// A validated launch, ready to spawn.
struct Job {
    entry: RegistryEntry,
    kind: LaunchKind,
    /// Printable command, for errors and logs.
    command: String,
    deadline: Option<Duration>,
}

impl LiveExecutor {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        locks: EntryLocks,
        inspector: Arc<dyn ProcessInspector>,
        containers: Arc<dyn ContainerRuntime>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            locks,
            inspector,
            containers,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start a session for `entry`.
    ///
    /// Validation and spawn failures are returned here; everything after
    /// the spawn is reported through the session's events and outcome.
    pub async fn launch(&self, entry: &RegistryEntry, request: LaunchRequest) -> Result<ExecutionSession> {
        let job = self.prepare(entry, request)?;
        let entry_id = entry.id;
        let mode = request.kind.mode();
        let (sink, events) = event_channel();
        let token = CancellationToken::new();

        let (pid, task) = match job.kind {
            LaunchKind::Run { background: true } => {
                let child = self.spawn_wrapper(&job)?;
                let pid = child.id();
                let exec = self.clone();
                let cancel = token.clone();
                (pid, tokio::spawn(async move { exec.drive_background(job, child, sink, cancel).await }))
            }
            _ => {
                let child = self.spawn_direct(&job)?;
                let pid = child.id();
                let exec = self.clone();
                let cancel = token.clone();
                (pid, tokio::spawn(async move { exec.drive_foreground(job, child, sink, cancel).await }))
            }
        };

        info!(entry_id, pid = ?pid, ?mode, "session started");
        Ok(ExecutionSession {
            entry_id,
            mode,
            pid,
            events: Some(events),
            cancel: CancelHandle { token },
            task,
        })
    }

    /// Stop `entry` and mark it stopped.
    ///
    /// Container entries go through the runtime's stop command; native
    /// entries get SIGTERM, then SIGKILL if still alive after the stop
    /// grace.
    pub async fn stop(&self, entry: &RegistryEntry) -> Result<StopOutcome> {
        let outcome = match entry.way {
            LaunchWay::Docker => {
                self.stop_container(entry).await?;
                StopOutcome { forced: false }
            }
            LaunchWay::Native => {
                let pid = u32::try_from(entry.pid)
                    .ok()
                    .filter(|pid| *pid > 0)
                    .ok_or_else(|| HostwatchError::conflict(entry.id, "no pid recorded"))?;
                signal::terminate_pid(pid, self.config.stop_grace)
                    .await
                    .map_err(|e| HostwatchError::Execution {
                        entry_id: entry.id,
                        command: format!("kill {pid}"),
                        message: format!("failed to signal pid {pid}: {e}"),
                        source: Some(e),
                    })?
            }
        };

        let _guard = self.locks.lock(entry.id).await;
        self.store.set_status(entry.id, EntryStatus::Stopped).await?;
        info!(entry_id = entry.id, pid = entry.pid, forced = outcome.forced, "entry stopped");
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Validation and spawning
    // -----------------------------------------------------------------------

    fn prepare(&self, entry: &RegistryEntry, request: LaunchRequest) -> Result<Job> {
        let (command, default_deadline) = match request.kind {
            LaunchKind::Run { .. } => {
                if entry.run.trim().is_empty() {
                    return Err(HostwatchError::execution(entry.id, "", "no run command configured"));
                }
                (entry.run.clone(), None)
            }
            LaunchKind::Script => {
                if entry.script.trim().is_empty() {
                    return Err(HostwatchError::execution(entry.id, "", "no script configured"));
                }
                (entry.script.clone(), Some(self.config.script_timeout))
            }
            LaunchKind::Container { reset } => {
                if entry.way != LaunchWay::Docker {
                    return Err(HostwatchError::conflict(entry.id, "not a container entry"));
                }
                if entry.is_running() && !reset {
                    return Err(HostwatchError::conflict(
                        entry.id,
                        "container is already running; reset to restart it",
                    ));
                }
                let action = container_action(reset);
                (
                    self.containers.describe(action, &entry.name),
                    Some(self.config.container_timeout),
                )
            }
        };

        Ok(Job {
            entry: entry.clone(),
            kind: request.kind,
            command,
            deadline: request.deadline.or(default_deadline),
        })
    }

    fn spawn_direct(&self, job: &Job) -> Result<Child> {
        let entry = &job.entry;
        let mut cmd = match job.kind {
            LaunchKind::Container { reset } => self.containers.command(container_action(reset), &entry.name),
            LaunchKind::Script => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&entry.script);
                in_catalog(&mut cmd, entry);
                cmd
            }
            LaunchKind::Run { .. } => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(&entry.run);
                in_catalog(&mut cmd, entry);
                cmd
            }
        };
        with_entry_env(&mut cmd, entry);
        cmd.process_group(0);
        cmd.spawn()
            .map_err(|e| HostwatchError::spawn_failed(entry.id, job.command.clone(), e))
    }

    /// Write and start the detached wrapper for a background run.
    fn spawn_wrapper(&self, job: &Job) -> Result<Child> {
        let entry = &job.entry;
        let files = LaunchFiles::new(std::path::Path::new(&entry.catalog));
        files
            .prepare(&entry.run)
            .map_err(|e| HostwatchError::spawn_failed(entry.id, job.command.clone(), e))?;

        let mut cmd = Command::new("sh");
        cmd.arg(&files.wrapper);
        in_catalog(&mut cmd, entry);
        with_entry_env(&mut cmd, entry);
        // SAFETY: the hook only calls setsid(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(detach);
        }
        cmd.spawn()
            .map_err(|e| HostwatchError::spawn_failed(entry.id, job.command.clone(), e))
    }

    // -----------------------------------------------------------------------
    // Session tasks
    // -----------------------------------------------------------------------

    async fn drive_foreground(
        self,
        job: Job,
        mut child: Child,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> LaunchOutcome {
        let entry_id = job.entry.id;
        let mut fwd = Forwarder::new(sink, entry_id);
        let mut tracker = Tracker::new(entry_id);
        let spawned = child.id();

        if let (LaunchKind::Run { .. }, Some(pid)) = (job.kind, spawned) {
            self.persist(&mut fwd, entry_id, Persist::PidStatus(pid, EntryStatus::Running))
                .await;
        }
        tracker.advance(SessionState::Running);

        let lines = merged_output(&mut child);
        let end = drive(
            child,
            lines,
            &mut fwd,
            DriveOptions {
                deadline: job.deadline,
                cancel: &cancel,
                kill_grace: self.config.kill_grace,
                drain_grace: self.config.drain_grace,
                pgid: spawned,
            },
        )
        .await;

        let (state, mut message) = classify(&job, end);
        tracker.advance(state);
        let output = fwd.take_output();

        let mut pid = None;
        let write = match (job.kind, tracker.state()) {
            (LaunchKind::Run { .. }, _) => {
                pid = spawned;
                spawned.map_or(Persist::Status(EntryStatus::Stopped), |p| {
                    Persist::PidStatus(p, EntryStatus::Stopped)
                })
            }
            (LaunchKind::Script, SessionState::Completed) => {
                pid = self.locate_started(&job.entry).await;
                match pid {
                    Some(found) => {
                        message = format!("{message}; {} running as pid {found}", job.entry.name);
                        Persist::PidStatus(found, EntryStatus::Running)
                    }
                    None => {
                        let warning = format!(
                            "warning: no running process found for {} after script",
                            job.entry.name
                        );
                        warn!(entry_id, "script finished but no matching process found");
                        fwd.notice(warning).await;
                        Persist::Status(EntryStatus::Running)
                    }
                }
            }
            (LaunchKind::Container { .. }, SessionState::Completed) => Persist::Status(EntryStatus::Running),
            _ => Persist::Nothing,
        };
        self.persist(&mut fwd, entry_id, write).await;

        let terminal = if tracker.state() == SessionState::Completed {
            ExecEvent::complete(output.clone())
        } else {
            ExecEvent::error(message.clone())
        };
        fwd.terminal(terminal).await;
        info!(entry_id, state = %tracker.state(), pid = ?pid, "session finished");

        LaunchOutcome {
            state: tracker.state(),
            pid,
            output,
            message,
        }
    }

    async fn drive_background(
        self,
        job: Job,
        mut child: Child,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> LaunchOutcome {
        let entry_id = job.entry.id;
        let mut fwd = Forwarder::new(sink, entry_id);
        let mut tracker = Tracker::new(entry_id);
        let files = LaunchFiles::new(std::path::Path::new(&job.entry.catalog));
        tracker.advance(SessionState::Running);
        let Some(wrapper_pid) = child.id() else {
            let message = HostwatchError::execution(entry_id, job.command.clone(), "launcher exited before it was tracked")
                .to_string();
            return self
                .finish_background(&mut fwd, tracker, SessionState::Failed, None, message)
                .await;
        };

        let lines = merged_output(&mut child);
        let end = drive(
            child,
            lines,
            &mut fwd,
            DriveOptions {
                deadline: None,
                cancel: &cancel,
                kill_grace: self.config.kill_grace,
                drain_grace: self.config.drain_grace,
                pgid: Some(wrapper_pid),
            },
        )
        .await;

        let wrapper_failure = match end {
            ChildEnd::Exited(status) if status.success() => None,
            ChildEnd::Exited(status) => Some(format!("launcher exited with {status}")),
            ChildEnd::WaitFailed(e) => Some(format!("failed to wait for launcher: {e}")),
            ChildEnd::DeadlineExceeded(_) | ChildEnd::Cancelled => Some("cancelled".to_owned()),
        };
        if let Some(reason) = wrapper_failure {
            let message =
                HostwatchError::execution(entry_id, job.command.clone(), reason).to_string();
            return self
                .finish_background(&mut fwd, tracker, SessionState::Failed, None, message)
                .await;
        }

        let from_file = background::read_pid_file(&files.pid_file, self.config.pid_file_wait).await;
        let (pid, source) =
            background::resolve_pid(self.inspector.as_ref(), &job.entry.run, from_file, wrapper_pid);
        let tracked = Tracked::for_source(pid, source);
        debug!(entry_id, pid, ?source, "background pid resolved");
        if source == PidSource::Wrapper {
            warn!(entry_id, pid, "could not resolve service pid, tracking launcher group");
            fwd.queue_notice(format!("warning: could not resolve service pid, tracking launcher pid {pid}"));
        }

        let window = job.deadline.unwrap_or(self.config.observe_window);
        let tail = background::tail_log(files.log.clone(), tracked, self.inspector.as_ref());
        tokio::pin!(tail);
        let window_end = tokio::time::sleep(window);
        tokio::pin!(window_end);

        // Queued events are flushed by the terminal event, so a slow reader
        // never holds off the window or a cancel.
        let (state, message) = loop {
            tokio::select! {
                event = tail.next() => match event {
                    Some(TailEvent::Line(line)) => fwd.capture(line),
                    Some(TailEvent::Unavailable) => {
                        fwd.queue_notice(format!("warning: {} did not appear", files.log.display()));
                        break observed(&job, pid, tracked.is_alive(self.inspector.as_ref()));
                    }
                    Some(TailEvent::ProcessExited(_)) | None => break observed(&job, pid, false),
                },
                _ = fwd.flush_one(), if fwd.has_pending() => {
                    if !fwd.is_streaming() {
                        break observed(&job, pid, tracked.is_alive(self.inspector.as_ref()));
                    }
                }
                _ = &mut window_end => break observed(&job, pid, tracked.is_alive(self.inspector.as_ref())),
                _ = cancel.cancelled() => {
                    let stopped = match tracked {
                        Tracked::Group(pgid) => signal::terminate_group(pgid, self.config.kill_grace).await,
                        Tracked::Pid(pid) => {
                            if let Err(e) = signal::signal_group(wrapper_pid, libc::SIGTERM) {
                                debug!(pgid = wrapper_pid, error = %e, "launcher group already gone");
                            }
                            signal::terminate_pid(pid, self.config.kill_grace).await
                        }
                    };
                    if let Err(e) = stopped {
                        warn!(entry_id, pid, error = %e, "failed to terminate background process");
                    }
                    break (SessionState::Failed, "cancelled".to_owned());
                }
            }
        };

        self.finish_background(&mut fwd, tracker, state, Some(pid), message)
            .await
    }

    async fn finish_background(
        &self,
        fwd: &mut Forwarder,
        mut tracker: Tracker,
        state: SessionState,
        pid: Option<u32>,
        message: String,
    ) -> LaunchOutcome {
        let entry_id = fwd.entry_id();
        tracker.advance(state);
        let write = match (tracker.state(), pid) {
            (SessionState::Completed, Some(pid)) => Persist::PidStatus(pid, EntryStatus::Running),
            (_, Some(pid)) => Persist::PidStatus(pid, EntryStatus::Stopped),
            (_, None) => Persist::Status(EntryStatus::Stopped),
        };
        self.persist(fwd, entry_id, write).await;

        let terminal = if tracker.state() == SessionState::Completed {
            ExecEvent::complete(message.clone())
        } else {
            ExecEvent::error(message.clone())
        };
        fwd.terminal(terminal).await;
        info!(entry_id, state = %tracker.state(), pid = ?pid, "background session finished");

        LaunchOutcome {
            state: tracker.state(),
            pid,
            output: fwd.take_output(),
            message,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// After a script: the scanned process with the entry's name that
    /// shares one of its ports.
    async fn locate_started(&self, entry: &RegistryEntry) -> Option<u32> {
        tokio::time::sleep(self.config.script_settle).await;
        let processes = match self.inspector.scan().await {
            Ok(processes) => processes,
            Err(e) => {
                warn!(entry_id = entry.id, error = %e, "scan after script failed");
                return None;
            }
        };
        let ports = entry.port_list();
        processes
            .into_iter()
            .find(|p| p.name == entry.name && (ports.is_empty() || p.shares_port_with(&ports)))
            .map(|p| p.pid)
    }

    /// Apply `write` under the entry lock. Failures become a warning event.
    async fn persist(&self, fwd: &mut Forwarder, entry_id: i64, write: Persist) {
        let result = match write {
            Persist::Nothing => return,
            Persist::Status(status) => {
                let _guard = self.locks.lock(entry_id).await;
                self.store.set_status(entry_id, status).await
            }
            Persist::PidStatus(pid, status) => {
                let _guard = self.locks.lock(entry_id).await;
                self.store.set_pid_status(entry_id, db_pid(pid), status).await
            }
        };
        if let Err(e) = result {
            warn!(entry_id, ?write, error = %e, "failed to record session result");
            fwd.notice(format!("warning: {e}")).await;
        }
    }

    async fn stop_container(&self, entry: &RegistryEntry) -> Result<()> {
        let command = self.containers.describe(ContainerAction::Stop, &entry.name);
        let mut cmd = self.containers.command(ContainerAction::Stop, &entry.name);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.stop_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| HostwatchError::spawn_failed(entry.id, command.clone(), e))?,
            Err(_) => {
                return Err(HostwatchError::Timeout {
                    entry_id: entry.id,
                    command,
                    after: self.config.stop_timeout,
                });
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HostwatchError::execution(
                entry.id,
                command,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(())
    }
}

fn container_action(reset: bool) -> ContainerAction {
    if reset {
        ContainerAction::Restart
    } else {
        ContainerAction::Start
    }
}

fn in_catalog(cmd: &mut Command, entry: &RegistryEntry) {
    if !entry.catalog.is_empty() {
        cmd.current_dir(&entry.catalog);
    }
}

fn with_entry_env(cmd: &mut Command, entry: &RegistryEntry) {
    cmd.env("PROJECT_NAME", &entry.name)
        .env("PROJECT_PID", entry.pid.to_string())
        .env("LANG", "en_US.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

fn detach() -> io::Result<()> {
    // SAFETY: setsid takes no arguments and only fails with EPERM.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Terminal state and message for a directly driven child.
fn classify(job: &Job, end: ChildEnd) -> (SessionState, String) {
    let entry_id = job.entry.id;
    match end {
        ChildEnd::Exited(status) if status.success() => {
            (SessionState::Completed, format!("{} finished", job.command))
        }
        ChildEnd::Exited(status) => (
            SessionState::Failed,
            HostwatchError::execution(entry_id, job.command.clone(), format!("exited with {status}"))
                .to_string(),
        ),
        ChildEnd::WaitFailed(e) => (
            SessionState::Failed,
            HostwatchError::Execution {
                entry_id,
                command: job.command.clone(),
                message: format!("failed to wait: {e}"),
                source: Some(e),
            }
            .to_string(),
        ),
        ChildEnd::DeadlineExceeded(after) => (
            SessionState::TimedOut,
            HostwatchError::Timeout {
                entry_id,
                command: job.command.clone(),
                after,
            }
            .to_string(),
        ),
        ChildEnd::Cancelled => (
            SessionState::Failed,
            HostwatchError::execution(entry_id, job.command.clone(), "cancelled").to_string(),
        ),
    }
}

/// Result of a background observation window.
fn observed(job: &Job, pid: u32, alive: bool) -> (SessionState, String) {
    if alive {
        (
            SessionState::Completed,
            format!("{} started in background with pid {pid}", job.entry.name),
        )
    } else {
        (
            SessionState::Failed,
            HostwatchError::execution(
                job.entry.id,
                job.command.clone(),
                format!("process {pid} exited during startup"),
            )
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::container::DockerCli;
    use crate::inspect::StaticInspector;
    use crate::registry::MemoryRegistryStore;

    fn entry(way: LaunchWay, status: EntryStatus) -> RegistryEntry {
        RegistryEntry {
            id: 7,
            name: "orders".into(),
            ports: "8080".into(),
            pid: 0,
            catalog: String::new(),
            run: "java -jar orders.jar".into(),
            script: String::new(),
            worker: "host-1".into(),
            status,
            description: String::new(),
            way,
            autostart: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn executor() -> LiveExecutor {
        LiveExecutor::new(
            Arc::new(MemoryRegistryStore::new()),
            EntryLocks::new(),
            Arc::new(StaticInspector::default()),
            Arc::new(DockerCli::new()),
            ExecutorConfig::default(),
        )
    }

    #[test]
    fn container_launch_requires_docker_way() {
        let err = executor()
            .prepare(&entry(LaunchWay::Native, EntryStatus::Stopped), LaunchRequest::container(false))
            .err()
            .unwrap();
        assert!(matches!(err, HostwatchError::Conflict { entry_id: 7, .. }));
    }

    #[test]
    fn running_container_needs_reset() {
        let exec = executor();
        let running = entry(LaunchWay::Docker, EntryStatus::Running);

        let err = exec.prepare(&running, LaunchRequest::container(false)).err().unwrap();
        assert!(matches!(err, HostwatchError::Conflict { .. }));

        let job = exec.prepare(&running, LaunchRequest::container(true)).unwrap();
        assert_eq!(job.command, "docker restart orders");
        assert_eq!(job.deadline, Some(Duration::from_secs(300)));
    }

    #[test]
    fn empty_commands_are_rejected() {
        let mut e = entry(LaunchWay::Native, EntryStatus::Stopped);
        let exec = executor();
        assert!(matches!(
            exec.prepare(&e, LaunchRequest::script()).err().unwrap(),
            HostwatchError::Execution { .. }
        ));
        e.run = "  ".into();
        assert!(matches!(
            exec.prepare(&e, LaunchRequest::foreground()).err().unwrap(),
            HostwatchError::Execution { .. }
        ));
    }

    #[test]
    fn default_deadlines_per_kind() {
        let mut e = entry(LaunchWay::Native, EntryStatus::Stopped);
        e.script = "./deploy.sh".into();
        let exec = executor();

        assert_eq!(exec.prepare(&e, LaunchRequest::foreground()).unwrap().deadline, None);
        assert_eq!(
            exec.prepare(&e, LaunchRequest::script()).unwrap().deadline,
            Some(Duration::from_secs(30))
        );
        let custom = LaunchRequest::script().with_deadline(Duration::from_secs(2));
        assert_eq!(exec.prepare(&e, custom).unwrap().deadline, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn stop_without_pid_is_a_conflict() {
        let err = executor()
            .stop(&entry(LaunchWay::Native, EntryStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, HostwatchError::Conflict { .. }));
    }
}
