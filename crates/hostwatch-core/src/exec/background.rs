//! Background launches: a detached `nohup` wrapper, pid-file discovery and
//! a bounded tail of `nohup.log`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::inspect::{ProcessInspector, parse};
use crate::signal;

/// Directory under the catalog that holds launcher state.
pub(crate) const STATE_DIR: &str = ".hostwatch";
pub(crate) const WRAPPER_FILE: &str = "launch.sh";
pub(crate) const PID_FILE: &str = "launch.pid";
pub(crate) const LOG_FILE: &str = "nohup.log";

const TAIL_POLL: Duration = Duration::from_millis(500);
const LOG_OPEN_ATTEMPTS: u32 = 30;
const LOG_OPEN_RETRY: Duration = Duration::from_millis(200);
const PID_FILE_POLL: Duration = Duration::from_millis(100);

/// Paths used by one background launch.
#[derive(Debug, Clone)]
pub(crate) struct LaunchFiles {
    pub wrapper: PathBuf,
    pub pid_file: PathBuf,
    pub log: PathBuf,
}

impl LaunchFiles {
    pub(crate) fn new(catalog: &Path) -> Self {
        let state = catalog.join(STATE_DIR);
        Self {
            wrapper: state.join(WRAPPER_FILE),
            pid_file: state.join(PID_FILE),
            log: catalog.join(LOG_FILE),
        }
    }

    /// Remove stale state and write the wrapper script.
    pub(crate) fn prepare(&self, run: &str) -> io::Result<()> {
        if let Some(dir) = self.wrapper.parent() {
            std::fs::create_dir_all(dir)?;
        }
        for stale in [&self.pid_file, &self.log] {
            match std::fs::remove_file(stale) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        std::fs::write(&self.wrapper, wrapper_script(run, &self.log, &self.pid_file))
    }
}

/// Quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// The detached launcher: start `run` under `nohup` with output in the log
/// and record the background job's pid.
pub(crate) fn wrapper_script(run: &str, log: &Path, pid_file: &Path) -> String {
    format!(
        "#!/bin/sh\nnohup {run} > {log} 2>&1 &\necho $! > {pid}\n",
        log = shell_quote(&log.to_string_lossy()),
        pid = shell_quote(&pid_file.to_string_lossy()),
    )
}

/// Poll for the pid file until it parses or `wait` elapses.
pub(crate) async fn read_pid_file(path: &Path, wait: Duration) -> Option<u32> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                return Some(pid);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(PID_FILE_POLL).await;
    }
}

/// How the tracked pid was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PidSource {
    PidFile,
    CommandSearch,
    /// Neither worked; the wrapper shell's pid is used.
    Wrapper,
}

/// Pick the pid to track: the pid file if it names a plausible process,
/// otherwise a process whose command line names the artifact.
///
/// Candidates must be alive and, for `java` commands, JVM processes.
pub(crate) fn resolve_pid(
    inspector: &dyn ProcessInspector,
    run: &str,
    from_file: Option<u32>,
    wrapper_pid: u32,
) -> (u32, PidSource) {
    let is_java = run.to_ascii_lowercase().contains("java");
    let plausible = |pid: u32| inspector.is_alive(pid) && (!is_java || inspector.matches_runtime(pid));

    if let Some(pid) = from_file.filter(|pid| plausible(*pid)) {
        return (pid, PidSource::PidFile);
    }

    let fragment = parse::artifact_path(run).unwrap_or(run);
    let found = inspector
        .find_by_command(fragment)
        .into_iter()
        .filter(|pid| *pid != wrapper_pid)
        .find(|pid| plausible(*pid));
    if let Some(pid) = found {
        return (pid, PidSource::CommandSearch);
    }

    (wrapper_pid, PidSource::Wrapper)
}

/// What a background session watches for liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tracked {
    /// The resolved service pid.
    Pid(u32),
    /// The wrapper's process group. The wrapper is its leader (it called
    /// setsid) but has already exited; the detached job remains a member.
    Group(u32),
}

impl Tracked {
    pub(crate) fn for_source(pid: u32, source: PidSource) -> Self {
        match source {
            PidSource::Wrapper => Self::Group(pid),
            PidSource::PidFile | PidSource::CommandSearch => Self::Pid(pid),
        }
    }

    pub(crate) fn pid(self) -> u32 {
        match self {
            Self::Pid(pid) | Self::Group(pid) => pid,
        }
    }

    pub(crate) fn is_alive(self, inspector: &dyn ProcessInspector) -> bool {
        match self {
            Self::Pid(pid) => inspector.is_alive(pid),
            Self::Group(pgid) => signal::group_alive(pgid),
        }
    }
}

/// Something observed while tailing the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TailEvent {
    Line(String),
    /// The log never appeared.
    Unavailable,
    /// The tracked pid died; tailing stopped.
    ProcessExited(u32),
}

/// Follow `log` from the start, yielding lines as they are written.
///
/// At end of file the stream checks that `tracked` is still alive and
/// waits before reading again; it ends once the process is gone. The
/// caller bounds the observation window.
pub(crate) fn tail_log<'a>(
    log: PathBuf,
    tracked: Tracked,
    inspector: &'a dyn ProcessInspector,
) -> impl Stream<Item = TailEvent> + 'a {
    async_stream::stream! {
        let mut file = None;
        for _ in 0..LOG_OPEN_ATTEMPTS {
            match tokio::fs::File::open(&log).await {
                Ok(f) => {
                    file = Some(f);
                    break;
                }
                Err(_) => tokio::time::sleep(LOG_OPEN_RETRY).await,
            }
        }
        let Some(file) = file else {
            yield TailEvent::Unavailable;
            return;
        };

        let mut reader = BufReader::new(file);
        let mut partial = Vec::new();
        loop {
            let mut chunk = Vec::new();
            match reader.read_until(b'\n', &mut chunk).await {
                Ok(0) => {
                    if !tracked.is_alive(inspector) {
                        if !partial.is_empty() {
                            yield TailEvent::Line(String::from_utf8_lossy(&partial).into_owned());
                        }
                        yield TailEvent::ProcessExited(tracked.pid());
                        return;
                    }
                    tokio::time::sleep(TAIL_POLL).await;
                }
                Ok(_) => {
                    partial.extend_from_slice(&chunk);
                    if partial.last() == Some(&b'\n') {
                        while matches!(partial.last(), Some(b'\n' | b'\r')) {
                            partial.pop();
                        }
                        yield TailEvent::Line(String::from_utf8_lossy(&partial).into_owned());
                        partial.clear();
                    }
                }
                Err(e) => {
                    debug!(error = %e, path = %log.display(), "log read failed, retrying");
                    tokio::time::sleep(TAIL_POLL).await;
                }
            }
        }
    }
}
