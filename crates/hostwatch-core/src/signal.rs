//! Process liveness and termination.

use std::io;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// How often liveness is polled while waiting out a grace period.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of [`terminate_pid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// `true` when SIGKILL was needed.
    pub forced: bool,
}

/// Whether `pid` names a live, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let ret = unsafe { libc::kill(raw, 0) };
    if ret != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::nothing());
    system
        .process(pid)
        .is_some_and(|p| p.status() == ProcessStatus::Zombie)
}

/// Send `signal` to a single process.
pub fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: plain kill(2) on a positive pid.
    if unsafe { libc::kill(raw, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Send `signal` to every process in the group led by `pgid`.
pub fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = i32::try_from(pgid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: kill(2) with a negative pid targets the process group.
    if unsafe { libc::kill(-raw, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Wait up to `grace` for `pid` to die.
pub async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Stop a process politely, then forcefully.
///
/// Sends SIGTERM, polls liveness for up to `grace`, and sends SIGKILL only
/// if the process is still alive afterwards. A pid that is already gone is
/// not an error.
pub async fn terminate_pid(pid: u32, grace: Duration) -> io::Result<StopOutcome> {
    if !pid_alive(pid) {
        debug!(pid, "terminate requested for a pid that is not running");
        return Ok(StopOutcome { forced: false });
    }

    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
            return Ok(StopOutcome { forced: false });
        }
        Err(e) => warn!(pid, error = %e, "SIGTERM failed, escalating to SIGKILL"),
    }

    if wait_for_exit(pid, grace).await {
        debug!(pid, "process exited after SIGTERM");
        return Ok(StopOutcome { forced: false });
    }

    debug!(pid, "process survived SIGTERM grace, sending SIGKILL");
    match send_signal(pid, libc::SIGKILL) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
        Err(e) => return Err(e),
    }
    wait_for_exit(pid, grace).await;
    Ok(StopOutcome { forced: true })
}

/// Whether any process is left in the group led by `pgid`.
///
/// Used when the leader itself has exited but its detached children keep
/// the group.
pub fn group_alive(pgid: u32) -> bool {
    if pgid == 0 {
        return false;
    }
    match signal_group(pgid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

/// [`terminate_pid`] for a whole process group.
pub async fn terminate_group(pgid: u32, grace: Duration) -> io::Result<StopOutcome> {
    if !group_alive(pgid) {
        return Ok(StopOutcome { forced: false });
    }
    match signal_group(pgid, libc::SIGTERM) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
            return Ok(StopOutcome { forced: false });
        }
        Err(e) => warn!(pgid, error = %e, "group SIGTERM failed, escalating to SIGKILL"),
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !group_alive(pgid) {
            debug!(pgid, "process group exited after SIGTERM");
            return Ok(StopOutcome { forced: false });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    debug!(pgid, "process group survived SIGTERM grace, sending SIGKILL");
    match signal_group(pgid, libc::SIGKILL) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
        Err(e) => return Err(e),
    }
    Ok(StopOutcome { forced: true })
}
