//! The OS process table: pids, argv, working directory and liveness.
//!
//! [`SysinfoTable`] reads the live table through `sysinfo`;
//! [`FixedTable`] serves a canned one.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

/// One user process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Non-empty argv.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub zombie: bool,
}

impl ProcessRecord {
    pub fn new(pid: u32, argv: &[&str], cwd: Option<&str>) -> Self {
        Self {
            pid,
            argv: argv.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.map(PathBuf::from),
            zombie: false,
        }
    }

    pub fn command(&self) -> String {
        self.argv.join(" ")
    }

    /// Final path segment of `argv[0]`.
    pub fn exe_name(&self) -> &str {
        let first = self.argv.first().map(String::as_str).unwrap_or_default();
        first.rsplit('/').next().unwrap_or(first)
    }
}

/// Read access to the process table.
pub trait ProcessTable: Send + Sync {
    /// Every process with a command line, lowest pid first. Kernel
    /// threads and tasks are left out.
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>>;

    fn record(&self, pid: u32) -> Option<ProcessRecord>;

    /// Present and not a zombie.
    fn is_alive(&self, pid: u32) -> bool {
        self.record(pid).is_some_and(|r| !r.zombie)
    }
}

/// The live table via `sysinfo`. Each call takes a fresh reading.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoTable;

impl SysinfoTable {
    fn read(pids: ProcessesToUpdate<'_>) -> System {
        let mut system = System::new();
        let kind = ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_cwd(UpdateKind::Always);
        system.refresh_processes_specifics(pids, true, kind);
        system
    }
}

fn to_record(pid: Pid, process: &Process) -> Option<ProcessRecord> {
    if process.thread_kind().is_some() {
        return None;
    }
    let argv: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .filter(|arg| !arg.is_empty())
        .collect();
    if argv.is_empty() {
        return None;
    }
    Some(ProcessRecord {
        pid: pid.as_u32(),
        argv,
        cwd: process.cwd().map(Path::to_path_buf),
        zombie: process.status() == ProcessStatus::Zombie,
    })
}

impl ProcessTable for SysinfoTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process table is not readable on this platform",
            ));
        }
        let system = Self::read(ProcessesToUpdate::All);
        let mut records: Vec<ProcessRecord> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| to_record(*pid, process))
            .collect();
        records.sort_unstable_by_key(|r| r.pid);
        Ok(records)
    }

    fn record(&self, pid: u32) -> Option<ProcessRecord> {
        let pid = Pid::from_u32(pid);
        let system = Self::read(ProcessesToUpdate::Some(&[pid]));
        system.process(pid).and_then(|p| to_record(pid, p))
    }
}

/// A replaceable, canned process table.
#[derive(Debug, Default)]
pub struct FixedTable {
    records: Mutex<Vec<ProcessRecord>>,
    unreadable: bool,
}

impl FixedTable {
    pub fn new(mut records: Vec<ProcessRecord>) -> Self {
        records.sort_unstable_by_key(|r| r.pid);
        Self {
            records: Mutex::new(records),
            unreadable: false,
        }
    }

    /// A table whose snapshot always fails.
    pub fn unreadable() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            unreadable: true,
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<ProcessRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProcessTable for FixedTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>> {
        if self.unreadable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "process table unreadable"));
        }
        Ok(self.records().clone())
    }

    fn record(&self, pid: u32) -> Option<ProcessRecord> {
        self.records().iter().find(|r| r.pid == pid).cloned()
    }
}
