//! Process inspection: what JVM services are running on this host.
//!
//! [`ProcessInspector`] is the only way the rest of the crate learns about
//! OS processes. [`ProcfsInspector`] reads the live host; [`StaticInspector`]
//! serves a fixed process list for tests and dry runs.

pub mod parse;
pub mod procfs;
pub mod sockets;
pub mod table;

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use hostwatch_db::models::{LaunchWay, join_ports};

use crate::error::Result;

pub use procfs::ProcfsInspector;
pub use table::{FixedTable, ProcessRecord, ProcessTable, SysinfoTable};

/// A process seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredProcess {
    pub name: String,
    pub pid: u32,
    pub command: String,
    /// Socket-derived ports first, then command-line ports; no duplicates.
    pub ports: Vec<String>,
    /// Directory containing the launched artifact.
    pub catalog: String,
    pub is_container: bool,
    pub container_name: Option<String>,
}

impl DiscoveredProcess {
    pub fn way(&self) -> LaunchWay {
        if self.is_container {
            LaunchWay::Docker
        } else {
            LaunchWay::Native
        }
    }

    pub fn ports_joined(&self) -> String {
        join_ports(&self.ports)
    }

    /// Whether any of `ports` is also one of this process's ports.
    pub fn shares_port_with(&self, ports: &[String]) -> bool {
        self.ports.iter().any(|p| ports.contains(p))
    }
}

/// Capability to enumerate and inspect OS processes.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Enumerate runtime processes. Fails only when the process table
    /// itself cannot be read.
    async fn scan(&self) -> Result<Vec<DiscoveredProcess>>;

    /// Whether `pid` is a live process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether `pid` is a JVM process.
    fn matches_runtime(&self, pid: u32) -> bool;

    /// Pids whose command line contains `fragment`, lowest first.
    fn find_by_command(&self, fragment: &str) -> Vec<u32>;
}

/// Inspector over a fixed, replaceable process list.
#[derive(Debug, Default)]
pub struct StaticInspector {
    processes: Mutex<Vec<DiscoveredProcess>>,
    extra_alive: Mutex<HashSet<u32>>,
}

impl StaticInspector {
    pub fn new(processes: Vec<DiscoveredProcess>) -> Self {
        Self {
            processes: Mutex::new(processes),
            extra_alive: Mutex::new(HashSet::new()),
        }
    }

    /// Replace what the next scan returns.
    pub fn set_processes(&self, processes: Vec<DiscoveredProcess>) {
        *lock(&self.processes) = processes;
    }

    /// Report `pid` as alive even though it is not in the process list.
    pub fn mark_alive(&self, pid: u32) {
        lock(&self.extra_alive).insert(pid);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ProcessInspector for StaticInspector {
    async fn scan(&self) -> Result<Vec<DiscoveredProcess>> {
        Ok(lock(&self.processes).clone())
    }

    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.extra_alive).contains(&pid) || lock(&self.processes).iter().any(|p| p.pid == pid)
    }

    fn matches_runtime(&self, pid: u32) -> bool {
        lock(&self.processes)
            .iter()
            .any(|p| p.pid == pid && parse::is_runtime_command(&p.command))
    }

    fn find_by_command(&self, fragment: &str) -> Vec<u32> {
        let mut pids: Vec<u32> = lock(&self.processes)
            .iter()
            .filter(|p| p.command.contains(fragment))
            .map(|p| p.pid)
            .collect();
        pids.sort_unstable();
        pids
    }
}
