//! [`ProcessInspector`] for Linux: the process table through
//! [`ProcessTable`], sockets and cgroups from `/proc`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::parse;
use super::sockets;
use super::table::{ProcessRecord, ProcessTable, SysinfoTable};
use super::{DiscoveredProcess, ProcessInspector};
use crate::container::ContainerRuntime;
use crate::error::{HostwatchError, ResolutionStage, ResolutionWarning, Result};

const DEFAULT_ROOT: &str = "/proc";

/// Finds JVM services in the process table and resolves their ports,
/// catalog and container.
#[derive(Clone)]
pub struct ProcfsInspector {
    table: Arc<dyn ProcessTable>,
    root: PathBuf,
    containers: Arc<dyn ContainerRuntime>,
    self_pid: u32,
}

impl std::fmt::Debug for ProcfsInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcfsInspector")
            .field("root", &self.root)
            .field("self_pid", &self.self_pid)
            .finish_non_exhaustive()
    }
}

/// Everything resolved synchronously for one candidate process.
struct Candidate {
    pid: u32,
    command: String,
    artifact: String,
    ports: Vec<String>,
    catalog: String,
    container_id: Option<String>,
}

impl ProcfsInspector {
    pub fn new(containers: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_parts(Arc::new(SysinfoTable), DEFAULT_ROOT, containers)
    }

    /// Use another process table, and a `/proc`-shaped tree for sockets
    /// and cgroups.
    pub fn with_parts(
        table: Arc<dyn ProcessTable>,
        root: impl Into<PathBuf>,
        containers: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            table,
            root: root.into(),
            containers,
            self_pid: std::process::id(),
        }
    }

    fn collect_candidates(&self) -> Result<Vec<Candidate>> {
        let records = self.table.snapshot().map_err(|source| HostwatchError::Scan {
            message: "cannot read the process table".to_owned(),
            source,
        })?;

        let mut candidates = Vec::new();
        for record in records.into_iter().filter(|r| r.pid != self.self_pid && !r.zombie) {
            let command = record.command();
            if !parse::is_runtime_command(&command) {
                continue;
            }
            let Some(artifact) = parse::artifact_path(&command).map(str::to_owned) else {
                debug!(pid = record.pid, "runtime process without an artifact token, skipping");
                continue;
            };
            candidates.push(self.resolve(&record, command, artifact));
        }
        Ok(candidates)
    }

    fn resolve(&self, record: &ProcessRecord, command: String, artifact: String) -> Candidate {
        let pid = record.pid;
        let socket_ports = sockets::listening_ports(&self.root, pid).unwrap_or_else(|e| {
            ResolutionWarning::new(pid, ResolutionStage::Sockets, e.to_string()).log();
            Vec::new()
        });
        let ports = parse::merge_ports(&socket_ports, &parse::command_line_ports(&command));

        let mut artifact_path = PathBuf::from(&artifact);
        if artifact_path.is_relative() {
            match &record.cwd {
                Some(cwd) => artifact_path = cwd.join(artifact_path),
                None => ResolutionWarning::new(pid, ResolutionStage::WorkingDir, "working directory unavailable")
                    .log(),
            }
        }
        let catalog = artifact_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let cgroup = self.root.join(pid.to_string()).join("cgroup");
        let container_id = match std::fs::read_to_string(cgroup) {
            Ok(contents) => parse::container_id_from_cgroup(&contents),
            Err(e) => {
                ResolutionWarning::new(pid, ResolutionStage::Cgroup, e.to_string()).log();
                None
            }
        };

        Candidate {
            pid,
            command,
            artifact,
            ports,
            catalog,
            container_id,
        }
    }

    async fn finish(&self, candidate: Candidate) -> Option<DiscoveredProcess> {
        let Candidate {
            pid,
            command,
            artifact,
            ports,
            catalog,
            container_id,
        } = candidate;

        let mut name = parse::service_name(&artifact);
        let mut container_name = None;
        let is_container = container_id.is_some();

        if let Some(id) = container_id {
            match self.containers.inspect_name(&id).await {
                Ok(Some(resolved)) => {
                    name = resolved.clone();
                    container_name = Some(resolved);
                }
                Ok(None) => {}
                Err(e) => {
                    let w = ResolutionWarning::new(pid, ResolutionStage::ContainerName, format!("{e:#}"));
                    warn!(pid, container_id = %id, "{w}");
                }
            }
        } else if ports.is_empty() {
            debug!(pid, name = %name, "native process without ports, excluded");
            return None;
        }

        Some(DiscoveredProcess {
            name,
            pid,
            command,
            ports,
            catalog,
            is_container,
            container_name,
        })
    }
}

#[async_trait]
impl ProcessInspector for ProcfsInspector {
    async fn scan(&self) -> Result<Vec<DiscoveredProcess>> {
        let this = self.clone();
        let candidates = tokio::task::spawn_blocking(move || this.collect_candidates())
            .await
            .map_err(|e| HostwatchError::Scan {
                message: "process table reader panicked".to_owned(),
                source: io::Error::other(e),
            })??;

        let mut discovered = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(process) = self.finish(candidate).await {
                discovered.push(process);
            }
        }
        debug!(count = discovered.len(), "process scan finished");
        Ok(discovered)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.table.is_alive(pid)
    }

    fn matches_runtime(&self, pid: u32) -> bool {
        self.table
            .record(pid)
            .is_some_and(|r| r.exe_name().starts_with("java") || parse::is_runtime_command(&r.command()))
    }

    fn find_by_command(&self, fragment: &str) -> Vec<u32> {
        match self.table.snapshot() {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.pid != self.self_pid && r.command().contains(fragment))
                .map(|r| r.pid)
                .collect(),
            Err(e) => {
                warn!(error = %e, "process table unreadable during command search");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    use anyhow::bail;
    use tokio::process::Command;

    use super::*;
    use crate::container::ContainerAction;
    use crate::inspect::table::FixedTable;

    struct NamedContainers(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl ContainerRuntime for NamedContainers {
        async fn inspect_name(&self, id: &str) -> anyhow::Result<Option<String>> {
            match self.0.get(id) {
                Some(name) => Ok(Some(name.to_string())),
                None => bail!("no such container {id}"),
            }
        }

        fn command(&self, action: ContainerAction, name: &str) -> Command {
            let mut cmd = Command::new("true");
            cmd.arg(action.as_str()).arg(name);
            cmd
        }

        fn describe(&self, action: ContainerAction, name: &str) -> String {
            format!("true {action} {name}")
        }
    }

    const TCP_8080: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 700 1 0 100 0 0 10 0
";

    /// A canned process table plus the `/proc` files it cannot provide.
    struct FakeHost {
        root: tempfile::TempDir,
        records: Vec<ProcessRecord>,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                records: Vec::new(),
            }
        }

        fn add(&mut self, pid: u32, argv: &[&str], cwd: &str, cgroup: &str) -> PathBuf {
            let dir = self.root.path().join(pid.to_string());
            std::fs::create_dir_all(dir.join("fd")).unwrap();
            std::fs::create_dir_all(dir.join("net")).unwrap();
            std::fs::write(dir.join("cgroup"), cgroup).unwrap();
            self.records.push(ProcessRecord::new(pid, argv, Some(cwd)));
            dir
        }

        fn listen_8080(&self, dir: &Path) {
            symlink("socket:[700]", dir.join("fd/5")).unwrap();
            std::fs::write(dir.join("net/tcp"), TCP_8080).unwrap();
        }

        fn inspector(&self) -> ProcfsInspector {
            let names = NamedContainers(HashMap::from([("c0ffee", "orders")]));
            let table = Arc::new(FixedTable::new(self.records.clone()));
            ProcfsInspector::with_parts(table, self.root.path(), Arc::new(names))
        }
    }

    #[tokio::test]
    async fn scan_applies_filters_and_resolution() {
        let mut fake = FakeHost::new();

        // Native with a socket and a relative artifact.
        let native = fake.add(
            100,
            &["java", "-Xmx512m", "-jar", "billing-1.4.0.jar", "--server.port=9000"],
            "/srv/billing",
            "0::/user.slice\n",
        );
        fake.listen_8080(&native);

        // Native without ports: excluded.
        fake.add(101, &["java", "-jar", "/opt/idle.jar"], "/", "0::/user.slice\n");

        // No runtime marker: excluded even though it is java.
        fake.add(102, &["java", "-cp", "x.jar", "Main", "PORT=1"], "/", "0::/\n");

        // Container without ports: kept, renamed.
        fake.add(
            103,
            &["java", "-jar", "/app/app.jar"],
            "/app",
            "0::/system.slice/docker-c0ffee.scope\n",
        );

        // Container whose name cannot be resolved: kept under its artifact name.
        fake.add(104, &["java", "-jar", "/app/ghost.jar"], "/app", "0::/docker/deadbeef\n");

        // Zombie: skipped.
        let mut zombie = ProcessRecord::new(105, &["java", "-jar", "/opt/dead.jar", "--port=1"], None);
        zombie.zombie = true;
        fake.records.push(zombie);

        let found = fake.inspector().scan().await.unwrap();
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![100, 103, 104]);

        let billing = &found[0];
        assert_eq!(billing.name, "billing");
        assert_eq!(billing.ports, vec!["8080", "9000"]);
        assert_eq!(billing.catalog, "/srv/billing");
        assert!(!billing.is_container);
        assert_eq!(
            billing.command,
            "java -Xmx512m -jar billing-1.4.0.jar --server.port=9000"
        );

        let orders = &found[1];
        assert_eq!(orders.name, "orders");
        assert_eq!(orders.container_name.as_deref(), Some("orders"));
        assert!(orders.is_container);
        assert!(orders.ports.is_empty());
        assert_eq!(orders.catalog, "/app");

        let ghost = &found[2];
        assert_eq!(ghost.name, "ghost");
        assert!(ghost.is_container);
        assert_eq!(ghost.container_name, None);
    }

    #[tokio::test]
    async fn unreadable_table_is_a_scan_error() {
        let inspector = ProcfsInspector::with_parts(
            Arc::new(FixedTable::unreadable()),
            "/nonexistent/hostwatch-proc",
            Arc::new(NamedContainers(HashMap::new())),
        );
        let err = inspector.scan().await.unwrap_err();
        assert!(matches!(err, HostwatchError::Scan { .. }));
    }

    #[test]
    fn lookups_on_fake_table() {
        let mut fake = FakeHost::new();
        fake.add(200, &["/usr/lib/jvm/bin/java", "-jar", "a.jar"], "/", "");
        fake.add(201, &["sh", "-c", "nohup java -jar a.jar"], "/", "");
        fake.add(202, &["python3", "serve.py"], "/", "");
        let inspector = fake.inspector();

        assert!(inspector.is_alive(200));
        assert!(!inspector.is_alive(999));
        assert!(inspector.matches_runtime(200));
        assert!(inspector.matches_runtime(201));
        assert!(!inspector.matches_runtime(202));
        assert_eq!(inspector.find_by_command("a.jar"), vec![200, 201]);
    }

    #[tokio::test]
    async fn missing_cgroup_and_cwd_still_resolve() {
        // Relative artifact with no cwd and no cgroup file: warnings only.
        let table = FixedTable::new(vec![ProcessRecord::new(300, &["java", "-jar", "svc.jar", "--server.port=7000"], None)]);
        let inspector = ProcfsInspector::with_parts(
            Arc::new(table),
            "/nonexistent/hostwatch-proc",
            Arc::new(NamedContainers(HashMap::new())),
        );

        let found = inspector.scan().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ports, vec!["7000"]);
        assert_eq!(found[0].catalog, "");
        assert!(!found[0].is_container);
    }

    #[test]
    fn live_inspector_sees_itself_alive() {
        let inspector = ProcfsInspector::new(Arc::new(NamedContainers(HashMap::new())));
        assert!(inspector.is_alive(std::process::id()));
    }
}
