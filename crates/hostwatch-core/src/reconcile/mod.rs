//! Reconciliation: fold a process scan into the registry.
//!
//! One pass, in order:
//!
//! 1. Load the local worker's rows and index them by port.
//! 2. Flip running rows whose pid was not seen to stopped.
//! 3. For each discovered process, in scan order, update the row owning
//!    its first indexed port or insert a new row. A process with no ports
//!    (only containers are kept without one) matches a container row of
//!    the same name, then a row with the same pid.
//!
//! Per-row failures are logged and counted; they never abort the pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use hostwatch_db::models::{DiscoveryUpdate, EntryStatus, LaunchWay, NewEntry, RegistryEntry};

use crate::error::Result;
use crate::identity::WorkerIdentity;
use crate::inspect::DiscoveredProcess;
use crate::registry::{EntryLocks, RegistryStore, db_pid};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Number of discovered processes considered.
    pub total: usize,
    pub updated: usize,
    pub created: usize,
    pub marked_stopped: usize,
    /// Rows whose update or insert failed and were skipped.
    pub failed: usize,
}

/// Applies scans to the registry for one worker.
pub struct Reconciler {
    store: Arc<dyn RegistryStore>,
    locks: EntryLocks,
    worker: WorkerIdentity,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RegistryStore>, locks: EntryLocks, worker: WorkerIdentity) -> Self {
        Self {
            store,
            locks,
            worker,
        }
    }

    pub fn worker(&self) -> &WorkerIdentity {
        &self.worker
    }

    /// Run one pass. Fails only if the worker's rows cannot be loaded.
    pub async fn reconcile(&self, discovered: &[DiscoveredProcess]) -> Result<ReconcileReport> {
        let worker = self.worker.as_str();
        let rows = self.store.list(Some(worker)).await?;

        let mut report = ReconcileReport {
            total: discovered.len(),
            ..ReconcileReport::default()
        };
        let mut index = RowIndex::build(&rows);

        self.mark_stopped(&rows, discovered, &mut report).await;

        for process in discovered {
            match index.find(process) {
                Some(id) => {
                    let update = DiscoveryUpdate {
                        pid: db_pid(process.pid),
                        name: process.name.clone(),
                        catalog: process.catalog.clone(),
                        run: process.command.clone(),
                        way: process.way(),
                    };
                    let _guard = self.locks.lock(id).await;
                    match self.store.apply_discovery(id, update).await {
                        Ok(()) => {
                            debug!(entry_id = id, pid = process.pid, name = %process.name, "entry updated");
                            report.updated += 1;
                        }
                        Err(e) => {
                            warn!(entry_id = id, pid = process.pid, error = %e, "failed to update entry, skipping");
                            report.failed += 1;
                        }
                    }
                }
                None => {
                    let entry = NewEntry {
                        name: process.name.clone(),
                        ports: process.ports_joined(),
                        pid: db_pid(process.pid),
                        catalog: process.catalog.clone(),
                        run: process.command.clone(),
                        worker: worker.to_owned(),
                        status: EntryStatus::Running,
                        way: process.way(),
                    };
                    match self.store.insert(entry).await {
                        Ok(row) => {
                            debug!(entry_id = row.id, pid = process.pid, name = %process.name, "entry created");
                            index.insert_row(&row);
                            report.created += 1;
                        }
                        Err(e) => {
                            warn!(pid = process.pid, name = %process.name, error = %e, "failed to create entry, skipping");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            worker,
            total = report.total,
            updated = report.updated,
            created = report.created,
            marked_stopped = report.marked_stopped,
            failed = report.failed,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn mark_stopped(
        &self,
        rows: &[RegistryEntry],
        discovered: &[DiscoveredProcess],
        report: &mut ReconcileReport,
    ) {
        let seen: HashSet<i32> = discovered.iter().map(|p| db_pid(p.pid)).collect();

        for row in rows.iter().filter(|r| r.is_running() && !seen.contains(&r.pid)) {
            let _guard = self.locks.lock(row.id).await;
            match self.store.set_status(row.id, EntryStatus::Stopped).await {
                Ok(()) => {
                    debug!(entry_id = row.id, pid = row.pid, "pid gone, entry marked stopped");
                    report.marked_stopped += 1;
                }
                Err(e) => {
                    warn!(entry_id = row.id, pid = row.pid, error = %e, "failed to mark entry stopped");
                }
            }
        }
    }
}

/// Lookup of one worker's rows: by port, and for port-less processes by
/// container name or pid.
#[derive(Debug, Default)]
struct RowIndex {
    by_port: HashMap<String, i64>,
    by_container: HashMap<String, i64>,
    by_pid: HashMap<i32, i64>,
}

impl RowIndex {
    fn build(rows: &[RegistryEntry]) -> Self {
        let mut index = Self::default();
        for row in rows {
            index.insert_row(row);
        }
        index
    }

    fn insert_row(&mut self, row: &RegistryEntry) {
        for port in row.port_list() {
            match self.by_port.insert(port.clone(), row.id) {
                Some(previous) if previous != row.id => {
                    warn!(port = %port, previous, entry_id = row.id, "port claimed by more than one entry, later entry wins");
                }
                _ => {}
            }
        }
        if row.way == LaunchWay::Docker {
            self.by_container.entry(row.name.clone()).or_insert(row.id);
        }
        if row.pid > 0 {
            self.by_pid.insert(row.pid, row.id);
        }
    }

    /// Entry owning the first of the process's ports that is indexed. A
    /// process without ports falls back to container name, then pid.
    fn find(&self, process: &DiscoveredProcess) -> Option<i64> {
        if !process.ports.is_empty() {
            return process.ports.iter().find_map(|p| self.by_port.get(p).copied());
        }
        let by_name = process
            .is_container
            .then(|| self.by_container.get(&process.name).copied())
            .flatten();
        by_name.or_else(|| self.by_pid.get(&db_pid(process.pid)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistryStore;

    const WORKER: &str = "host-5";

    fn process(pid: u32, name: &str, ports: &[&str]) -> DiscoveredProcess {
        DiscoveredProcess {
            name: name.to_owned(),
            pid,
            command: format!("java -jar {name}.jar"),
            ports: ports.iter().map(|p| p.to_string()).collect(),
            catalog: format!("/opt/{name}"),
            is_container: false,
            container_name: None,
        }
    }

    fn setup() -> (Arc<MemoryRegistryStore>, Reconciler) {
        let store = Arc::new(MemoryRegistryStore::new());
        let reconciler = Reconciler::new(store.clone(), EntryLocks::new(), WorkerIdentity::fixed(WORKER));
        (store, reconciler)
    }

    async fn seed(store: &MemoryRegistryStore, name: &str, ports: &str, pid: i32, worker: &str) -> RegistryEntry {
        store
            .insert(NewEntry {
                name: name.to_owned(),
                ports: ports.to_owned(),
                pid,
                catalog: String::new(),
                run: String::new(),
                worker: worker.to_owned(),
                status: EntryStatus::Running,
                way: LaunchWay::Native,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn disjoint_processes_create_two_rows() {
        let (store, reconciler) = setup();
        let scan = [process(10, "a", &["8080"]), process(11, "b", &["9090"])];

        let report = reconciler.reconcile(&scan).await.unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 0);
        let rows = store.snapshot();
        assert!(rows.iter().all(|r| r.worker == WORKER && r.is_running()));
    }

    #[tokio::test]
    async fn shared_port_updates_existing_row() {
        let (store, reconciler) = setup();
        let row = seed(&store, "old-name", "9000,8080", 5, WORKER).await;

        let report = reconciler
            .reconcile(&[process(77, "billing", &["8080"])])
            .await
            .unwrap();

        assert_eq!((report.updated, report.created), (1, 0));
        let after = &store.snapshot()[0];
        assert_eq!(after.id, row.id);
        assert_eq!(after.pid, 77);
        assert_eq!(after.name, "billing");
        assert_eq!(after.catalog, "/opt/billing");
        assert_eq!(after.run, "java -jar billing.jar");
        assert_eq!(after.status, EntryStatus::Running);
    }

    #[tokio::test]
    async fn second_pass_creates_nothing() {
        let (store, reconciler) = setup();
        let scan = [process(10, "a", &["8080"]), process(11, "b", &["9090"])];

        reconciler.reconcile(&scan).await.unwrap();
        let second = reconciler.reconcile(&scan).await.unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn vanished_pid_is_marked_stopped_not_deleted() {
        let (store, reconciler) = setup();
        seed(&store, "gone", "7000", 123, WORKER).await;

        let report = reconciler
            .reconcile(&[process(10, "a", &["8080"])])
            .await
            .unwrap();

        assert_eq!(report.marked_stopped, 1);
        let rows = store.snapshot();
        assert_eq!(rows.len(), 2);
        let gone = rows.iter().find(|r| r.name == "gone").unwrap();
        assert_eq!(gone.status, EntryStatus::Stopped);
    }

    #[tokio::test]
    async fn other_workers_are_untouched() {
        let (store, reconciler) = setup();
        seed(&store, "remote", "8080", 999, "other-host").await;

        let report = reconciler
            .reconcile(&[process(10, "local", &["8080"])])
            .await
            .unwrap();

        assert_eq!((report.created, report.updated, report.marked_stopped), (1, 0, 0));
        let remote = store.snapshot().into_iter().find(|r| r.name == "remote").unwrap();
        assert_eq!(remote.status, EntryStatus::Running);
        assert_eq!(remote.pid, 999);
    }

    #[tokio::test]
    async fn first_matching_port_wins() {
        let (store, reconciler) = setup();
        let first = seed(&store, "first", "8080", 1, WORKER).await;
        let second = seed(&store, "second", "9090", 2, WORKER).await;

        // Ports are listed 9090 first, so the row owning 9090 is updated.
        reconciler
            .reconcile(&[process(50, "multi", &["9090", "8080"])])
            .await
            .unwrap();

        let rows = store.snapshot();
        let get = |id| rows.iter().find(|r| r.id == id).unwrap();
        assert_eq!(get(second.id).pid, 50);
        assert_eq!(get(first.id).status, EntryStatus::Stopped);
    }

    #[tokio::test]
    async fn new_rows_join_the_index_within_a_pass() {
        let (store, reconciler) = setup();
        let scan = [process(10, "a", &["8080"]), process(11, "a-worker", &["8080", "8081"])];

        let report = reconciler.reconcile(&scan).await.unwrap();

        assert_eq!((report.created, report.updated), (1, 1));
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.snapshot()[0].pid, 11);
    }

    #[tokio::test]
    async fn row_failures_are_skipped() {
        let (store, reconciler) = setup();
        let broken = seed(&store, "broken", "8080", 1, WORKER).await;
        store.fail_writes_for(broken.id);

        let report = reconciler
            .reconcile(&[process(1, "broken", &["8080"]), process(2, "fresh", &["9090"])])
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn failed_inserts_do_not_stop_updates() {
        let (store, reconciler) = setup();
        seed(&store, "kept", "8080", 1, WORKER).await;
        store.fail_inserts();

        let report = reconciler
            .reconcile(&[process(7, "kept", &["8080"]), process(8, "new", &["9090"])])
            .await
            .unwrap();

        assert_eq!((report.created, report.updated, report.failed), (0, 1, 1));
        let rows = store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 7);
    }

    #[tokio::test]
    async fn container_processes_record_docker_way() {
        let (store, reconciler) = setup();
        let mut p = process(10, "orders", &[]);
        p.is_container = true;

        reconciler.reconcile(&[p]).await.unwrap();

        let row = &store.snapshot()[0];
        assert_eq!(row.way, LaunchWay::Docker);
        assert_eq!(row.ports, "");
    }

    #[tokio::test]
    async fn portless_container_is_matched_by_name() {
        let (store, reconciler) = setup();
        let mut p = process(10, "orders", &[]);
        p.is_container = true;

        let first = reconciler.reconcile(std::slice::from_ref(&p)).await.unwrap();
        p.pid = 11;
        let second = reconciler.reconcile(std::slice::from_ref(&p)).await.unwrap();

        assert_eq!(first.created, 1);
        assert_eq!((second.created, second.updated), (0, 1));
        let rows = store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 11);
        assert_eq!(rows[0].status, EntryStatus::Running);
    }

    #[tokio::test]
    async fn portless_process_falls_back_to_pid() {
        let (store, reconciler) = setup();
        let row = seed(&store, "renamed", "", 42, WORKER).await;

        let report = reconciler.reconcile(&[process(42, "billing", &[])]).await.unwrap();

        assert_eq!((report.created, report.updated), (0, 1));
        let rows = store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, row.id);
        assert_eq!(rows[0].name, "billing");
    }
}
