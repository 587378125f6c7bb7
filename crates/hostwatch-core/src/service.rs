//! [`HostwatchService`]: the operations the outer surfaces call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hostwatch_db::models::RegistryEntry;

use crate::autostart::AutostartRegistrar;
use crate::error::{HostwatchError, Result};
use crate::exec::{ExecutionSession, LaunchRequest, LiveExecutor};
use crate::identity::WorkerIdentity;
use crate::inspect::{DiscoveredProcess, ProcessInspector};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::registry::{RegistryStore, db_pid};
use crate::signal::StopOutcome;

/// Wires the inspector, reconciler, executor and registrar together.
pub struct HostwatchService {
    store: Arc<dyn RegistryStore>,
    inspector: Arc<dyn ProcessInspector>,
    reconciler: Reconciler,
    executor: LiveExecutor,
    autostart: Arc<dyn AutostartRegistrar>,
}

impl HostwatchService {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        inspector: Arc<dyn ProcessInspector>,
        reconciler: Reconciler,
        executor: LiveExecutor,
        autostart: Arc<dyn AutostartRegistrar>,
    ) -> Self {
        Self {
            store,
            inspector,
            reconciler,
            executor,
            autostart,
        }
    }

    pub fn worker(&self) -> &WorkerIdentity {
        self.reconciler.worker()
    }

    pub fn executor(&self) -> &LiveExecutor {
        &self.executor
    }

    /// What is running on this host right now.
    pub async fn list_online(&self) -> Result<Vec<DiscoveredProcess>> {
        self.inspector.scan().await
    }

    /// Registry rows, optionally for one worker.
    pub async fn list_registry(&self, worker: Option<&str>) -> Result<Vec<RegistryEntry>> {
        self.store.list(worker).await
    }

    /// Scan, then fold the scan into the registry.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let discovered = self.inspector.scan().await?;
        self.reconciler.reconcile(&discovered).await
    }

    pub async fn entry(&self, id: i64) -> Result<RegistryEntry> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| HostwatchError::not_found(format!("registry entry {id}")))
    }

    pub async fn launch(&self, id: i64, request: LaunchRequest) -> Result<ExecutionSession> {
        let entry = self.entry(id).await?;
        self.executor.launch(&entry, request).await
    }

    pub async fn stop(&self, id: i64) -> Result<StopOutcome> {
        let entry = self.entry(id).await?;
        self.executor.stop(&entry).await
    }

    /// Stop the entry that recorded `pid` on this worker.
    ///
    /// Pids are only meaningful on the host that recorded them, so a row
    /// owned by another worker is a conflict rather than a target.
    pub async fn stop_by_pid(&self, pid: u32) -> Result<(RegistryEntry, StopOutcome)> {
        let entry = self
            .store
            .get_by_pid(db_pid(pid))
            .await?
            .filter(|_| pid > 0)
            .ok_or_else(|| HostwatchError::not_found(format!("registry entry with pid {pid}")))?;
        if entry.worker != self.worker().as_str() {
            return Err(HostwatchError::conflict(
                entry.id,
                format!("pid {pid} was recorded by worker {}", entry.worker),
            ));
        }
        let outcome = self.executor.stop(&entry).await?;
        Ok((entry, outcome))
    }

    /// Whether `name` is enabled with the autostart registrar.
    pub async fn autostart_enabled(&self, name: &str) -> anyhow::Result<bool> {
        self.autostart.is_enabled(name).await
    }

    /// Reconcile every `interval` until `cancel` fires.
    ///
    /// A failed pass is logged and the loop keeps going. Returns the number
    /// of passes that completed.
    pub async fn run_periodic_reconcile(&self, interval: Duration, cancel: CancellationToken) -> usize {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.reconcile().await {
                    Ok(report) => {
                        passes += 1;
                        info!(pass = passes, created = report.created, updated = report.updated, "periodic reconcile");
                    }
                    Err(e) => warn!(error = %e, "periodic reconcile failed"),
                },
            }
        }

        info!(passes, "periodic reconcile stopped");
        passes
    }
}
