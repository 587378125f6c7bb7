//! Wiring: build a [`HostwatchService`] from resolved config and a pool.

use std::sync::Arc;

use sqlx::PgPool;

use hostwatch_core::HostwatchService;
use hostwatch_core::autostart::SystemctlRegistrar;
use hostwatch_core::container::{ContainerRuntime, DockerCli};
use hostwatch_core::exec::LiveExecutor;
use hostwatch_core::identity::WorkerIdentity;
use hostwatch_core::inspect::{ProcessInspector, ProcfsInspector};
use hostwatch_core::reconcile::Reconciler;
use hostwatch_core::registry::{EntryLocks, PgRegistryStore, RegistryStore};

use crate::config::HostwatchConfig;

pub fn build_service(config: &HostwatchConfig, pool: PgPool) -> HostwatchService {
    let store: Arc<dyn RegistryStore> = Arc::new(PgRegistryStore::new(pool));
    let containers: Arc<dyn ContainerRuntime> =
        Arc::new(DockerCli::with_binary(config.container_binary.clone()));
    let inspector: Arc<dyn ProcessInspector> = Arc::new(ProcfsInspector::new(containers.clone()));
    let locks = EntryLocks::new();

    let worker = WorkerIdentity::detect();
    tracing::debug!(worker = %worker, "worker identity");

    let reconciler = Reconciler::new(store.clone(), locks.clone(), worker);
    let executor = LiveExecutor::new(
        store.clone(),
        locks,
        inspector.clone(),
        containers,
        config.executor.clone(),
    );
    HostwatchService::new(
        store,
        inspector,
        reconciler,
        executor,
        Arc::new(SystemctlRegistrar::new()),
    )
}
