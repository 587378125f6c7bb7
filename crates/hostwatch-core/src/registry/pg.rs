use async_trait::async_trait;
use sqlx::PgPool;

use hostwatch_db::models::{DiscoveryUpdate, EntryStatus, NewEntry, RegistryEntry};
use hostwatch_db::queries::entries;

use super::RegistryStore;
use crate::error::{HostwatchError, Result};

/// [`RegistryStore`] over the `registry_entries` table.
#[derive(Debug, Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn list(&self, worker: Option<&str>) -> Result<Vec<RegistryEntry>> {
        entries::list_entries(&self.pool, worker)
            .await
            .map_err(|e| HostwatchError::persistence("list", e))
    }

    async fn get(&self, id: i64) -> Result<Option<RegistryEntry>> {
        entries::get_entry(&self.pool, id)
            .await
            .map_err(|e| HostwatchError::persistence(format!("get entry {id}"), e))
    }

    async fn get_by_pid(&self, pid: i32) -> Result<Option<RegistryEntry>> {
        entries::get_entry_by_pid(&self.pool, pid)
            .await
            .map_err(|e| HostwatchError::persistence(format!("get entry for pid {pid}"), e))
    }

    async fn insert(&self, entry: NewEntry) -> Result<RegistryEntry> {
        entries::insert_entry(&self.pool, &entry)
            .await
            .map_err(|e| HostwatchError::persistence("insert", e))
    }

    async fn apply_discovery(&self, id: i64, update: DiscoveryUpdate) -> Result<()> {
        entries::apply_discovery(&self.pool, id, &update)
            .await
            .map_err(|e| HostwatchError::persistence(format!("update entry {id}"), e))
    }

    async fn set_status(&self, id: i64, status: EntryStatus) -> Result<()> {
        entries::set_status(&self.pool, id, status)
            .await
            .map_err(|e| HostwatchError::persistence(format!("set status of entry {id}"), e))
    }

    async fn set_pid_status(&self, id: i64, pid: i32, status: EntryStatus) -> Result<()> {
        entries::set_pid_status(&self.pool, id, pid, status)
            .await
            .map_err(|e| HostwatchError::persistence(format!("set pid of entry {id}"), e))
    }
}
