use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use hostwatch_db::models::{DiscoveryUpdate, EntryStatus, NewEntry, RegistryEntry};

use super::RegistryStore;
use crate::error::{HostwatchError, Result};

#[derive(Debug, Default)]
struct State {
    rows: Vec<RegistryEntry>,
    next_id: i64,
    failing: HashSet<i64>,
    fail_inserts: bool,
}

/// In-process [`RegistryStore`] with the same semantics as the table.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    state: Mutex<State>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row, ordered by id.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.state().rows.clone()
    }

    /// Make every subsequent write to entry `id` fail.
    pub fn fail_writes_for(&self, id: i64) {
        self.state().failing.insert(id);
    }

    /// Make every subsequent insert fail.
    pub fn fail_inserts(&self) {
        self.state().fail_inserts = true;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F>(&self, id: i64, op: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let mut state = self.state();
        if state.failing.contains(&id) {
            return Err(HostwatchError::persistence(
                format!("{op} entry {id}"),
                anyhow::anyhow!("injected write failure"),
            ));
        }
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| HostwatchError::not_found(format!("registry entry {id}")))?;
        apply(row);
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn list(&self, worker: Option<&str>) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .state()
            .rows
            .iter()
            .filter(|r| worker.is_none_or(|w| r.worker == w))
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<RegistryEntry>> {
        Ok(self.state().rows.iter().find(|r| r.id == id).cloned())
    }

    async fn get_by_pid(&self, pid: i32) -> Result<Option<RegistryEntry>> {
        Ok(self.state().rows.iter().find(|r| r.pid == pid).cloned())
    }

    async fn insert(&self, entry: NewEntry) -> Result<RegistryEntry> {
        let mut state = self.state();
        if state.fail_inserts {
            return Err(HostwatchError::persistence(
                "insert",
                anyhow::anyhow!("injected insert failure"),
            ));
        }
        state.next_id += 1;
        let now = Utc::now();
        let row = RegistryEntry {
            id: state.next_id,
            name: entry.name,
            ports: entry.ports,
            pid: entry.pid,
            catalog: entry.catalog,
            run: entry.run,
            script: String::new(),
            worker: entry.worker,
            status: entry.status,
            description: String::new(),
            way: entry.way,
            autostart: false,
            created_at: now,
            updated_at: now,
        };
        state.rows.push(row.clone());
        Ok(row)
    }

    async fn apply_discovery(&self, id: i64, update: DiscoveryUpdate) -> Result<()> {
        self.update(id, "update", |row| {
            row.pid = update.pid;
            row.name = update.name;
            row.catalog = update.catalog;
            row.run = update.run;
            row.way = update.way;
            row.status = EntryStatus::Running;
        })
    }

    async fn set_status(&self, id: i64, status: EntryStatus) -> Result<()> {
        self.update(id, "set status of", |row| row.status = status)
    }

    async fn set_pid_status(&self, id: i64, pid: i32, status: EntryStatus) -> Result<()> {
        self.update(id, "set pid of", |row| {
            row.pid = pid;
            row.status = status;
        })
    }
}
