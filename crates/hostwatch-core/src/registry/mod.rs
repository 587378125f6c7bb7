//! The registry store seam and per-entry write serialization.
//!
//! Reconciliation and execution never touch the database directly; they go
//! through [`RegistryStore`]. [`PgRegistryStore`] is the production
//! implementation, [`MemoryRegistryStore`] backs tests and dry runs.

mod memory;
mod pg;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;

use hostwatch_db::models::{DiscoveryUpdate, EntryStatus, NewEntry, RegistryEntry};

use crate::error::Result;

pub use memory::MemoryRegistryStore;
pub use pg::PgRegistryStore;

/// Storage operations the core needs on registry entries.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Entries for `worker`, or every entry when `None`, ordered by id.
    async fn list(&self, worker: Option<&str>) -> Result<Vec<RegistryEntry>>;

    async fn get(&self, id: i64) -> Result<Option<RegistryEntry>>;

    async fn get_by_pid(&self, pid: i32) -> Result<Option<RegistryEntry>>;

    async fn insert(&self, entry: NewEntry) -> Result<RegistryEntry>;

    async fn apply_discovery(&self, id: i64, update: DiscoveryUpdate) -> Result<()>;

    async fn set_status(&self, id: i64, status: EntryStatus) -> Result<()>;

    async fn set_pid_status(&self, id: i64, pid: i32, status: EntryStatus) -> Result<()>;
}

type Slot = Arc<tokio::sync::Mutex<()>>;

/// One async mutex per entry id.
///
/// Every write to a row happens while holding that row's guard, so a
/// reconcile pass and a live session never interleave writes to the same
/// entry. A slot is dropped from the map once its last holder and waiter
/// are gone.
#[derive(Debug, Default, Clone)]
pub struct EntryLocks {
    slots: Arc<DashMap<i64, Slot>>,
}

impl EntryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for entry `id`.
    pub async fn lock(&self, id: i64) -> EntryGuard {
        // Clone the slot out so the shard lock is not held across the await.
        let slot = Arc::clone(self.slots.entry(id).or_default().value());
        let guard = slot.lock_owned().await;
        EntryGuard {
            guard: Some(guard),
            id,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of entries with a live slot.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Held lock on one entry. Releases on drop.
#[derive(Debug)]
pub struct EntryGuard {
    guard: Option<OwnedMutexGuard<()>>,
    id: i64,
    slots: Arc<DashMap<i64, Slot>>,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's reference left: nobody holds or waits on the slot.
        self.slots.remove_if(&self.id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Registry pids are `INTEGER`; OS pids are `u32`.
pub fn db_pid(pid: u32) -> i32 {
    i32::try_from(pid).unwrap_or(0)
}
