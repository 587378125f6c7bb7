//! Database query functions for the `registry_entries` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{DiscoveryUpdate, EntryInfoUpdate, EntryStatus, NewEntry, RegistryEntry};

/// Insert a new registry entry. Returns the row with server-generated
/// defaults (id, timestamps, empty script/description).
pub async fn insert_entry(pool: &PgPool, entry: &NewEntry) -> Result<RegistryEntry> {
    let row = sqlx::query_as::<_, RegistryEntry>(
        "INSERT INTO registry_entries (name, ports, pid, catalog, run, worker, status, way) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(&entry.name)
    .bind(&entry.ports)
    .bind(entry.pid)
    .bind(&entry.catalog)
    .bind(&entry.run)
    .bind(&entry.worker)
    .bind(entry.status)
    .bind(entry.way)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert registry entry {:?}", entry.name))?;

    Ok(row)
}

/// Fetch a single entry by ID.
pub async fn get_entry(pool: &PgPool, id: i64) -> Result<Option<RegistryEntry>> {
    let row = sqlx::query_as::<_, RegistryEntry>("SELECT * FROM registry_entries WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch registry entry")?;

    Ok(row)
}

/// Fetch the oldest entry currently recorded with `pid`.
///
/// Pids are advisory, so more than one row may carry the same value after
/// pid reuse. The lowest id wins.
pub async fn get_entry_by_pid(pool: &PgPool, pid: i32) -> Result<Option<RegistryEntry>> {
    let row = sqlx::query_as::<_, RegistryEntry>(
        "SELECT * FROM registry_entries WHERE pid = $1 ORDER BY id ASC LIMIT 1",
    )
    .bind(pid)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch registry entry for pid {pid}"))?;

    Ok(row)
}

/// List entries ordered by id, optionally restricted to one worker.
pub async fn list_entries(pool: &PgPool, worker: Option<&str>) -> Result<Vec<RegistryEntry>> {
    let rows = match worker {
        Some(worker) => {
            sqlx::query_as::<_, RegistryEntry>(
                "SELECT * FROM registry_entries WHERE worker = $1 ORDER BY id ASC",
            )
            .bind(worker)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, RegistryEntry>("SELECT * FROM registry_entries ORDER BY id ASC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list registry entries")?;

    Ok(rows)
}

/// Overwrite the discovery-owned fields of an entry and mark it running.
pub async fn apply_discovery(pool: &PgPool, id: i64, update: &DiscoveryUpdate) -> Result<()> {
    let result = sqlx::query(
        "UPDATE registry_entries \
         SET pid = $1, name = $2, catalog = $3, run = $4, way = $5, status = $6, \
             updated_at = now() \
         WHERE id = $7",
    )
    .bind(update.pid)
    .bind(&update.name)
    .bind(&update.catalog)
    .bind(&update.run)
    .bind(update.way)
    .bind(EntryStatus::Running)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to apply discovery to entry {id}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("registry entry {id} not found");
    }

    Ok(())
}

/// Update the status of an entry.
pub async fn set_status(pool: &PgPool, id: i64, status: EntryStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE registry_entries SET status = $1, updated_at = now() WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update status of entry {id}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("registry entry {id} not found");
    }

    Ok(())
}

/// Update the pid and status of an entry in one statement.
pub async fn set_pid_status(pool: &PgPool, id: i64, pid: i32, status: EntryStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE registry_entries SET pid = $1, status = $2, updated_at = now() WHERE id = $3",
    )
    .bind(pid)
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update pid/status of entry {id}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("registry entry {id} not found");
    }

    Ok(())
}

/// Apply operator edits to script, catalog and description.
///
/// Returns the updated row.
pub async fn update_info(
    pool: &PgPool,
    id: i64,
    update: &EntryInfoUpdate,
) -> Result<RegistryEntry> {
    let row = sqlx::query_as::<_, RegistryEntry>(
        "UPDATE registry_entries \
         SET script = COALESCE($1, script), \
             catalog = COALESCE($2, catalog), \
             description = COALESCE($3, description), \
             updated_at = now() \
         WHERE id = $4 \
         RETURNING *",
    )
    .bind(update.script.as_deref())
    .bind(update.catalog.as_deref())
    .bind(update.description.as_deref())
    .bind(id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to update entry {id}"))?;

    row.with_context(|| format!("registry entry {id} not found"))
}

/// Delete a stopped entry.
///
/// Running entries are refused; stop them first.
pub async fn delete_entry(pool: &PgPool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM registry_entries WHERE id = $1 AND status = $2")
        .bind(id)
        .bind(EntryStatus::Stopped)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete entry {id}"))?;

    if result.rows_affected() == 0 {
        match get_entry(pool, id).await? {
            Some(_) => anyhow::bail!("registry entry {id} is running; stop it before deleting"),
            None => anyhow::bail!("registry entry {id} not found"),
        }
    }

    Ok(())
}
