use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;
use crate::models::EntryStatus;

/// Migrations embedded at compile time from `crates/hostwatch-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Connect to the registry.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to registry at {}", config.database_url))
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run registry migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "registry schema up to date");
    Ok(())
}

/// Create the registry database through the `postgres` maintenance
/// database when it does not exist yet.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = config.creatable_name()?;
    let maintenance_url = config.maintenance_url();

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.acquire_timeout)
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(db_name)
        .fetch_one(&maint_pool)
        .await
        .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "registry database already exists");
    } else {
        maint_pool
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "registry database created");
    }

    maint_pool.close().await;
    Ok(())
}

/// Row counts for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCount {
    pub worker: String,
    pub running: i64,
    pub total: i64,
}

/// State of the registry after `db-init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySummary {
    /// Latest applied migration version.
    pub schema_version: Option<i64>,
    pub entries: i64,
    /// Ordered by worker name.
    pub workers: Vec<WorkerCount>,
}

/// Summarize the registry table. Fails if the schema is missing.
pub async fn registry_summary(pool: &PgPool) -> Result<RegistrySummary> {
    let table: Option<String> = sqlx::query_scalar("SELECT to_regclass('public.registry_entries')::text")
        .fetch_one(pool)
        .await
        .context("failed to look up registry_entries")?;
    if table.is_none() {
        bail!("registry_entries table is missing; run `hostwatch db-init`");
    }

    let schema_version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
            .fetch_one(pool)
            .await
            .context("failed to read migration history")?;

    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT worker, \
                COUNT(*) FILTER (WHERE status = $1), \
                COUNT(*) \
         FROM registry_entries \
         GROUP BY worker \
         ORDER BY worker",
    )
    .bind(EntryStatus::Running.code())
    .fetch_all(pool)
    .await
    .context("failed to count registry entries")?;

    let workers: Vec<WorkerCount> = rows
        .into_iter()
        .map(|(worker, running, total)| WorkerCount { worker, running, total })
        .collect();
    Ok(RegistrySummary {
        schema_version,
        entries: workers.iter().map(|w| w.total).sum(),
        workers,
    })
}
