//! Shared PostgreSQL fixture for hostwatch integration tests.
//!
//! One server per test binary, one fresh database per test. Set
//! `HOSTWATCH_TEST_PG_URL` to point at an already-running server; otherwise
//! a container is started through testcontainers on first use.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use hostwatch_db::models::{EntryStatus, LaunchWay, NewEntry, RegistryEntry};
use hostwatch_db::{pool, queries::entries};

/// Environment variable naming an external server root URL.
pub const EXTERNAL_URL_VAR: &str = "HOSTWATCH_TEST_PG_URL";

struct SharedServer {
    root_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<SharedServer> = OnceCell::const_new();

async fn start_server() -> SharedServer {
    if let Ok(url) = std::env::var(EXTERNAL_URL_VAR) {
        return SharedServer {
            root_url: url.trim_end_matches('/').to_owned(),
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("16")
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedServer {
        root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

/// Root URL of the shared server (no database name).
pub async fn pg_url() -> &'static str {
    &SERVER.get_or_init(start_server).await.root_url
}

async fn maintenance_pool() -> PgPool {
    let url = format!("{}/postgres", pg_url().await);
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .expect("failed to connect to maintenance database")
}

/// A migrated, uniquely named database. Call [`TestDb::drop`] at the end of
/// the test.
pub struct TestDb {
    pub pool: PgPool,
    pub name: String,
}

impl TestDb {
    /// Create a fresh database and apply all migrations.
    pub async fn create() -> Self {
        let name = format!("hostwatch_test_{}", Uuid::new_v4().simple());

        let maint = maintenance_pool().await;
        maint
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create database {name}: {e}"));
        maint.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/{name}", pg_url().await))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {name}: {e}"));

        pool::run_migrations(&pool)
            .await
            .expect("migrations should succeed");

        Self { pool, name }
    }

    /// Close the pool, terminate stray sessions and drop the database.
    pub async fn drop(self) {
        self.pool.close().await;

        let maint = maintenance_pool().await;
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = maint.execute(terminate.as_str()).await;
        let _ = maint
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        maint.close().await;
    }
}

/// A running native entry on `worker` listening on `ports`.
pub fn new_entry(name: &str, ports: &str, pid: i32, worker: &str) -> NewEntry {
    NewEntry {
        name: name.to_owned(),
        ports: ports.to_owned(),
        pid,
        catalog: format!("/opt/{name}"),
        run: format!("java -jar {name}.jar"),
        worker: worker.to_owned(),
        status: EntryStatus::Running,
        way: LaunchWay::Native,
    }
}

/// Insert [`new_entry`] and return the stored row.
pub async fn seed_entry(
    pool: &PgPool,
    name: &str,
    ports: &str,
    pid: i32,
    worker: &str,
) -> RegistryEntry {
    entries::insert_entry(pool, &new_entry(name, ports, pid, worker))
        .await
        .expect("seed insert should succeed")
}
