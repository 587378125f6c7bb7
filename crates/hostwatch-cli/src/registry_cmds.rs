//! Registry and discovery commands: `online`, `list`, `reconcile`,
//! `watch`, `update`, `delete`, `worker`, `autostart`.

use std::time::Duration;

use anyhow::{Result, bail};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use hostwatch_core::HostwatchService;
use hostwatch_core::inspect::DiscoveredProcess;
use hostwatch_db::models::{EntryInfoUpdate, RegistryEntry};
use hostwatch_db::queries::entries;

/// Truncate `s` to `width` characters, marking the cut with `...`.
pub fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_owned();
    }
    let kept: String = s.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub fn render_online(processes: &[DiscoveredProcess]) -> String {
    if processes.is_empty() {
        return "No JVM services found.\n".to_owned();
    }
    let mut out = format!(
        "{:>8}  {:<24} {:<16} {:<8} {}\n",
        "PID", "NAME", "PORTS", "WAY", "CATALOG"
    );
    out.push_str(&"-".repeat(80));
    out.push('\n');
    for p in processes {
        out.push_str(&format!(
            "{:>8}  {:<24} {:<16} {:<8} {}\n",
            p.pid,
            clip(&p.name, 24),
            clip(&p.ports_joined(), 16),
            p.way(),
            p.catalog
        ));
    }
    out
}

pub fn render_entries(rows: &[RegistryEntry]) -> String {
    if rows.is_empty() {
        return "No registry entries found.\n".to_owned();
    }
    let mut out = format!(
        "{:>6}  {:<24} {:<16} {:>8} {:<12} {:<8} {:<7}\n",
        "ID", "NAME", "PORTS", "PID", "WORKER", "STATUS", "WAY"
    );
    out.push_str(&"-".repeat(88));
    out.push('\n');
    for row in rows {
        out.push_str(&format!(
            "{:>6}  {:<24} {:<16} {:>8} {:<12} {:<8} {:<7}\n",
            row.id,
            clip(&row.name, 24),
            clip(&row.ports, 16),
            row.pid,
            clip(&row.worker, 12),
            row.status,
            row.way
        ));
    }
    out
}

pub async fn run_online(service: &HostwatchService, json: bool) -> Result<()> {
    let processes = service.list_online().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
    } else {
        print!("{}", render_online(&processes));
    }
    Ok(())
}

pub async fn run_list(service: &HostwatchService, worker: Option<&str>, json: bool) -> Result<()> {
    let rows = service.list_registry(worker).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render_entries(&rows));
    }
    Ok(())
}

pub async fn run_reconcile(service: &HostwatchService) -> Result<()> {
    let report = service.reconcile().await?;
    println!(
        "Reconciled {} processes on {}: {} updated, {} created, {} marked stopped, {} failed.",
        report.total,
        service.worker(),
        report.updated,
        report.created,
        report.marked_stopped,
        report.failed
    );
    Ok(())
}

/// Reconcile on an interval until Ctrl-C.
pub async fn run_watch(service: &HostwatchService, interval: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    println!(
        "Reconciling every {}s on {} (Ctrl-C to stop).",
        interval.as_secs(),
        service.worker()
    );
    let passes = service.run_periodic_reconcile(interval, cancel).await;
    println!("Stopped after {passes} passes.");
    Ok(())
}

pub async fn run_update(pool: &PgPool, id: i64, update: EntryInfoUpdate) -> Result<()> {
    if update.is_empty() {
        bail!("nothing to update; pass --script, --catalog or --description");
    }
    let row = entries::update_info(pool, id, &update).await?;
    println!("Entry {} ({}) updated.", row.id, row.name);
    Ok(())
}

pub async fn run_delete(pool: &PgPool, id: i64) -> Result<()> {
    entries::delete_entry(pool, id).await?;
    println!("Entry {id} deleted.");
    Ok(())
}

pub async fn run_autostart(service: &HostwatchService, name: &str) -> Result<()> {
    let enabled = service.autostart_enabled(name).await?;
    println!("{name}: {}", if enabled { "enabled" } else { "not enabled" });
    Ok(())
}
