mod config;
mod context;
mod launch_cmds;
mod registry_cmds;

use std::time::Duration;

use clap::{Parser, Subcommand};

use hostwatch_core::exec::LaunchRequest;
use hostwatch_core::identity::WorkerIdentity;
use hostwatch_db::models::EntryInfoUpdate;
use hostwatch_db::pool;

use config::HostwatchConfig;
use launch_cmds::Render;

#[derive(Parser)]
#[command(name = "hostwatch", about = "Discover, reconcile and launch JVM services on this host")]
struct Cli {
    /// Database URL (overrides HOSTWATCH_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a hostwatch config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/hostwatch")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the registry database
    DbInit,
    /// List JVM services running on this host
    Online {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List registry entries
    List {
        /// Only entries for this worker
        #[arg(long)]
        worker: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Scan once and fold the result into the registry
    Reconcile,
    /// Reconcile periodically until interrupted
    Watch {
        /// Seconds between passes (defaults to the config file value)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run an entry's command and stream its output
    Run {
        /// Registry entry ID
        id: i64,
        /// Detach under nohup and tail its log for the observation window
        #[arg(long)]
        background: bool,
        /// Kill the command after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print events as server-sent-events frames
        #[arg(long)]
        sse: bool,
    },
    /// Run an entry's script and locate the process it started
    Script {
        /// Registry entry ID
        id: i64,
        /// Print events as server-sent-events frames
        #[arg(long)]
        sse: bool,
    },
    /// Start (or with --reset, restart) an entry's container
    Docker {
        /// Registry entry ID
        id: i64,
        /// Restart even if the container is running
        #[arg(long)]
        reset: bool,
        /// Print events as server-sent-events frames
        #[arg(long)]
        sse: bool,
    },
    /// Stop an entry's process or container
    Stop {
        /// Registry entry ID
        #[arg(required_unless_present = "pid")]
        id: Option<i64>,
        /// Stop the local entry that recorded this pid instead
        #[arg(long, conflicts_with = "id")]
        pid: Option<u32>,
    },
    /// Edit an entry's operator fields
    Update {
        /// Registry entry ID
        id: i64,
        #[arg(long)]
        script: Option<String>,
        #[arg(long)]
        catalog: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a stopped entry
    Delete {
        /// Registry entry ID
        id: i64,
    },
    /// Print this host's worker name
    Worker,
    /// Check whether a service is enabled for autostart
    Autostart {
        /// Service name
        name: String,
    },
}

fn render_mode(sse: bool) -> Render {
    if sse { Render::Sse } else { Render::Plain }
}

/// Execute the `hostwatch init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    cfg.database.url = db_url.to_owned();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `hostwatch db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `hostwatch db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &HostwatchConfig) -> anyhow::Result<()> {
    println!("Initializing hostwatch database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let summary = pool::registry_summary(&db_pool).await?;
    match summary.schema_version {
        Some(version) => println!("Registry ready (schema version {version})."),
        None => println!("Registry ready."),
    }
    println!("  registry_entries: {} rows", summary.entries);
    for w in &summary.workers {
        println!("  {}: {} running / {} total", w.worker, w.running, w.total);
    }

    db_pool.close().await;
    println!("hostwatch db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that need no database.
    match &cli.command {
        Commands::Init { db_url, force } => return cmd_init(db_url, *force),
        Commands::Worker => {
            println!("{}", WorkerIdentity::detect());
            return Ok(());
        }
        _ => {}
    }

    let resolved = HostwatchConfig::resolve(cli.database_url.as_deref())?;
    if let Commands::DbInit = cli.command {
        return cmd_db_init(&resolved).await;
    }

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let service = context::build_service(&resolved, db_pool.clone());

    let result = match cli.command {
        Commands::Online { json } => registry_cmds::run_online(&service, json).await,
        Commands::List { worker, json } => {
            registry_cmds::run_list(&service, worker.as_deref(), json).await
        }
        Commands::Reconcile => registry_cmds::run_reconcile(&service).await,
        Commands::Watch { interval } => {
            let interval = interval
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or(resolved.reconcile_interval);
            registry_cmds::run_watch(&service, interval).await
        }
        Commands::Run {
            id,
            background,
            timeout,
            sse,
        } => {
            let mut request = if background {
                LaunchRequest::background()
            } else {
                LaunchRequest::foreground()
            };
            if let Some(secs) = timeout {
                request = request.with_deadline(Duration::from_secs(secs));
            }
            launch_cmds::run_launch(&service, id, request, render_mode(sse)).await
        }
        Commands::Script { id, sse } => {
            launch_cmds::run_launch(&service, id, LaunchRequest::script(), render_mode(sse)).await
        }
        Commands::Docker { id, reset, sse } => {
            launch_cmds::run_launch(&service, id, LaunchRequest::container(reset), render_mode(sse))
                .await
        }
        Commands::Stop { id, pid } => match (id, pid) {
            (_, Some(pid)) => launch_cmds::run_stop_pid(&service, pid).await,
            (Some(id), None) => launch_cmds::run_stop(&service, id).await,
            (None, None) => Err(anyhow::anyhow!("stop needs an entry id or --pid")),
        },
        Commands::Update {
            id,
            script,
            catalog,
            description,
        } => {
            let update = EntryInfoUpdate {
                script,
                catalog,
                description,
            };
            registry_cmds::run_update(&db_pool, id, update).await
        }
        Commands::Delete { id } => registry_cmds::run_delete(&db_pool, id).await,
        Commands::Autostart { name } => registry_cmds::run_autostart(&service, &name).await,
        Commands::Init { .. } | Commands::Worker | Commands::DbInit => Ok(()),
    };

    db_pool.close().await;
    result
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that touch process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
