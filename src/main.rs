use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use log::info;

use meshdesk::config::Config;
use meshdesk::persistence::{Repository, SCHEMA_VERSION};
use meshdesk::runtime::{Paths, Runtime};

#[derive(Parser)]
#[command(name = "meshdesk")]
#[command(about = "Headless runtime for a Meshtastic desktop client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path; defaults to the platform config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v, -vv for more).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime and drive the radio connection.
    Run {
        /// Skip the UI entirely; intended for autostart (spec.md §4.10).
        #[arg(long)]
        start_hidden: bool,
    },
    /// Write a default configuration file.
    Init,
    /// Print a JSON snapshot of node/chat counts and schema version without
    /// starting the radio.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let paths = Paths::resolve()?;
    let config_path = cli.config.clone().unwrap_or(paths.config_file);
    let database_path = paths.database_file;

    match cli.command {
        Commands::Init => {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating config directory {}", parent.display()))?;
            }
            let config = Config::create_default(&config_path);
            config.save_atomic(&config_path).await?;
            info!("configuration file created at {}", config_path.display());
        }
        Commands::Status => {
            let snapshot = status_snapshot(&config_path, &database_path)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Run { start_hidden } => {
            let _lock = acquire_single_instance_lock(&database_path)?;
            info!(
                "starting meshdesk v{} (hidden={start_hidden})",
                env!("CARGO_PKG_VERSION")
            );
            let runtime = Runtime::start(config_path, database_path).await?;
            wait_for_shutdown_signal().await;
            info!("shutting down");
            runtime.close().await;
        }
    }

    Ok(())
}

#[derive(serde::Serialize)]
struct StatusSnapshot {
    config_path: String,
    config_exists: bool,
    database_path: String,
    schema_version: i64,
    node_count: i64,
    chat_count: i64,
    /// The `status` command never starts the radio supervisor, so this is
    /// always "not_running" rather than a live `ConnectionState`.
    connection_state: &'static str,
}

fn status_snapshot(config_path: &std::path::Path, database_path: &std::path::Path) -> Result<StatusSnapshot> {
    let config_exists = config_path.exists();
    let (node_count, chat_count) = if database_path.exists() {
        let repo = Repository::open(database_path)?;
        (repo.node_count()?, repo.chat_count()?)
    } else {
        (0, 0)
    };
    Ok(StatusSnapshot {
        config_path: config_path.display().to_string(),
        config_exists,
        connection_state: "not_running",
        database_path: database_path.display().to_string(),
        schema_version: SCHEMA_VERSION,
        node_count,
        chat_count,
    })
}

/// Advisory single-instance lock: a second `run` on the same database refuses
/// to start rather than racing the first instance's writer queue.
fn acquire_single_instance_lock(database_path: &std::path::Path) -> Result<std::fs::File> {
    let lock_path = database_path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock file {}", lock_path.display()))?;
    file.try_lock_exclusive()
        .map_err(|_| anyhow!("another meshdesk instance is already running against {}", database_path.display()))?;
    Ok(file)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
