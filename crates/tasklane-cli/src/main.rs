mod config;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tasklane_core::{Clock, SystemClock};
use tasklane_orchestrator::{
    OrchestratorStatePatch, OrchestratorStateStore, Reconciler, SqliteClaimManager,
    SqliteOrchestratorStateStore, SqliteWorkerRegistry,
};
use tasklane_store::{Database, SqliteTaskStore, TaskStore};
use tasklane_sync::{AutoExportHook, SyncEngine};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tasklane", about = "Tasklane: task graph coordination over SQLite")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tasklane.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop until interrupted
    Reconcile {
        /// Run a single pass and print its report
        #[arg(long)]
        once: bool,
    },
    /// List tasks that are ready to be worked on
    Ready,
    /// Inspect or change the orchestrator state row
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Exchange tasks with the JSONL log
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the current state
    Show,
    /// Apply a JSON patch, e.g. '{"worker_pool_size": 4}'
    Set { patch: String },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Write the database to the log
    Export {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Merge the log into the database
    Import {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Rewrite the log as its net effect
    Compact {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Compare the log with the database
    Status {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Switch automatic export after every change
    Auto { mode: Toggle },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output, logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    let db = Database::open_with_timeout(&config.database_path(), config.busy_timeout())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jsonl_path = config.jsonl_path();

    let sync = Arc::new(SyncEngine::new(db.clone(), clock.clone()));
    let tasks: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::new(db.clone(), clock.clone())
            .with_hook(Arc::new(AutoExportHook::new(sync.clone(), jsonl_path.clone()))),
    );
    let state = Arc::new(SqliteOrchestratorStateStore::new(db.clone()));

    match cli.command {
        Commands::Reconcile { once } => {
            let reconciler = Arc::new(Reconciler::new(
                tasks,
                Arc::new(SqliteWorkerRegistry::new(db.clone(), clock.clone())),
                Arc::new(
                    SqliteClaimManager::new(db.clone(), clock.clone())
                        .with_stale_threshold(config.stale_threshold()),
                ),
                state,
                clock,
                config.stale_threshold(),
            ));

            if once {
                print_json(&reconciler.run_once()?)?;
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = reconciler.start(shutdown_rx);
                info!(db = %config.database_path().display(), "Reconciler running, Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                info!("Shutdown requested");
                shutdown_tx.send(true)?;
                handle.await??;
            }
        }
        Commands::Ready => print_json(&tasks.get_ready()?)?,
        Commands::State { action } => match action {
            StateAction::Show => print_json(&state.get()?)?,
            StateAction::Set { patch } => {
                let patch: OrchestratorStatePatch = serde_json::from_str(&patch)
                    .map_err(|e| anyhow::anyhow!("Invalid state patch: {e}"))?;
                print_json(&state.update(&patch)?)?;
            }
        },
        Commands::Sync { action } => match action {
            SyncAction::Export { path } => {
                print_json(&sync.export(&path.unwrap_or(jsonl_path))?)?;
            }
            SyncAction::Import { path } => {
                print_json(&sync.import(&path.unwrap_or(jsonl_path))?)?;
            }
            SyncAction::Compact { path } => {
                print_json(&sync.compact(&path.unwrap_or(jsonl_path))?)?;
            }
            SyncAction::Status { path } => {
                print_json(&sync.status(&path.unwrap_or(jsonl_path))?)?;
            }
            SyncAction::Auto { mode } => {
                match mode {
                    Toggle::On => sync.enable_auto_sync()?,
                    Toggle::Off => sync.disable_auto_sync()?,
                }
                print_json(&serde_json::json!({
                    "autoSyncEnabled": sync.is_auto_sync_enabled()?
                }))?;
            }
        },
    }

    Ok(())
}
