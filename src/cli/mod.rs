mod config;

pub use config::StepwiseConfig;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::api::{self, AppState};
use crate::catalog::Catalog;
use crate::engine::dispatcher::TICK_INTERVAL;
use crate::engine::{Dispatcher, Scheduler};
use crate::storage::JobStore;
use crate::storage::sqlite_store::SqliteJobStore;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_STORE_PATH: &str = "data/stepwise.db";
const DEFAULT_MACHINES_DIR: &str = "machines";
const DEFAULT_MAX_BODY: usize = 1_048_576;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Persistent state machine runner")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a YAML config file (default: auto-detect stepwise.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recover active runs, start the scheduler and serve the REST API
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// SQLite file holding run state
        #[arg(long, env = "STORE_PATH")]
        store_path: Option<PathBuf>,

        /// Directory containing one subdirectory per state machine
        #[arg(long, env = "MACHINES_DIR")]
        machines_dir: Option<PathBuf>,

        /// Basic auth username (requires --password)
        #[arg(long, env = "STEPWISE_USERNAME")]
        username: Option<String>,

        /// Basic auth password (requires --username)
        #[arg(long, env = "STEPWISE_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,
    },

    /// List the state machines found in the machines directory
    Machines {
        #[arg(long, env = "MACHINES_DIR")]
        machines_dir: Option<PathBuf>,
    },

    /// List active runs recorded in the store
    List {
        #[arg(long, env = "STORE_PATH")]
        store_path: Option<PathBuf>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Print one run record, active or finished
    Inspect {
        /// Run ID
        run_id: u64,

        #[arg(long, env = "STORE_PATH")]
        store_path: Option<PathBuf>,
    },
}

/// Effective settings for `serve` after merging CLI/env, config file and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeSettings {
    pub host: String,
    pub port: u16,
    pub store_path: PathBuf,
    pub machines_dir: PathBuf,
    pub credentials: Option<(String, String)>,
    pub max_body: usize,
}

impl ServeSettings {
    /// CLI/env values win over the config file, which wins over defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        config: StepwiseConfig,
        host: Option<String>,
        port: Option<u16>,
        store_path: Option<PathBuf>,
        machines_dir: Option<PathBuf>,
        username: Option<String>,
        password: Option<String>,
        max_body: Option<usize>,
    ) -> Self {
        let merged = StepwiseConfig {
            username: username.or(config.username),
            password: password.or(config.password),
            ..StepwiseConfig::default()
        };

        Self {
            host: host
                .or(config.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.or(config.port).unwrap_or(DEFAULT_PORT),
            store_path: store_path
                .or(config.store_path.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            machines_dir: machines_dir
                .or(config.machines_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MACHINES_DIR)),
            credentials: merged.credentials(),
            max_body: max_body.or(config.max_body).unwrap_or(DEFAULT_MAX_BODY),
        }
    }
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = StepwiseConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_path,
            machines_dir,
            username,
            password,
            max_body,
        } => {
            let settings = ServeSettings::resolve(
                config,
                host,
                port,
                store_path,
                machines_dir,
                username,
                password,
                max_body,
            );
            cmd_serve(settings).await
        }
        Commands::Machines { machines_dir } => {
            let dir = machines_dir
                .or(config.machines_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MACHINES_DIR));
            cmd_machines(&dir).await
        }
        Commands::List { store_path, format } => {
            cmd_list(&store_path_or_default(store_path, &config), &format).await
        }
        Commands::Inspect { run_id, store_path } => {
            cmd_inspect(run_id, &store_path_or_default(store_path, &config)).await
        }
    }
}

fn store_path_or_default(store_path: Option<PathBuf>, config: &StepwiseConfig) -> PathBuf {
    store_path
        .or_else(|| config.store_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH))
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn open_store(path: &Path) -> Result<SqliteJobStore> {
    SqliteJobStore::open(path)
        .await
        .with_context(|| format!("Failed to open job store: {}", path.display()))
}

/// Every step before the listener binds is fatal on failure: an unreadable
/// store, a broken catalog or an unrecoverable active set all abort startup.
async fn cmd_serve(settings: ServeSettings) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(open_store(&settings.store_path).await?);
    let catalog = Catalog::scan(&settings.machines_dir).await?;

    let scheduler = Scheduler::new(store);
    scheduler
        .recover()
        .await
        .context("Failed to recover active runs")?;

    let dispatcher = Dispatcher::start(scheduler.clone(), TICK_INTERVAL);

    if settings.credentials.is_some() {
        info!("Basic authentication enabled");
    }

    let state = Arc::new(AppState {
        scheduler,
        catalog: Arc::new(catalog),
        credentials: settings.credentials,
    });

    let served = api::serve(&settings.host, settings.port, state, settings.max_body).await;
    dispatcher.shutdown().await;
    served
}

async fn cmd_machines(dir: &Path) -> Result<()> {
    let catalog = Catalog::scan(dir).await?;

    if catalog.is_empty() {
        println!("No state machines found in {}.", dir.display());
        return Ok(());
    }

    println!("{:<24} {:<8} STATES", "MACHINE", "COUNT");
    println!("{}", "-".repeat(72));
    for machine in catalog.machines() {
        println!(
            "{:<24} {:<8} {}",
            machine.name,
            machine.states.len(),
            machine.states.join(", ")
        );
    }

    println!("\nTotal: {} machine(s)", catalog.len());
    Ok(())
}

async fn cmd_list(store_path: &Path, format: &str) -> Result<()> {
    let store = open_store(store_path).await?;
    let runs = store.load_active().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No active runs.");
        return Ok(());
    }

    println!(
        "{:<8} {:<20} {:<16} {:<8} {:<20} STATUS",
        "RUN ID", "MACHINE", "NEXT STATE", "PHASE", "NEXT RUN"
    );
    println!("{}", "-".repeat(100));

    for run in &runs {
        let next_run = run
            .next_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<8} {:<20} {:<16} {:<8} {:<20} {}",
            run.id,
            run.machine,
            run.next_state,
            run.phase(),
            next_run,
            run.status_message
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(run_id: u64, store_path: &Path) -> Result<()> {
    let store = open_store(store_path).await?;

    let run = store
        .get_run(run_id)
        .await
        .with_context(|| format!("Run '{}' not found", run_id))?;

    println!("{}", serde_json::to_string_pretty(&run)?);

    Ok(())
}
