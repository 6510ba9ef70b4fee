//! Sandpit server
//!
//! Serves browser IDE connections over WebSocket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use server::config::Config;
use server::orchestrator::{OrchestratorEvent, ServerOrchestrator};
use server::store::{JsonProjectStore, ProjectRecord};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Sandpit server - sandbox orchestration and terminals for a browser IDE.
#[derive(Parser, Debug)]
#[command(name = "sandpit-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the server until interrupted
    Serve,

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Manage the local project record store
    #[command(subcommand)]
    Projects(ProjectsCommands),
}

/// Subcommands for project records.
#[derive(Subcommand, Debug, Clone)]
pub enum ProjectsCommands {
    /// List known projects
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Add or replace a project
    Add {
        /// Project id
        id: String,

        /// Owning user id
        #[arg(long)]
        owner: String,

        /// Project type, selects the sandbox template
        #[arg(long = "type", default_value = "vanillajs")]
        project_type: String,

        /// Users allowed to collaborate (repeatable)
        #[arg(long = "collaborator")]
        collaborators: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let _log_guard = init_tracing(&level, config.daemon.log_dir.as_deref());

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Serve => run_server(config).await?,
        Commands::CheckConfig => {
            println!("{}", config.to_toml()?);
        }
        Commands::Projects(command) => run_projects_command(&config, command)?,
    }

    Ok(())
}

/// Sets up logging to stderr and, with a log directory, a daily file.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sandpit-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Run the server until a shutdown signal arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Sandpit server starting...");

    let orchestrator = ServerOrchestrator::new(config)?;

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening(addr) => {
                    tracing::info!("Listening on ws://{}", addr);
                }
            }
        }
    });

    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

fn run_projects_command(config: &Config, command: ProjectsCommands) -> anyhow::Result<()> {
    let store = JsonProjectStore::new(&config.store.path);
    store.load().context("Failed to load project store")?;

    match command {
        ProjectsCommands::List { json } => {
            let projects = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else {
                print_projects_table(&projects);
            }
        }
        ProjectsCommands::Add {
            id,
            owner,
            project_type,
            collaborators,
        } => {
            let mut record = ProjectRecord::new(&id, project_type, owner);
            record.collaborators = collaborators;
            // Keep the sandbox binding when replacing a record.
            record.sandbox_id = store
                .list()?
                .into_iter()
                .find(|existing| existing.id == id)
                .and_then(|existing| existing.sandbox_id);
            store.upsert(record)?;
            store.save()?;
            println!("Saved project {} to {}", id, store.path().display());
        }
    }
    Ok(())
}

/// Print projects in a formatted ASCII table.
fn print_projects_table(projects: &[ProjectRecord]) {
    if projects.is_empty() {
        println!("No projects.");
        return;
    }

    let id_width = projects.iter().map(|p| p.id.len()).max().unwrap_or(2).max(2);
    let owner_width = projects
        .iter()
        .map(|p| p.owner_id.len())
        .max()
        .unwrap_or(5)
        .max(5);

    println!(
        "{:<id_width$}  {:<owner_width$}  {:<10}  {}",
        "ID",
        "OWNER",
        "TYPE",
        "SANDBOX",
        id_width = id_width,
        owner_width = owner_width
    );
    println!("{}", "-".repeat(id_width + owner_width + 24));

    for project in projects {
        println!(
            "{:<id_width$}  {:<owner_width$}  {:<10}  {}",
            project.id,
            project.owner_id,
            project.project_type,
            project.sandbox_id.as_deref().unwrap_or("-"),
            id_width = id_width,
            owner_width = owner_width
        );
    }

    println!();
    println!("Total: {} project(s)", projects.len());
}
