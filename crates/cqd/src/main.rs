//! cqd - Commit queue daemon
//!
//! ## Commands
//!
//! - `serve`: run the project managers, Run handlers and task dispatcher
//! - `check-config`: validate the service config and print what it declares
//! - `queue`: show a project's submission slot holder and waitlist

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cq_core::run::load_current_and_waitlist;
use cq_core::{Engine, ManualTree, OfflineSubmitter, StaticConfigProvider, SystemClock};
use cq_state::fakes::MemoryBackend;
use cq_state::{Backend, Datastore, SurrealBackend};
use tokio::sync::watch;
use tracing::{info, Level};

use crate::config::ServiceConfig;

#[derive(Parser)]
#[command(name = "cqd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Commit queue daemon", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Service config file (TOML)
    #[arg(short, long, global = true, env = "CQ_CONFIG")]
    config: Option<PathBuf>,

    /// Storage URL, overriding the config file
    #[arg(long, global = true, env = "CQ_STORE_URL")]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the commit queue until interrupted
    Serve,

    /// Validate the config file and list projects
    CheckConfig,

    /// Show the submission queue of a project
    Queue {
        /// Project name
        project: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cq_core::init_tracing(cli.json, level);

    let config = ServiceConfig::load(cli.config.as_deref())?.with_store_url(cli.store_url);

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::Queue { project } => cmd_queue(&config, &project).await,
    }
}

async fn open_store(config: &ServiceConfig) -> Result<Datastore> {
    let backend: Arc<dyn Backend> = match config.store_url.as_str() {
        "memory" => Arc::new(MemoryBackend::new()),
        "cloud" => Arc::new(
            SurrealBackend::from_env()
                .await
                .context("Failed to connect to commit queue database")?,
        ),
        url => Arc::new(
            SurrealBackend::connect(url)
                .await
                .with_context(|| format!("Failed to open store at {url}"))?,
        ),
    };
    Ok(Datastore::new(backend, Arc::new(SystemClock)))
}

async fn cmd_serve(config: ServiceConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let projects: Vec<String> = config.projects.iter().map(|p| p.project.clone()).collect();
    info!(store_url = %config.store_url, projects = ?projects, "starting commit queue");

    // Tree states and submissions stay in-process until real clients are
    // configured.
    let engine = Engine::new(
        store.clone(),
        Arc::new(StaticConfigProvider::new(config.projects.clone())),
        Arc::new(ManualTree::new()),
        Arc::new(OfflineSubmitter::new(store)),
        config.engine_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();
    worker.await.context("Engine task panicked")?;

    let pending = engine.store().next_outbox_eta().await?;
    info!(next_task_eta = ?pending, "commit queue stopped");
    Ok(())
}

fn cmd_check_config(config: &ServiceConfig) -> Result<()> {
    println!("store: {}", config.store_url);
    for project in &config.projects {
        println!("project {}", project.project);
        for group in &project.config_groups {
            let kind = match &group.combine_cls {
                Some(c) => format!("combinable, {}s stabilization", c.stabilization_delay_secs),
                None => "singular".to_string(),
            };
            let tree = group.tree_status_url.as_deref().unwrap_or("-");
            println!("  group {:<20} {:<32} tree {}", group.name, kind, tree);
        }
        if let Some(opts) = &project.submit_options {
            println!(
                "  submit: at most {} CLs per {}s",
                opts.max_burst, opts.burst_delay_secs
            );
        }
    }
    println!("✓ config OK ({} projects)", config.projects.len());
    Ok(())
}

async fn cmd_queue(config: &ServiceConfig, project: &str) -> Result<()> {
    let store = open_store(config).await?;
    let (current, waitlist) = load_current_and_waitlist(&store, project).await?;
    match current {
        Some(run_id) => println!("submitting: {run_id}"),
        None => println!("submitting: -"),
    }
    if waitlist.is_empty() {
        println!("waitlist:   empty");
    }
    for (i, run_id) in waitlist.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, run_id);
    }
    Ok(())
}
