//! CLI for pricelist-sync: argument parsing and wiring of the sync loop, the store and the health
//! server. All synchronisation logic lives in `pricelist-sync-core`.

use crate::load_config::{load_config, AppConfig};
use crate::server;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricelist_sync_core::clock::SystemClock;
use pricelist_sync_core::contract::ListStore;
use pricelist_sync_core::download::HttpListSource;
use pricelist_sync_core::store::{JsonFileStore, MemoryListStore};
use pricelist_sync_core::SyncLoop;
use std::path::PathBuf;
use std::sync::Arc;

/// Keeps a store of travel price lists in sync with an upstream feed.
#[derive(Parser)]
#[clap(
    name = "pricelist-sync",
    version,
    about = "Mirror an expiring upstream price list into a local store"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync loop and the health server until interrupted
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Listen port, overriding config and environment
        #[clap(long)]
        port: Option<u16>,
    },
    /// Load and validate the config file, then print the effective settings
    Check {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Check { config } => {
            let config = load_config(config)?;
            tracing::info!(command = "check", "Configuration is valid");
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Run { config, port } => {
            let mut config = load_config(config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(command = "run", port = config.server.port, "Starting synchronisation");
            run_service(config).await
        }
    }
}

fn open_store(config: &AppConfig) -> Result<Arc<dyn ListStore>> {
    let store: Arc<dyn ListStore> = match &config.store.path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No store.path configured, lists are kept in memory only");
            Arc::new(MemoryListStore::new())
        }
    };
    Ok(store)
}

async fn run_service(config: AppConfig) -> Result<()> {
    let source = HttpListSource::new(config.upstream.url.clone(), config.upstream.timeout())
        .context("Failed to build upstream HTTP client")?;
    tracing::info!(url = %source.url(), "Upstream configured");
    let store = open_store(&config)?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;

    let sync = SyncLoop::new(
        config.sync.clone(),
        Arc::new(source),
        store,
        Arc::new(SystemClock),
    );
    let status = sync.status();
    let sync_task = tokio::spawn(sync.run());

    let outcome = tokio::select! {
        served = server::serve(listener, status) => {
            served.context("Health server failed")
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
            Ok(())
        }
    };

    sync_task.abort();
    outcome
}
