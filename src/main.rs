//! Resilience agent.
//!
//! Hosts the resilience layer as a long-running process.
//!
//! ```text
//!                 ┌───────────────────────────────────────────────┐
//!                 │                resilience-agent               │
//!                 │                                               │
//!   config.toml ──┼─▶ loader ─▶ ResilienceLayer ◀── watcher       │
//!                 │                  │                            │
//!                 │      ┌───────────┼────────────┐               │
//!                 │      ▼           ▼            ▼               │
//!                 │  registry   degradation   recovery loop ──────┼──▶ GET {gateway}/health
//!                 │      ▲           ▲            │               │
//!   admin client ─┼──────┴── admin ──┘            ▼               │
//!                 │                          query store          │
//!                 └───────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use gateway_resilience::admin::{self, AdminState};
use gateway_resilience::config::watcher::ConfigWatcher;
use gateway_resilience::config::{load_config, ResilienceConfig};
use gateway_resilience::lifecycle::{wait_for_signal, ResilienceLayer, Shutdown};
use gateway_resilience::observability::{logging, metrics};
use gateway_resilience::recovery::MemoryQueryStore;

const DEFAULT_ADMIN_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

#[derive(Parser, Debug)]
#[command(name = "resilience-agent", version, about = "Client-side resilience agent")]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ResilienceConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("resilience-agent v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        config = ?args.config,
        probe = %config.recovery.probe_base_url,
        admin_enabled = config.admin.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let layer = Arc::new(ResilienceLayer::build(&config, Arc::new(MemoryQueryStore::new()))?);
    let shutdown = Shutdown::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn(layer.recovery.clone().run(shutdown.subscribe())));

    if config.admin.enabled {
        if config.admin.api_key == DEFAULT_ADMIN_KEY {
            tracing::warn!("Admin API is using the default key; set admin.api_key");
        }
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let router = admin::setup_admin_router(AdminState {
            layer: layer.clone(),
            api_key: Arc::from(config.admin.api_key.as_str()),
        });
        let admin_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, router, admin_shutdown).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
    }

    // Dropping the watcher stops it, so it lives until main returns.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => {
                    let layer = layer.clone();
                    let mut stop = shutdown.subscribe();
                    tasks.push(tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                Some(new_config) = updates.recv() => layer.apply_config(&new_config),
                                _ = stop.recv() => break,
                            }
                        }
                    }));
                    Some(handle)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Config watcher failed to start, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let signal = wait_for_signal().await?;
    tracing::info!(?signal, "Shutdown signal received");
    shutdown.trigger();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
