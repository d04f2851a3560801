// src/main.rs

//! Entry point: starts either a CRM candidate or an LRM worker for one node,
//! reading `clusterha.toml` plus CLI overrides.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusterha::config::Config;
use clusterha::core::env::{Environment, RealEnvironment};
use clusterha::core::registry::ResourceRegistry;
use clusterha::{run_crm, run_lrm};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "clusterha", version, about = "Coordination core for a cluster-wide HA manager")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Runs the cluster resource manager, contending for the manager lock.
    Crm {
        #[arg(long, default_value = "clusterha.toml")]
        config: String,
        /// The local node name this candidate runs on.
        #[arg(long)]
        node: String,
    },
    /// Runs the local resource manager for one node.
    Lrm {
        #[arg(long, default_value = "clusterha.toml")]
        config: String,
        #[arg(long)]
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, node) = match &cli.mode {
        Mode::Crm { config, node } | Mode::Lrm { config, node } => (config.clone(), node.clone()),
    };

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration from \"{config_path}\""))?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    let env: Arc<dyn Environment> = Arc::new(RealEnvironment::new(config.cluster_dir.clone()));
    let registry = ResourceRegistry::builder().build();
    let shutdown = Arc::new(AtomicBool::new(false));

    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, draining current loop iteration");
            shutdown_for_signal.store(true, Ordering::Relaxed);
        }
    });

    let result = match cli.mode {
        Mode::Crm { .. } => {
            info!(node = %node, "starting CRM");
            run_crm(env, registry, config.crm_settings(node), shutdown).await
        }
        Mode::Lrm { .. } => {
            info!(node = %node, "starting LRM");
            run_lrm(env, registry, config.lrm_settings(node), shutdown).await
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "loop exited with an error");
    }
    result.map_err(Into::into)
}
