//! # dommesh Node Daemon
//!
//! Keeps an orchestrator per domain and periodically reconciles every domain
//! against what the cluster's hosts report.
//!
//! ## Usage
//! ```bash
//! dommesh-node --config /etc/dommesh/node.yaml
//! dommesh-node --once --log-json
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use dommesh_engine::Collaborators;
use dommesh_node::config::{LogFormat, DEFAULT_CONFIG_PATH};
use dommesh_node::{seed_mock_cluster, Args, Config, DomainRegistry, LogSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let (config, source) = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            let cfg = Config::load(config_path)?.with_cli_overrides(&args);
            (cfg, Some(config_path.clone()))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg.with_cli_overrides(&args), Some(DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => (Config::default_with_cli(&args), None),
        },
    };

    // Initialize logging
    match config.node.log_format {
        LogFormat::Pretty => dommesh_common::init_logging(&config.node.log_level)?,
        LogFormat::Json => dommesh_common::init_logging_json(&config.node.log_level)?,
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %config.node.get_name(),
        "Starting dommesh Node Daemon"
    );
    match &source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using CLI arguments and defaults"),
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e).context("Invalid configuration");
    }

    let backend = seed_mock_cluster(&config.backend);
    let registry = Arc::new(DomainRegistry::new(
        config.cluster.hosts.clone(),
        Collaborators::from_backend(backend, Arc::new(LogSink)),
        config.poll_settings(),
    ));
    for domain in &config.backend.domains {
        registry.observe(&domain.name).await;
    }

    info!(
        hosts = config.cluster.hosts.len(),
        domains = registry.len().await,
        backend = ?config.backend.kind,
        "Node daemon configured"
    );

    if args.once {
        registry.poll_once().await;
        registry.shutdown().await;
        return Ok(());
    }

    let poller = {
        let registry = Arc::clone(&registry);
        let period = config.periodic_interval();
        tokio::spawn(async move { registry.run(period).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    poller.abort();
    registry.shutdown().await;
    Ok(())
}
