//! ---
//! actrl_section: "05-binary"
//! actrl_subsection: "binary"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Binary entrypoint for the controller node daemon."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::path::PathBuf;

use actrl_common::{init_tracing, LogFormat, NodeConfig};
use actrl_metrics::{new_registry, spawn_http_server, NodeMetrics};
use actrl_node::local::{self, ManifestActivityRepository};
use actrl_node::{ActivityRepository, ControllerNode, NodeSettings};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Activity controller node daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FORMAT", help = "Override log format (json or pretty)")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the controller node until ctrl-c")]
    Run,
    #[command(about = "List installed activities from the manifest")]
    List,
    #[command(about = "Validate the configuration and print the effective values")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/actrld.toml"));
    candidates.push(PathBuf::from("/etc/actrl/actrld.toml"));

    let loaded = NodeConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("actrld", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_node(config).await?
        }
        Commands::List => {
            let repository = ManifestActivityRepository::open(&config.repository.manifest)?;
            for activity in repository.list_all()? {
                println!(
                    "{}\t{}\t{:?}",
                    activity.uuid, activity.name, activity.autostart
                );
            }
        }
        Commands::CheckConfig => {
            let rendered = serde_json::to_string_pretty(&config)
                .context("failed to render configuration")?;
            println!("# {}\n{rendered}", loaded.source.display());
        }
    }

    Ok(())
}

async fn run_node(config: NodeConfig) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let (metrics, metrics_server) = if metrics_settings.enabled {
        let registry = new_registry();
        let metrics = NodeMetrics::new(registry.clone())?;
        info!(address = %metrics_settings.listen, "metrics exporter enabled");
        let server = spawn_http_server(registry, metrics_settings.listen)?;
        (Some(metrics), Some(server))
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let collaborators = local::collaborators(&config)?;
    let node = ControllerNode::new(
        config.controller.clone(),
        NodeSettings::from(&config.runtime),
        collaborators,
        metrics,
    );
    node.start().await?;

    info!(
        manifest = %config.repository.manifest.display(),
        storage = %config.storage.root.display(),
        "controller node running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if let Err(err) = node.shutdown().await {
        warn!(error = %err, "controller node did not shut down cleanly");
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
