//! gateway-tunnel: run or inspect the control tunnel from a terminal
//!
//! `up` keeps a tunnel open until Ctrl-C; `status` reports who currently
//! provides the gateway port.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gateway_tunnel::config::{
    default_settings_path, load_settings, EnvGateway, FixedGateway, GatewayEnvironment,
    SettingsFile, StaticSettings,
};
use gateway_tunnel::{init_logging, TunnelManager};
use tracing::{debug, info};

/// Keep an SSH control tunnel to a remote gateway.
#[derive(Parser, Debug)]
#[command(name = "gateway-tunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file (defaults to ~/.gateway-tunnel/settings.json)
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the tunnel (or reuse a running one) and hold it until Ctrl-C
    Up,
    /// Print the current tunnel status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    });

    let path = match cli.config {
        Some(path) => path,
        None => default_settings_path().context("Failed to locate settings file")?,
    };
    let settings = load_settings(&path).await?;
    debug!("Loaded settings: {:?}", settings);

    let manager = build_manager(&settings);

    match cli.command.unwrap_or(Commands::Up) {
        Commands::Up => up(&manager).await,
        Commands::Status => {
            let status = manager.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn build_manager(settings: &SettingsFile) -> TunnelManager {
    let gateway: Arc<dyn GatewayEnvironment> = match settings.gateway_port {
        Some(port) => Arc::new(FixedGateway(port)),
        None => Arc::new(EnvGateway::default()),
    };

    TunnelManager::new(
        Arc::new(StaticSettings::new(settings.connection.clone())),
        gateway,
    )
    .with_options(settings.tunnel)
}

async fn up(manager: &TunnelManager) -> Result<()> {
    let port = manager
        .ensure()
        .await
        .context("Remote control channel unavailable")?;
    println!("127.0.0.1:{}", port);
    info!("Control tunnel available on 127.0.0.1:{}, Ctrl-C to stop", port);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down control tunnel");
    manager.stop_all().await;
    Ok(())
}
