use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use tunbridge::{DirectDispatcher, Listener, Server, TimeoutPolicy, TunnelConfig};

#[derive(Parser)]
#[command(
    name = "tunbridge",
    version,
    about = "Transparent TUN-to-proxy bridge"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "tunbridge.json")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge (default when no subcommand given)
    Run,

    /// Validate config file syntax without starting
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.config),
        Some(Commands::Run) | None => cmd_run(&cli.config).await,
    }
}

fn cmd_check(config_path: &str) -> Result<()> {
    let config = TunnelConfig::load(config_path)?;
    println!(
        "config ok: tun {} at {}/{} via {}",
        config.name,
        config.address,
        config.mask_prefix(),
        config.gateway
    );
    Ok(())
}

async fn cmd_run(config_path: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = TunnelConfig::load(config_path)?;
    let server = Server::new(Arc::new(DirectDispatcher), TimeoutPolicy::default())
        .with_user_level(config.user_level);

    let listener = Listener::listen(&config, Arc::new(server)).await?;
    info!(name = %config.name, "tunnel transport listening");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    listener.close().await?;
    Ok(())
}
