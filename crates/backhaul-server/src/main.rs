//! Backhaul server CLI

use anyhow::{Context, Result};
use backhaul_server::ServerConfig;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "backhaul-server",
    about = "Reverse-tunnel relay server",
    version,
    long_about = "Exposes one public port per configured tunnel and relays each\n\
                  connection to the agent registered on the tunnel's agent port.\n\n\
                  Example:\n  \
                  backhaul-server --config server.yaml --log-level debug"
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "BACKHAUL_SERVER_CONFIG")]
    config: PathBuf,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, default_value = "info", env = "BACKHAUL_LOG")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    info!("Backhaul server starting with {} tunnels", config.tunnels.len());
    for tunnel in &config.tunnels {
        info!(
            "  {}: public port {}, agent port {}",
            tunnel.name, tunnel.open_port, tunnel.agent_port
        );
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        signal.cancel();
    });

    backhaul_server::run(config, shutdown)
        .await
        .context("Server failed")?;

    info!("Server stopped");
    Ok(())
}
