//! Backhaul agent CLI

use anyhow::{Context, Result};
use backhaul_agent::AgentConfig;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "backhaul-agent",
    about = "Reverse-tunnel agent",
    version,
    long_about = "Connects to the agent port of each configured backhaul server and\n\
                  forwards every relayed connection to the configured target.\n\n\
                  Example:\n  \
                  backhaul-agent --config agent.yaml"
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "BACKHAUL_AGENT_CONFIG")]
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

    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    info!("Backhaul agent starting with {} links", config.agents.len());
    for agent in &config.agents {
        info!(
            "  control {} -> target {}",
            agent.control_address(),
            agent.target_address()
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

    backhaul_agent::run(config, shutdown)
        .await
        .context("Agent failed")?;

    info!("Agent stopped");
    Ok(())
}
