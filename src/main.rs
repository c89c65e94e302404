//! Backhaul CLI - reverse-tunnel server and agent in one binary

use anyhow::{Context, Result};
use backhaul_agent::AgentConfig;
use backhaul_server::ServerConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BACKHAUL_GIT_HASH"),
    ", built ",
    env!("BACKHAUL_BUILD_TIME"),
    ")"
);

/// Backhaul - expose a private service through a public relay
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, global = true, default_value = "info", env = "BACKHAUL_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay: public ports plus one agent port per tunnel
    #[command(long_about = r#"
Run the relay server. Every configured tunnel gets a public port and an
agent port; public connections are relayed to the agent currently
connected on the agent port, and refused while no agent is connected.

EXAMPLES:
  backhaul server --config server.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_SERVER_CONFIG  Server configuration file
  BACKHAUL_LOG            Log filter
    "#)]
    Server {
        /// Configuration file (YAML)
        #[arg(long, short = 'c', env = "BACKHAUL_SERVER_CONFIG")]
        config: PathBuf,
    },

    /// Run the agent: dial the relay and forward to the private target
    #[command(long_about = r#"
Run the agent. It keeps a control connection open to each configured
relay agent port, reconnecting on its liveness interval, and dials the
target service for every relayed connection.

EXAMPLES:
  backhaul agent --config agent.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_AGENT_CONFIG  Agent configuration file
  BACKHAUL_LOG           Log filter
    "#)]
    Agent {
        /// Configuration file (YAML)
        #[arg(long, short = 'c', env = "BACKHAUL_AGENT_CONFIG")]
        config: PathBuf,
    },

    /// Validate a configuration file without starting anything
    Check {
        /// Configuration file (YAML)
        config: PathBuf,

        /// Treat the file as an agent configuration
        #[arg(long)]
        agent: bool,
    },
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

/// Cancelled on Ctrl+C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        signal.cancel();
    });
    shutdown
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server { config } => {
            let config = ServerConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            info!("Backhaul {} server starting", LONG_VERSION);
            backhaul_server::run(config, shutdown_on_ctrl_c())
                .await
                .context("Server failed")?;
        }
        Commands::Agent { config } => {
            let config = AgentConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            info!("Backhaul {} agent starting", LONG_VERSION);
            backhaul_agent::run(config, shutdown_on_ctrl_c())
                .await
                .context("Agent failed")?;
        }
        Commands::Check { config, agent } => {
            if agent {
                let parsed = AgentConfig::load(&config)
                    .with_context(|| format!("Invalid agent config {}", config.display()))?;
                println!("{}: {} agents OK", config.display(), parsed.agents.len());
            } else {
                let parsed = ServerConfig::load(&config)
                    .with_context(|| format!("Invalid server config {}", config.display()))?;
                println!("{}: {} tunnels OK", config.display(), parsed.tunnels.len());
            }
        }
    }

    Ok(())
}
