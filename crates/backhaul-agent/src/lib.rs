//! Backhaul agent
//!
//! Dials out to a backhaul server's agent port and forwards every relayed
//! connection to a service reachable only from the agent's network.

pub mod config;
pub mod error;
pub mod linker;
pub mod service;

pub use config::AgentConfig;
pub use error::{AgentError, ConfigError};
pub use linker::{AgentLinker, LinkState, LinkerConfig};
pub use service::AgentService;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Start a linker per configured agent and run until `shutdown`
pub async fn run(config: AgentConfig, shutdown: CancellationToken) -> Result<(), AgentError> {
    let service = AgentService::start(&config.agents, &config.linker_config())?;

    shutdown.cancelled().await;
    info!("Shutting down");
    service.shutdown().await;

    Ok(())
}
