//! Backhaul server
//!
//! Exposes one public port per tunnel and relays its connections over the
//! control channel of the single agent registered for that tunnel.

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod service;

pub use broker::{BrokerConfig, BrokerStatus, TunnelBroker};
pub use config::{ManagementConfig, ServerConfig};
pub use error::{BrokerError, ConfigError};
pub use service::TunnelService;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Start every tunnel and the management API, then serve until `shutdown`
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> std::io::Result<()> {
    let management = match &config.management {
        Some(management) => Some(TcpListener::bind(management.bind_addr()).await?),
        None => None,
    };

    let service = TunnelService::start(&config.tunnels, &config.broker_config()).await;
    if service.brokers().is_empty() {
        warn!("No tunnel could be started");
    }

    let api = management.map(|listener| {
        tokio::spawn(api::serve(
            listener,
            api::ApiState::new(config.tunnels.clone()),
            shutdown.clone(),
        ))
    });

    shutdown.cancelled().await;
    info!("Shutting down");
    service.shutdown().await;

    if let Some(api) = api {
        match api.await {
            Ok(result) => result?,
            Err(e) => warn!("Management API task failed: {}", e),
        }
    }

    Ok(())
}
