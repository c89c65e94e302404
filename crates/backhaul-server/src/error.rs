//! Server error types

use backhaul_proto::FrameError;
use backhaul_transport_websocket::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that keep a single tunnel from starting
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Tunnel '{tunnel}': failed to bind control listener on port {port}: {source}")]
    ControlBind {
        tunnel: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("Tunnel '{tunnel}': failed to bind public listener on port {port}: {source}")]
    PublicBind {
        tunnel: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid frame configuration: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
