use thiserror::Error;

/// Control-channel transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket handshake failed: {0}")]
    HandshakeError(String),

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
