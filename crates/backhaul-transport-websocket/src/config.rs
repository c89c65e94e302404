//! WebSocket transport configuration

use backhaul_proto::{DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TungsteniteConfig;

use crate::error::{TransportError, TransportResult};

/// Control-channel WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// WebSocket request path used by the connector (the listener accepts any path)
    pub path: String,

    /// Maximum WebSocket message size; one message carries one frame
    pub max_frame_size: usize,
}

impl WebSocketConfig {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.max_frame_size <= HEADER_LEN {
            return Err(TransportError::ConfigurationError(format!(
                "max_frame_size must exceed the {} byte frame header, got {}",
                HEADER_LEN, self.max_frame_size
            )));
        }
        if !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(format!(
                "WebSocket path must start with '/', got '{}'",
                self.path
            )));
        }
        Ok(())
    }

    /// Protocol settings applied on both ends of the channel
    pub(crate) fn protocol_config(&self) -> TungsteniteConfig {
        let mut config = TungsteniteConfig::default();
        config.max_message_size = Some(self.max_frame_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
