//! Server configuration file
//!
//! ```yaml
//! management: { host: 0.0.0.0, port: 8089 }
//! requestTimeoutSecs: 3600
//! maxFrameSize: 65536
//! tunnels:
//!   - { name: web, openPort: 8080, agentPort: 8081 }
//! ```

use backhaul_proto::{Tunnel, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::broker::BrokerConfig;
use crate::error::ConfigError;

/// Default request deadline: 60 minutes
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementConfig {
    #[serde(default = "default_bind_host")]
    pub host: IpAddr,
    pub port: u16,
}

impl ManagementConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Interface the tunnel listeners bind on
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    /// Read-only HTTP endpoint; disabled when absent
    #[serde(default)]
    pub management: Option<ManagementConfig>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    pub tunnels: Vec<Tunnel>,
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnels.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one tunnel must be configured".to_string(),
            ));
        }
        if self.max_frame_size <= HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "maxFrameSize must be greater than {}, got {}",
                HEADER_LEN, self.max_frame_size
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "requestTimeoutSecs must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.name.trim().is_empty() {
                return Err(ConfigError::Invalid("tunnel name must not be empty".to_string()));
            }
            if !names.insert(tunnel.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tunnel name '{}'",
                    tunnel.name
                )));
            }
            if tunnel.open_port == 0 || tunnel.agent_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tunnel '{}': ports must be nonzero",
                    tunnel.name
                )));
            }
            if tunnel.open_port == tunnel.agent_port {
                return Err(ConfigError::Invalid(format!(
                    "tunnel '{}': openPort and agentPort must differ",
                    tunnel.name
                )));
            }
            for port in [tunnel.open_port, tunnel.agent_port] {
                if !ports.insert(port) {
                    return Err(ConfigError::Invalid(format!(
                        "tunnel '{}': port {} is already used by another tunnel",
                        tunnel.name, port
                    )));
                }
            }
        }

        if let Some(management) = &self.management {
            if ports.contains(&management.port) {
                return Err(ConfigError::Invalid(format!(
                    "management port {} collides with a tunnel port",
                    management.port
                )));
            }
        }

        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_host: self.bind_host,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_frame_size: self.max_frame_size,
        }
    }
}
