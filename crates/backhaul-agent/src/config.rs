//! Agent configuration file

use backhaul_proto::{Agent, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::linker::LinkerConfig;

pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// How often a disconnected linker retries its control connection
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,

    /// How often a connected linker pings the server
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    pub agents: Vec<Agent>,
}

fn default_liveness_interval_secs() -> u64 {
    DEFAULT_LIVENESS_INTERVAL_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one agent must be configured".to_string(),
            ));
        }
        if self.liveness_interval_secs == 0 || self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "livenessIntervalSecs and heartbeatIntervalSecs must be greater than 0"
                    .to_string(),
            ));
        }
        if self.max_frame_size <= HEADER_LEN {
            return Err(ConfigError::Invalid(format!(
                "maxFrameSize must be greater than {}, got {}",
                HEADER_LEN, self.max_frame_size
            )));
        }

        for (index, agent) in self.agents.iter().enumerate() {
            if agent.remote_control_host.trim().is_empty() || agent.target_host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent #{}: hosts must not be empty",
                    index
                )));
            }
            if agent.remote_control_port == 0 || agent.target_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "agent #{}: ports must be nonzero",
                    index
                )));
            }
        }

        Ok(())
    }

    pub fn linker_config(&self) -> LinkerConfig {
        LinkerConfig {
            liveness_interval: Duration::from_secs(self.liveness_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            max_frame_size: self.max_frame_size,
        }
    }
}
