//! Static tunnel and agent definitions
//!
//! These records are produced by the configuration layer and consumed
//! read-only by the broker and the linker for the lifetime of the process.

use serde::{Deserialize, Serialize};

/// A configured route: a public port bridged through one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    /// Tunnel name
    pub name: String,
    /// Public port exposed to users
    pub open_port: u16,
    /// Port the agent's control channel connects to
    pub agent_port: u16,
}

impl Tunnel {
    pub fn new(name: impl Into<String>, open_port: u16, agent_port: u16) -> Self {
        Self {
            name: name.into(),
            open_port,
            agent_port,
        }
    }
}

/// Agent-side definition: where the server's control port is and which
/// private service to forward to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub remote_control_host: String,
    pub remote_control_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl Agent {
    /// Control channel address in "host:port" form
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.remote_control_host, self.remote_control_port)
    }

    /// Target service address in "host:port" form
    pub fn target_address(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}
