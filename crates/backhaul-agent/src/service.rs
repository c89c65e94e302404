//! Runs one linker per configured agent record

use backhaul_proto::Agent;
use tracing::info;

use crate::error::AgentError;
use crate::linker::{AgentLinker, LinkState, LinkerConfig};

/// All linkers of one agent process. Each has its own control channel,
/// registry and gate.
pub struct AgentService {
    linkers: Vec<AgentLinker>,
}

impl AgentService {
    pub fn start(agents: &[Agent], config: &LinkerConfig) -> Result<Self, AgentError> {
        info!("Starting {} agent links", agents.len());

        let linkers = agents
            .iter()
            .map(|agent| AgentLinker::start(agent.clone(), config.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { linkers })
    }

    pub fn linkers(&self) -> &[AgentLinker] {
        &self.linkers
    }

    pub fn states(&self) -> Vec<LinkState> {
        self.linkers.iter().map(AgentLinker::state).collect()
    }

    pub async fn shutdown(&self) {
        for linker in &self.linkers {
            linker.shutdown().await;
        }
    }
}
