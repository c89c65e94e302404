//! Runs one broker per configured tunnel

use backhaul_proto::Tunnel;
use tracing::{error, info};

use crate::broker::{BrokerConfig, BrokerStatus, TunnelBroker};
use crate::error::BrokerError;

/// All tunnels of one server process.
///
/// A tunnel that fails to start is reported and skipped; the others keep
/// running.
pub struct TunnelService {
    brokers: Vec<TunnelBroker>,
    failed: Vec<(String, BrokerError)>,
}

impl TunnelService {
    pub async fn start(tunnels: &[Tunnel], config: &BrokerConfig) -> Self {
        info!("Linking {} tunnels", tunnels.len());

        let mut brokers = Vec::with_capacity(tunnels.len());
        let mut failed = Vec::new();

        for tunnel in tunnels {
            match TunnelBroker::start(tunnel.clone(), config.clone()).await {
                Ok(broker) => brokers.push(broker),
                Err(e) => {
                    error!(tunnel = %tunnel.name, "Failed to start tunnel: {}", e);
                    failed.push((tunnel.name.clone(), e));
                }
            }
        }

        info!(
            "{} of {} tunnels running",
            brokers.len(),
            tunnels.len()
        );

        Self { brokers, failed }
    }

    pub fn brokers(&self) -> &[TunnelBroker] {
        &self.brokers
    }

    pub fn broker(&self, name: &str) -> Option<&TunnelBroker> {
        self.brokers.iter().find(|broker| broker.tunnel().name == name)
    }

    /// Tunnels that could not start, with the reason
    pub fn failed(&self) -> &[(String, BrokerError)] {
        &self.failed
    }

    pub async fn statuses(&self) -> Vec<BrokerStatus> {
        let mut statuses = Vec::with_capacity(self.brokers.len());
        for broker in &self.brokers {
            statuses.push(broker.status().await);
        }
        statuses
    }

    pub async fn shutdown(&self) {
        for broker in &self.brokers {
            broker.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config() -> BrokerConfig {
        BrokerConfig {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_failure_only_skips_that_tunnel() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let tunnels = vec![
            Tunnel::new("ok", 0, 0),
            Tunnel::new("clash", 0, taken_port),
        ];
        let service = TunnelService::start(&tunnels, &local_config()).await;

        assert_eq!(service.brokers().len(), 1);
        assert!(service.broker("ok").is_some());
        assert_eq!(service.failed().len(), 1);
        assert_eq!(service.failed()[0].0, "clash");
        assert!(matches!(
            service.failed()[0].1,
            BrokerError::ControlBind { port, .. } if port == taken_port
        ));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_statuses_start_disconnected() {
        let tunnels = vec![Tunnel::new("a", 0, 0), Tunnel::new("b", 0, 0)];
        let service = TunnelService::start(&tunnels, &local_config()).await;

        let statuses = service.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses
            .iter()
            .all(|status| !status.agent_connected && status.pending_requests == 0));

        service.shutdown().await;
    }
}
