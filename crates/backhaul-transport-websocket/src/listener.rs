//! WebSocket listener and connector implementations

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{ControlChannel, ControlReceiver};
use crate::config::WebSocketConfig;
use crate::error::{TransportError, TransportResult};

/// WebSocket listener accepting agent control connections
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .finish()
    }
}

impl WebSocketListener {
    pub async fn bind(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!("WebSocket listener bound to ws://{}", local_addr);

        Ok(Self {
            tcp_listener,
            config,
        })
    }

    /// Accept the next connection that completes the WebSocket handshake
    pub async fn accept(&self) -> TransportResult<(ControlChannel, ControlReceiver)> {
        loop {
            let (tcp_stream, remote_addr) = self
                .tcp_listener
                .accept()
                .await
                .map_err(TransportError::IoError)?;

            debug!("Incoming TCP connection from {}", remote_addr);

            let ws_stream = match tokio_tungstenite::accept_async_with_config(
                tcp_stream,
                Some(self.config.protocol_config()),
            )
            .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
                    continue;
                }
            };

            info!("WebSocket connection established from {}", remote_addr);
            return Ok(ControlChannel::new(ws_stream, remote_addr));
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }
}

/// WebSocket connector for the agent's outbound control connection
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: Arc<WebSocketConfig>,
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> TransportResult<(ControlChannel, ControlReceiver)> {
        let ws_url = Url::parse(&format!("ws://{}:{}{}", host, port, self.config.path))
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        debug!("Connecting to control channel at {}", ws_url);

        let tcp_stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let remote_addr = tcp_stream.peer_addr().map_err(TransportError::IoError)?;
        let _ = tcp_stream.set_nodelay(true);

        let (ws_stream, _response) = tokio_tungstenite::client_async_with_config(
            ws_url.as_str(),
            tcp_stream,
            Some(self.config.protocol_config()),
        )
        .await
        .map_err(|e| TransportError::HandshakeError(e.to_string()))?;

        info!("WebSocket connection established to {}", ws_url);

        Ok(ControlChannel::new(ws_stream, remote_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected_pair() -> (
        (ControlChannel, ControlReceiver),
        (ControlChannel, ControlReceiver),
    ) {
        let config = Arc::new(WebSocketConfig::default());
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = WebSocketConnector::new(config).unwrap();
        let (server, client) = tokio::join!(listener.accept(), connector.connect("127.0.0.1", port));
        (server.unwrap(), client.unwrap())
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways_in_order() {
        let ((server_tx, mut server_rx), (client_tx, mut client_rx)) = connected_pair().await;

        for i in 0..10u8 {
            client_tx.send_frame(Bytes::from(vec![i; 32])).unwrap();
        }
        for i in 0..10u8 {
            let msg = timeout(Duration::from_secs(5), server_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.as_ref(), vec![i; 32].as_slice());
        }

        server_tx.send_frame(Bytes::from_static(b"reply")).unwrap();
        let msg = timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_one_pong() {
        let ((server_tx, _server_rx), (client_tx, _client_rx)) = connected_pair().await;

        client_tx.send_ping(b"ping-1".to_vec()).unwrap();

        timeout(Duration::from_secs(5), async {
            while client_tx.stats().pongs_received == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // One probe, one answer.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client_tx.stats().pongs_received, 1);
        assert_eq!(server_tx.stats().pings_received, 1);
    }

    #[tokio::test]
    async fn test_close_ends_peer_receiver() {
        let ((server_tx, _server_rx), (client_tx, mut client_rx)) = connected_pair().await;

        server_tx.close();
        assert!(server_tx.is_closed());
        assert!(matches!(
            server_tx.send_frame(Bytes::from_static(b"late")),
            Err(TransportError::ChannelClosed)
        ));

        let next = timeout(Duration::from_secs(5), client_rx.recv()).await.unwrap();
        assert!(next.is_none());

        timeout(Duration::from_secs(5), client_tx.closed()).await.unwrap();
        assert!(client_tx.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_message_closes_channel() {
        let config = Arc::new(WebSocketConfig::default().with_max_frame_size(1024));
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let client_config = Arc::new(WebSocketConfig::default());
        let connector = WebSocketConnector::new(client_config).unwrap();
        let (server, client) = tokio::join!(listener.accept(), connector.connect("127.0.0.1", port));
        let (_server_tx, mut server_rx) = server.unwrap();
        let (client_tx, _client_rx) = client.unwrap();

        client_tx.send_frame(Bytes::from(vec![0u8; 4096])).unwrap();

        let next = timeout(Duration::from_secs(5), server_rx.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_same_channel() {
        let ((server_tx, _server_rx), (client_tx, _client_rx)) = connected_pair().await;

        assert!(server_tx.same_channel(&server_tx.clone()));
        assert!(!server_tx.same_channel(&client_tx));
        assert_ne!(server_tx.connection_id(), client_tx.connection_id());
    }
}
