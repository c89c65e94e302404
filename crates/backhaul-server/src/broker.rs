//! Server tunnel broker
//!
//! One broker per tunnel. It owns the control listener on `agentPort`, the
//! public listener on `openPort`, the tunnel's request registry and the slot
//! holding the single active control channel. Public connections are
//! multiplexed onto that channel as CONNECT/DATA/CLOSE frames.

use backhaul_control::{LocalSocket, RegistryError, RequestRegistry};
use backhaul_proto::frame::encode_operation;
use backhaul_proto::{Frame, FrameCodec, Opcode, RequestId, Tunnel, DEFAULT_MAX_FRAME_SIZE};
use backhaul_transport_websocket::{
    ControlChannel, ControlReceiver, WebSocketConfig, WebSocketListener,
};
use bytes::Bytes;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::error::BrokerError;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Settings shared by every broker of a server
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_host: IpAddr,
    /// Deadline after which an unresolved public request is evicted
    pub request_timeout: Duration,
    /// Maximum control-channel message size, header included
    pub max_frame_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Point-in-time view of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub name: String,
    pub agent_connected: bool,
    pub pending_requests: usize,
}

/// At most one control channel per tunnel; `None` means no usable agent
type ChannelSlot = Arc<Mutex<Option<ControlChannel>>>;

struct BrokerInner {
    tunnel: Tunnel,
    codec: FrameCodec,
    request_timeout: Duration,
    registry: RequestRegistry,
    channel: ChannelSlot,
    shutdown: CancellationToken,
}

/// Handle to a running tunnel broker
pub struct TunnelBroker {
    inner: Arc<BrokerInner>,
    control_addr: SocketAddr,
    public_addr: SocketAddr,
}

impl TunnelBroker {
    /// Bind the control listener, then the public listener, and start serving
    pub async fn start(tunnel: Tunnel, config: BrokerConfig) -> Result<Self, BrokerError> {
        let codec = FrameCodec::new(config.max_frame_size)?;
        let ws_config = Arc::new(WebSocketConfig::default().with_max_frame_size(config.max_frame_size));

        let control_listener = WebSocketListener::bind(
            SocketAddr::new(config.bind_host, tunnel.agent_port),
            ws_config,
        )
        .await
        .map_err(|source| BrokerError::ControlBind {
            tunnel: tunnel.name.clone(),
            port: tunnel.agent_port,
            source,
        })?;

        let public_listener = TcpListener::bind(SocketAddr::new(config.bind_host, tunnel.open_port))
            .await
            .map_err(|source| BrokerError::PublicBind {
                tunnel: tunnel.name.clone(),
                port: tunnel.open_port,
                source,
            })?;

        let control_addr = control_listener.local_addr()?;
        let public_addr = public_listener.local_addr()?;

        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        let registry = RequestRegistry::new().with_expiry_hook(expiry_notifier(channel.clone()));

        let inner = Arc::new(BrokerInner {
            tunnel,
            codec,
            request_timeout: config.request_timeout,
            registry,
            channel,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inner.clone().accept_control(control_listener));
        tokio::spawn(inner.clone().accept_public(public_listener));

        info!(
            tunnel = %inner.tunnel.name,
            "Tunnel linked: public {} via agent port {}",
            public_addr, control_addr
        );

        Ok(Self {
            inner,
            control_addr,
            public_addr,
        })
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.inner.tunnel
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub async fn status(&self) -> BrokerStatus {
        let agent_connected = self
            .inner
            .channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|channel| !channel.is_closed());

        BrokerStatus {
            name: self.inner.tunnel.name.clone(),
            agent_connected,
            pending_requests: self.inner.registry.len(),
        }
    }

    /// Stop accepting, drop the agent and close every public connection
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(channel) = self.inner.channel.lock().await.take() {
            channel.close();
        }
        let closed = self.inner.registry.close_all();
        info!(
            tunnel = %self.inner.tunnel.name,
            "Tunnel stopped, closed {} requests", closed
        );
    }
}

impl Drop for TunnelBroker {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Tell the agent about requests the deadline evicted
fn expiry_notifier(channel: ChannelSlot) -> impl Fn(RequestId) + Send + Sync + 'static {
    move |request_id| {
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Some(channel) = channel.lock().await.as_ref() {
                let _ = channel.send_frame(encode_operation(request_id, Opcode::Close));
            }
        });
    }
}

impl BrokerInner {
    async fn accept_control(self: Arc<Self>, listener: WebSocketListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((channel, receiver)) => {
                    self.install_channel(channel.clone()).await;
                    tokio::spawn(self.clone().serve_channel(channel, receiver));
                }
                Err(e) => {
                    error!(tunnel = %self.tunnel.name, "Control accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!(tunnel = %self.tunnel.name, "Control listener stopped");
    }

    /// Newest channel wins: the previous one is closed along with its requests
    async fn install_channel(&self, channel: ControlChannel) {
        let mut slot = self.channel.lock().await;
        if let Some(previous) = slot.replace(channel.clone()) {
            previous.close();
            let closed = self.registry.close_all();
            info!(
                tunnel = %self.tunnel.name,
                previous = %previous.connection_id(),
                "Replaced control channel, closed {} requests", closed
            );
        }
        info!(
            tunnel = %self.tunnel.name,
            connection_id = %channel.connection_id(),
            "Agent connected from {}",
            channel.remote_address()
        );
    }

    async fn serve_channel(self: Arc<Self>, channel: ControlChannel, mut receiver: ControlReceiver) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = receiver.recv() => message,
            };
            let Some(message) = message else { break };
            self.handle_agent_message(message);
        }

        self.release_channel(&channel).await;
    }

    async fn release_channel(&self, channel: &ControlChannel) {
        channel.close();

        let mut slot = self.channel.lock().await;
        let is_current = slot
            .as_ref()
            .is_some_and(|current| current.same_channel(channel));
        if !is_current {
            return;
        }

        slot.take();
        let closed = self.registry.close_all();
        info!(
            tunnel = %self.tunnel.name,
            connection_id = %channel.connection_id(),
            "Agent disconnected, closed {} requests", closed
        );
    }

    fn handle_agent_message(&self, message: Bytes) {
        let frame = match self.codec.decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(tunnel = %self.tunnel.name, "Dropping malformed frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Data {
                request_id,
                payload,
            } => match self.registry.get(&request_id) {
                Some(socket) if !socket.is_closed() => {
                    trace!(request_id = %request_id, "Agent -> client {} bytes", payload.len());
                    if socket.write(payload).is_err() {
                        debug!(request_id = %request_id, "Client socket closed mid-write");
                    }
                }
                _ => debug!(request_id = %request_id, "Dropping DATA for stale request"),
            },
            Frame::Close { request_id } => {
                if self.registry.close(&request_id) {
                    debug!(request_id = %request_id, "Agent closed request");
                } else {
                    debug!(request_id = %request_id, "Ignoring CLOSE for stale request");
                }
            }
            Frame::Connect { request_id } => {
                warn!(request_id = %request_id, "Ignoring CONNECT sent by agent");
            }
        }
    }

    async fn accept_public(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(self.clone().handle_public(stream, peer));
                }
                Err(e) => {
                    error!(tunnel = %self.tunnel.name, "Public accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!(tunnel = %self.tunnel.name, "Public listener stopped");
    }

    async fn handle_public(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let socket = LocalSocket::new(writer, peer);

        let request_id = loop {
            let candidate = RequestId::new_v4();
            match self
                .registry
                .register_with_deadline(candidate, socket.clone(), self.request_timeout)
            {
                Ok(()) => break candidate,
                Err(RegistryError::DuplicateRequest(id)) => {
                    warn!(request_id = %id, "Request id collision, regenerating");
                }
            }
        };

        // The registry check catches a channel swap that tore this request
        // down between registration and here.
        let channel = {
            let slot = self.channel.lock().await;
            match slot.as_ref() {
                Some(channel) if !channel.is_closed() && self.registry.contains(&request_id) => {
                    channel
                        .send_frame(self.codec.encode_operation(request_id, Opcode::Connect))
                        .ok()
                        .map(|()| channel.clone())
                }
                _ => None,
            }
        };

        let Some(channel) = channel else {
            self.registry.remove(&request_id);
            socket.close();
            info!(
                tunnel = %self.tunnel.name,
                "No agent connected, closing public connection from {}",
                peer
            );
            return;
        };

        debug!(
            tunnel = %self.tunnel.name,
            request_id = %request_id,
            "Public connection from {}",
            peer
        );
        self.pump_public(reader, request_id, socket, channel).await;
    }

    /// Client bytes become DATA frames until either side closes
    async fn pump_public(
        &self,
        mut reader: OwnedReadHalf,
        request_id: RequestId,
        socket: LocalSocket,
        channel: ControlChannel,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                _ = socket.finished() => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(request_id = %request_id, "Public client closed");
                    break;
                }
                Ok(n) => {
                    trace!(request_id = %request_id, "Client -> agent {} bytes", n);
                    if !self.forward(&channel, request_id, &buf[..n]) {
                        debug!(request_id = %request_id, "Control channel gone, dropping request");
                        break;
                    }
                }
                Err(e) => {
                    debug!(request_id = %request_id, "Public client read error: {}", e);
                    break;
                }
            }
        }

        if self.registry.remove(&request_id).is_some() {
            let _ = channel.send_frame(self.codec.encode_operation(request_id, Opcode::Close));
        }
        socket.close();
    }

    fn forward(&self, channel: &ControlChannel, request_id: RequestId, data: &[u8]) -> bool {
        self.codec
            .encode_data_chunks(request_id, data)
            .all(|chunk| channel.send_frame(chunk).is_ok())
    }
}
