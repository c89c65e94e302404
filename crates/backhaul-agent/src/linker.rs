//! Agent tunnel client
//!
//! An [`AgentLinker`] keeps one control channel open to the server's agent
//! port. For every CONNECT it dials the configured target and relays bytes
//! between that target connection and the channel.
//!
//! Reconnection is passive: a liveness tick checks the state and starts a
//! new connection attempt only while disconnected.

use backhaul_control::{GateGuard, LocalSocket, RequestGate, RequestRegistry};
use backhaul_proto::{Agent, Frame, FrameCodec, Opcode, RequestId, DEFAULT_MAX_FRAME_SIZE};
use backhaul_transport_websocket::{
    ControlChannel, ControlReceiver, WebSocketConfig, WebSocketConnector,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_LIVENESS_INTERVAL_SECS};
use crate::error::AgentError;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const CONNECT_GATE: &str = "control-connect";

/// Control channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LinkState::Disconnected => "DISCONNECTED",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Poll interval for reconnecting a lost control channel
    pub liveness_interval: Duration,
    /// Ping interval while connected
    pub heartbeat_interval: Duration,
    /// Maximum control-channel message size, header included
    pub max_frame_size: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct LinkerInner {
    agent: Agent,
    config: LinkerConfig,
    codec: FrameCodec,
    connector: WebSocketConnector,
    registry: RequestRegistry,
    gate: RequestGate<RequestId>,
    connect_gate: RequestGate<&'static str>,
    channel: Mutex<Option<ControlChannel>>,
    state: watch::Sender<LinkState>,
    shutdown: CancellationToken,
}

/// Handle to a running linker for one [`Agent`] record
pub struct AgentLinker {
    inner: Arc<LinkerInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentLinker {
    /// Start the liveness and heartbeat timers. Must be called within a
    /// tokio runtime; the first connection attempt happens immediately.
    pub fn start(agent: Agent, config: LinkerConfig) -> Result<Self, AgentError> {
        if config.liveness_interval.is_zero() || config.heartbeat_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "liveness and heartbeat intervals must be nonzero".to_string(),
            ));
        }

        let codec = FrameCodec::new(config.max_frame_size)?;
        let connector = WebSocketConnector::new(Arc::new(
            WebSocketConfig::default().with_max_frame_size(config.max_frame_size),
        ))?;
        let (state, _) = watch::channel(LinkState::Disconnected);

        let inner = Arc::new(LinkerInner {
            agent,
            config,
            codec,
            connector,
            registry: RequestRegistry::new(),
            gate: RequestGate::new(),
            connect_gate: RequestGate::new(),
            channel: Mutex::new(None),
            state,
            shutdown: CancellationToken::new(),
        });

        info!(
            "Linking agent: control {} -> target {}",
            inner.agent.control_address(),
            inner.agent.target_address()
        );

        let tasks = vec![
            tokio::spawn(inner.clone().liveness_loop()),
            tokio::spawn(inner.clone().heartbeat_loop()),
        ];

        Ok(Self { inner, tasks })
    }

    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Wait until the linker reaches `state`
    pub async fn wait_for_state(&self, state: LinkState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Target connections currently open
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Close the control channel and every target connection, then stop
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }

        if let Some(channel) = self.inner.channel.lock().await.take() {
            channel.close();
        }
        let closed = self.inner.registry.close_all();
        self.inner.set_state(LinkState::Disconnected);
        info!(
            "Agent for {} stopped, closed {} target connections",
            self.inner.agent.control_address(),
            closed
        );
    }
}

impl Drop for AgentLinker {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl LinkerInner {
    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.state() != LinkState::Disconnected {
                continue;
            }
            if let Some(guard) = self.connect_gate.try_enter(CONNECT_GATE) {
                let this = self.clone();
                tokio::spawn(async move {
                    this.connect().await;
                    drop(guard);
                });
            }
        }
    }

    async fn connect(self: Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.set_state(LinkState::Connecting);
        let host = self.agent.remote_control_host.as_str();
        let port = self.agent.remote_control_port;
        debug!("Connecting to control channel at {}:{}", host, port);

        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.set_state(LinkState::Disconnected);
                return;
            }
            connected = self.connector.connect(host, port) => connected,
        };

        let (channel, receiver) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    "Control connection to {}:{} failed, retrying in {:?}: {}",
                    host, port, self.config.liveness_interval, e
                );
                self.set_state(LinkState::Disconnected);
                return;
            }
        };

        {
            let mut slot = self.channel.lock().await;
            if self.shutdown.is_cancelled() {
                channel.close();
                self.set_state(LinkState::Disconnected);
                return;
            }
            *slot = Some(channel.clone());
        }
        self.set_state(LinkState::Connected);
        info!(
            connection_id = %channel.connection_id(),
            "Control channel connected to {}:{}",
            host, port
        );

        tokio::spawn(self.clone().serve_channel(channel, receiver));
    }

    async fn serve_channel(self: Arc<Self>, channel: ControlChannel, mut receiver: ControlReceiver) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = receiver.recv() => message,
            };
            let Some(message) = message else { break };
            self.handle_frame(&channel, message);
        }

        self.teardown(&channel).await;
    }

    /// Drop everything tied to `channel` if it is still the active one
    async fn teardown(&self, channel: &ControlChannel) {
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
        self.set_state(LinkState::Disconnected);
        info!(
            connection_id = %channel.connection_id(),
            "Control channel lost, closed {} target connections", closed
        );
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let channel = self.channel.lock().await.clone();
            let Some(channel) = channel else { continue };

            if let Err(e) = channel.send_ping(Vec::new()) {
                warn!(
                    connection_id = %channel.connection_id(),
                    "Heartbeat failed: {}", e
                );
                self.teardown(&channel).await;
            } else {
                trace!(connection_id = %channel.connection_id(), "Heartbeat sent");
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, channel: &ControlChannel, message: Bytes) {
        let frame = match self.codec.decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Connect { request_id } => {
                if self.registry.contains(&request_id) {
                    warn!(request_id = %request_id, "Duplicate CONNECT");
                }
                let ticket = self.gate.enter(request_id);
                let this = self.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    let guard = ticket.acquire().await;
                    this.open_target(request_id, guard, channel).await;
                });
            }
            Frame::Data {
                request_id,
                payload,
            } => {
                let channel = channel.clone();
                self.gated(request_id, move |this| this.write_target(&channel, request_id, payload));
            }
            Frame::Close { request_id } => {
                self.gated(request_id, move |this| {
                    if this.registry.close(&request_id) {
                        debug!(request_id = %request_id, "Server closed request");
                    } else {
                        debug!(request_id = %request_id, "Ignoring CLOSE for stale request");
                    }
                });
            }
        }
    }

    /// Run `action` once every earlier frame for `request_id` has been applied
    fn gated<F>(self: &Arc<Self>, request_id: RequestId, action: F)
    where
        F: FnOnce(&LinkerInner) + Send + 'static,
    {
        match self.gate.enter(request_id).try_acquire() {
            Ok(_guard) => action(self),
            Err(ticket) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let _guard = ticket.acquire().await;
                    action(&this);
                });
            }
        }
    }

    fn write_target(&self, channel: &ControlChannel, request_id: RequestId, payload: Bytes) {
        let Some(socket) = self.registry.get(&request_id) else {
            debug!(request_id = %request_id, "Dropping DATA for stale request");
            return;
        };

        trace!(request_id = %request_id, "Server -> target {} bytes", payload.len());
        if socket.write(payload).is_err() {
            debug!(request_id = %request_id, "Target socket closed mid-write");
            self.registry.remove(&request_id);
            let _ = channel.send_frame(self.codec.encode_operation(request_id, Opcode::Close));
        }
    }

    async fn open_target(
        self: Arc<Self>,
        request_id: RequestId,
        guard: GateGuard<RequestId>,
        channel: ControlChannel,
    ) {
        let target = (self.agent.target_host.as_str(), self.agent.target_port);
        let stream = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    "Target {} unreachable: {}",
                    self.agent.target_address(),
                    e
                );
                self.report_dial_failure(&channel, request_id);
                return;
            }
        };

        let _ = stream.set_nodelay(true);
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(request_id = %request_id, "Target connection dropped: {}", e);
                self.report_dial_failure(&channel, request_id);
                return;
            }
        };
        let (reader, writer) = stream.into_split();
        let socket = LocalSocket::new(writer, peer);

        if channel.is_closed() {
            socket.close();
            return;
        }
        if let Err(e) = self.registry.register(request_id, socket.clone()) {
            debug!(request_id = %request_id, "Discarding target connection: {}", e);
            socket.close();
            return;
        }
        // A teardown racing the registration above has already drained the
        // registry; nothing else will close this socket.
        if channel.is_closed() {
            self.registry.close(&request_id);
            return;
        }

        debug!(request_id = %request_id, "Target connected at {}", peer);
        drop(guard);

        self.pump_target(reader, request_id, socket, channel).await;
    }

    /// A failed dial for a duplicate CONNECT leaves the live request alone
    fn report_dial_failure(&self, channel: &ControlChannel, request_id: RequestId) {
        if self.registry.contains(&request_id) {
            debug!(request_id = %request_id, "Keeping existing target connection");
            return;
        }
        let _ = channel.send_frame(self.codec.encode_operation(request_id, Opcode::Close));
    }

    /// Target bytes become DATA frames until either side closes
    async fn pump_target(
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
                    debug!(request_id = %request_id, "Target closed");
                    break;
                }
                Ok(n) => {
                    trace!(request_id = %request_id, "Target -> server {} bytes", n);
                    let sent = self
                        .codec
                        .encode_data_chunks(request_id, &buf[..n])
                        .all(|chunk| channel.send_frame(chunk).is_ok());
                    if !sent {
                        break;
                    }
                }
                Err(e) => {
                    debug!(request_id = %request_id, "Target read error: {}", e);
                    break;
                }
            }
        }

        let _guard = self.gate.enter(request_id).acquire().await;
        if self.registry.remove(&request_id).is_some() {
            let _ = channel.send_frame(self.codec.encode_operation(request_id, Opcode::Close));
        }
        socket.close();
    }
}
