//! Message-framed control channel over one WebSocket connection

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{TransportError, TransportResult};

/// Counters for one control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pings_received: u64,
    pub pongs_received: u64,
    pub uptime_secs: u64,
}

struct Shared {
    connection_id: String,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    created_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pings_received: AtomicU64,
    pongs_received: AtomicU64,
}

impl Shared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

/// Sending half of a control channel.
///
/// Cheap to clone; all clones share one writer task, so frames queued from
/// any clone reach the peer in the order they were queued.
#[derive(Clone)]
pub struct ControlChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("connection_id", &self.shared.connection_id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half of a control channel: yields one binary message per frame
pub struct ControlReceiver {
    connection_id: String,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl ControlReceiver {
    /// Next binary message, or `None` once the channel has ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl ControlChannel {
    /// Wrap an established WebSocket stream, spawning its reader and writer tasks
    pub fn new<S>(ws_stream: WebSocketStream<S>, remote_addr: SocketAddr) -> (Self, ControlReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        let (sink, source) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();

        let shared = Arc::new(Shared {
            connection_id: connection_id.clone(),
            remote_addr,
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            created_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            pings_received: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
        });

        tokio::spawn(Self::writer_task(sink, outbound_rx, shared.clone()));
        tokio::spawn(Self::reader_task(source, inbound_tx, shared.clone()));

        let receiver = ControlReceiver {
            connection_id,
            inbound: inbound_rx,
        };

        (Self { shared }, receiver)
    }

    /// Writer task - drains queued messages into the WebSocket
    async fn writer_task<S>(
        mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        shared: Arc<Shared>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn_id = shared.connection_id.clone();

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("[{}] Writer shutting down", conn_id);
                    // Frames queued before close() still go out.
                    while let Ok(message) = rx.try_recv() {
                        if sink.feed(message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let len = message.len() as u64;
                    if let Err(e) = sink.send(message).await {
                        error!("[{}] WebSocket send error: {}", conn_id, e);
                        break;
                    }
                    shared.bytes_sent.fetch_add(len, Ordering::Relaxed);
                }
            }
        }

        shared.mark_closed();
        let _ = sink.close().await;
        debug!("[{}] WebSocket writer task ended", conn_id);
    }

    /// Reader task - forwards binary messages and counts liveness probes
    async fn reader_task<S>(
        mut source: futures_util::stream::SplitStream<WebSocketStream<S>>,
        inbound: mpsc::UnboundedSender<Bytes>,
        shared: Arc<Shared>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn_id = shared.connection_id.clone();

        loop {
            let next = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) => {
                    shared
                        .bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    trace!("[{}] Received message, len={}", conn_id, data.len());
                    if inbound.send(Bytes::from(data)).is_err() {
                        debug!("[{}] Receiver dropped, closing channel", conn_id);
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the pong itself.
                    shared.pings_received.fetch_add(1, Ordering::Relaxed);
                    trace!("[{}] Received ping", conn_id);
                }
                Some(Ok(Message::Pong(_))) => {
                    shared.pongs_received.fetch_add(1, Ordering::Relaxed);
                    trace!("[{}] Received pong", conn_id);
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("[{}] WebSocket close received", conn_id);
                    break;
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("[{}] Ignoring text message on control channel", conn_id);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("[{}] WebSocket read error: {}", conn_id, e);
                    break;
                }
                None => {
                    debug!("[{}] WebSocket stream ended", conn_id);
                    break;
                }
            }
        }

        shared.mark_closed();
        debug!("[{}] WebSocket reader task ended", conn_id);
    }

    fn enqueue(&self, message: Message) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Queue one frame as a binary message
    pub fn send_frame(&self, frame: Bytes) -> TransportResult<()> {
        self.enqueue(Message::Binary(frame.to_vec()))
    }

    /// Queue a liveness probe
    pub fn send_ping(&self, payload: Vec<u8>) -> TransportResult<()> {
        self.enqueue(Message::Ping(payload))
    }

    /// Close the channel; idempotent
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("[{}] Closing control channel", self.shared.connection_id);
        }
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the channel has closed for any reason
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    /// True when both handles refer to the same underlying connection
    pub fn same_channel(&self, other: &ControlChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            pings_received: self.shared.pings_received.load(Ordering::Relaxed),
            pongs_received: self.shared.pongs_received.load(Ordering::Relaxed),
            uptime_secs: self.shared.created_at.elapsed().as_secs(),
        }
    }
}
