//! Handle to a locally-owned socket
//!
//! The broker owns public-client sockets and the agent owns target-service
//! sockets. Either way the read half is pumped by the owner's task and the
//! write half lives behind a [`LocalSocket`], which queues writes to a
//! dedicated writer task so callers never wait on socket I/O.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Socket {0} is closed")]
pub struct SocketClosed(pub SocketAddr);

enum Command {
    Write(Bytes),
    Close,
}

struct Shared {
    peer_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    finished: CancellationToken,
}

/// Cloneable write-side handle for one local connection
#[derive(Clone)]
pub struct LocalSocket {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSocket")
            .field("peer_addr", &self.shared.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LocalSocket {
    /// Take ownership of a write half and spawn its writer task
    pub fn new<W>(writer: W, peer_addr: SocketAddr) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let finished = CancellationToken::new();

        tokio::spawn(Self::writer_task(
            writer,
            rx,
            closed.clone(),
            finished.clone(),
            peer_addr,
        ));

        Self {
            shared: Arc::new(Shared {
                peer_addr,
                commands,
                closed,
                finished,
            }),
        }
    }

    async fn writer_task<W>(
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<Command>,
        closed: Arc<AtomicBool>,
        finished: CancellationToken,
        peer_addr: SocketAddr,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Write(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!("Write to {} failed: {}", peer_addr, e);
                        break;
                    }
                    trace!("Wrote {} bytes to {}", data.len(), peer_addr);
                }
                Command::Close => break,
            }
        }

        closed.store(true, Ordering::SeqCst);
        let _ = writer.shutdown().await;
        finished.cancel();
        debug!("Socket writer for {} finished", peer_addr);
    }

    /// Queue bytes for the socket
    pub fn write(&self, data: Bytes) -> Result<(), SocketClosed> {
        if self.is_closed() {
            return Err(SocketClosed(self.shared.peer_addr));
        }
        self.shared
            .commands
            .send(Command::Write(data))
            .map_err(|_| SocketClosed(self.shared.peer_addr))
    }

    /// Close the socket after already-queued bytes are flushed.
    ///
    /// Returns true only for the call that latched the closed flag.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shared.commands.send(Command::Close);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the write half has been shut down
    pub async fn finished(&self) {
        self.shared.finished.cancelled().await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }
}
