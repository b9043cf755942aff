//! In-process transport
//!
//! Pairs a [`MemorySession`] (what the relay sees) with a [`MemoryPeer`]
//! (what a tunnel client would hold). Logical connections are tokio duplex
//! pipes; the peer receives each one together with the cancellation token it
//! was opened with.

use crate::{Controller, SessionId, TransportError, TransportResult, TunnelConn, TunnelSession};
use async_trait::async_trait;
use std::sync::Arc;
use teleport_proto::{ControlLine, ProtoError};
use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A logical connection as seen by the peer
pub struct IncomingConn {
    pub stream: DuplexStream,
    /// Token passed to `open_conn` by the relay
    pub cancel: CancellationToken,
}

/// Relay side of an in-memory tunnel
pub struct MemorySession {
    id: SessionId,
    controller: Controller,
    conn_tx: mpsc::Sender<IncomingConn>,
}

/// Client side of an in-memory tunnel
pub struct MemoryPeer {
    control: Option<BufReader<DuplexStream>>,
    conn_rx: mpsc::Receiver<IncomingConn>,
}

/// Create a connected session/peer pair
pub fn memory_session() -> (Arc<MemorySession>, MemoryPeer) {
    let (server_control, client_control) = duplex(PIPE_CAPACITY);
    let (conn_tx, conn_rx) = mpsc::channel(16);

    let session = Arc::new(MemorySession {
        id: SessionId::new(),
        controller: Controller::new(server_control),
        conn_tx,
    });
    let peer = MemoryPeer {
        control: Some(BufReader::new(client_control)),
        conn_rx,
    };

    (session, peer)
}

#[async_trait]
impl TunnelSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn controller(&self) -> &Controller {
        &self.controller
    }

    async fn open_conn(&self, cancel: CancellationToken) -> TransportResult<TunnelConn> {
        let (near, far) = duplex(PIPE_CAPACITY);
        let incoming = IncomingConn {
            stream: far,
            cancel: cancel.clone(),
        };

        tokio::select! {
            sent = self.conn_tx.send(incoming) => {
                sent.map_err(|_| TransportError::ConnectionClosed)?;
            }
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        }

        debug!("Opened in-memory logical connection for session {}", self.id);
        Ok(Box::new(near))
    }
}

impl MemoryPeer {
    /// Read the next control line, `Ok(None)` once the relay closed it
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let Some(control) = self.control.as_mut() else {
            return Ok(None);
        };
        let mut line = String::new();
        if control.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Read and parse the next control line
    pub async fn next_message(&mut self) -> std::io::Result<Option<Result<ControlLine, ProtoError>>> {
        Ok(self.next_line().await?.map(|line| ControlLine::parse(&line)))
    }

    /// Drop the client end of the control stream; the relay's next write fails
    pub fn close_control(&mut self) {
        self.control = None;
    }

    /// Wait for the relay to open a logical connection
    pub async fn accept(&mut self) -> Option<IncomingConn> {
        self.conn_rx.recv().await
    }

    /// Stop accepting logical connections; further opens fail
    pub fn close_conns(&mut self) {
        self.conn_rx.close();
    }
}
