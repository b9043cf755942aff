//! QUIC-backed tunnel session

use crate::stream::QuicStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use teleport_transport::{
    Controller, SessionId, TransportError, TransportResult, TunnelConn, TunnelSession,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A tunnel session carried by one QUIC connection
pub struct QuicSession {
    id: SessionId,
    connection: quinn::Connection,
    controller: Controller,
    // Held so the client's side of the control stream is not reset
    _control_recv: quinn::RecvStream,
}

impl QuicSession {
    pub(crate) fn new(
        connection: quinn::Connection,
        control_send: quinn::SendStream,
        control_recv: quinn::RecvStream,
    ) -> Self {
        Self {
            id: SessionId::new(),
            connection,
            controller: Controller::new(control_send),
            _control_recv: control_recv,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the underlying QUIC connection
    pub fn close(&self, reason: &str) {
        self.connection
            .close(quinn::VarInt::from_u32(0), reason.as_bytes());
    }
}

#[async_trait]
impl TunnelSession for QuicSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn controller(&self) -> &Controller {
        &self.controller
    }

    async fn open_conn(&self, cancel: CancellationToken) -> TransportResult<TunnelConn> {
        let (send, recv) = tokio::select! {
            opened = self.connection.open_bi() => {
                opened.map_err(|e| TransportError::ConnectionError(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        let stream = QuicStream::new(send, recv);
        debug!(
            "Opened QUIC stream {:?} for session {} ({})",
            stream.id(),
            self.id,
            self.remote_addr()
        );
        Ok(Box::new(stream))
    }
}

impl std::fmt::Debug for QuicSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
