//! Transport abstraction for tunnel sessions
//!
//! A session is one client's tunnel. The relay core only needs two things
//! from it: a control stream to write protocol lines to, and a way to open a
//! new logical connection inside the tunnel. How bytes are framed, encrypted
//! or multiplexed is left to the transport implementation (QUIC, in-memory).

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use teleport_proto::ControlLine;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use memory::{memory_session, IncomingConn, MemoryPeer, MemorySession};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i UDP:{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque session identity.
///
/// Two handles denote the same tunnel iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte stream usable like an ordinary socket
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A logical connection opened through a tunnel
pub type TunnelConn = Box<dyn TunnelIo>;

/// Write half of a session's control stream.
///
/// Lines are written whole and flushed; concurrent writers (lease and
/// heartbeat) are serialised so their bytes never interleave.
pub struct Controller {
    writer: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl Controller {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            writer: Mutex::new(Box::pin(writer)),
        }
    }

    /// Write one control line. Any error means the stream is unusable.
    pub async fn send(&self, line: &ControlLine) -> TransportResult<()> {
        let bytes = line.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

/// Server-side handle to one client's tunnel
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Identity of the underlying tunnel
    fn id(&self) -> SessionId;

    /// Control stream used for `HOST`/`PING`/`ERR` lines
    fn controller(&self) -> &Controller;

    /// Open a new logical connection multiplexed inside the tunnel.
    ///
    /// `cancel` is tied to the request that needs the connection. Once it
    /// fires, a pending open returns [`TransportError::Cancelled`].
    async fn open_conn(&self, cancel: CancellationToken) -> TransportResult<TunnelConn>;
}

/// Session handle shared between the registry, heartbeat and proxy
pub type SharedSession = Arc<dyn TunnelSession>;
