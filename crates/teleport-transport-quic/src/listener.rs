//! QUIC listener for tunnel clients

use crate::config::QuicConfig;
use crate::connection::QuicSession;
use std::net::SocketAddr;
use std::sync::Arc;
use teleport_proto::{LeaseRequest, MAX_LINE_LEN};
use teleport_transport::{TransportError, TransportResult};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info};

/// Accepts QUIC connections from tunnel clients
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    config: Arc<QuicConfig>,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        let server_config = config.build_server_config()?;

        let endpoint = quinn::Endpoint::server(server_config, bind_addr).map_err(|e| {
            TransportError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        info!("QUIC tunnel listener bound to {}", endpoint.local_addr()?);

        Ok(Self { endpoint, config })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Wait for the next connection attempt.
    ///
    /// Returns `None` once the endpoint is closed. The handshake is left to
    /// [`QuicIncoming::establish`] so a slow client never blocks the accept loop.
    pub async fn accept(&self) -> Option<QuicIncoming> {
        let incoming = self.endpoint.accept().await?;
        Some(QuicIncoming {
            incoming,
            config: self.config.clone(),
        })
    }

    /// Stop accepting and close every connection
    pub fn close(&self) {
        self.endpoint.close(quinn::VarInt::from_u32(0), b"server shutdown");
    }
}

/// What a finished handshake turned out to be
pub enum Established {
    /// A tunnel client and its opening lease request
    Tunnel(Arc<QuicSession>, LeaseRequest),
    /// An HTTP/3 client, usually one following the relay's `Alt-Svc`
    Http3(quinn::Connection),
}

/// A pending connection
pub struct QuicIncoming {
    incoming: quinn::Incoming,
    config: Arc<QuicConfig>,
}

impl QuicIncoming {
    pub fn remote_addr(&self) -> SocketAddr {
        self.incoming.remote_address()
    }

    /// Finish the QUIC handshake. For tunnel clients, also accept the control
    /// stream and read the `LEASE` line.
    pub async fn establish(self) -> TransportResult<Established> {
        let timeout = self.config.handshake_timeout;
        let remote_addr = self.remote_addr();

        tokio::time::timeout(timeout, self.handshake())
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "client {} did not send a lease request within {:?}",
                    remote_addr, timeout
                ))
            })?
    }

    async fn handshake(self) -> TransportResult<Established> {
        let connection = self
            .incoming
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        if negotiated_protocol(&connection).as_deref() == Some(crate::H3_ALPN) {
            debug!("HTTP/3 connection established from {}", connection.remote_address());
            return Ok(Established::Http3(connection));
        }
        debug!("QUIC connection established from {}", connection.remote_address());

        let (control_send, control_recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let mut reader = BufReader::new(control_recv.take(MAX_LINE_LEN as u64));
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if !line.ends_with('\n') {
            return Err(TransportError::ProtocolError(
                "lease request line missing or too long".to_string(),
            ));
        }

        let request = LeaseRequest::parse(&line)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        let control_recv = reader.into_inner().into_inner();

        let session = QuicSession::new(connection, control_send, control_recv);
        Ok(Established::Tunnel(Arc::new(session), request))
    }
}

fn negotiated_protocol(connection: &quinn::Connection) -> Option<Vec<u8>> {
    connection
        .handshake_data()?
        .downcast::<quinn::crypto::rustls::HandshakeData>()
        .ok()?
        .protocol
}

#[cfg(test)]
mod tests {
    use super::*;
    use teleport_proto::ControlLine;
    use teleport_transport::TunnelSession;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    struct TestCert {
        config: Arc<QuicConfig>,
        der: quinn::rustls::pki_types::CertificateDer<'static>,
    }

    fn test_cert() -> TestCert {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("teleport-quic-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        TestCert {
            config: Arc::new(QuicConfig::server_default(cert_path, key_path)),
            der: certified.cert.der().clone(),
        }
    }

    fn client_endpoint(cert: &TestCert, alpn: &[u8]) -> quinn::Endpoint {
        crate::ensure_crypto_provider();

        let mut roots = quinn::rustls::RootCertStore::empty();
        roots.add(cert.der.clone()).unwrap();
        let mut crypto = quinn::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        crypto.alpn_protocols = vec![alpn.to_vec()];

        let client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto).unwrap(),
        ));
        let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
        endpoint.set_default_client_config(client_config);
        endpoint
    }

    #[tokio::test]
    async fn test_session_over_quic() {
        let cert = test_cert();
        let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), cert.config.clone()).unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            let Established::Tunnel(session, request) = incoming.establish().await.unwrap() else {
                panic!("expected a tunnel session");
            };
            (listener, session, request)
        });

        let endpoint = client_endpoint(&cert, crate::ALPN);
        let connection = endpoint
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .unwrap();
        let (mut control_send, control_recv) = connection.open_bi().await.unwrap();
        control_send
            .write_all(LeaseRequest::with_candidates(["app"]).encode().as_bytes())
            .await
            .unwrap();

        let (_listener, session, request) = server.await.unwrap();
        assert_eq!(request.candidates, vec!["app"]);

        // Control lines reach the client in order
        session
            .controller()
            .send(&ControlLine::Host("app.localhost".to_string()))
            .await
            .unwrap();
        let mut control = BufReader::new(control_recv);
        let mut line = String::new();
        control.read_line(&mut line).await.unwrap();
        assert_eq!(line, "HOST app.localhost\n");

        // Logical connections are relay-opened bidirectional streams
        let mut conn = session.open_conn(CancellationToken::new()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let (_send, mut recv) = connection.accept_bi().await.unwrap();
        let mut buf = [0u8; 5];
        recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_malformed_lease_line_rejected() {
        let cert = test_cert();
        let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), cert.config.clone()).unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            incoming.establish().await.map(|_| ())
        });

        let endpoint = client_endpoint(&cert, crate::ALPN);
        let connection = endpoint
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .unwrap();
        let (mut control_send, _control_recv) = connection.open_bi().await.unwrap();
        control_send.write_all(b"GET / HTTP/1.1\n").await.unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(TransportError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_h3_client_is_handed_back() {
        let cert = test_cert();
        let listener = QuicListener::new("127.0.0.1:0".parse().unwrap(), cert.config.clone()).unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            let established = incoming.establish().await.unwrap();
            (listener, established)
        });

        let endpoint = client_endpoint(&cert, crate::H3_ALPN);
        let _connection = endpoint
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .unwrap();

        // No control stream is expected from an HTTP/3 client
        let (_listener, established) = server.await.unwrap();
        assert!(matches!(established, Established::Http3(_)));
    }
}
