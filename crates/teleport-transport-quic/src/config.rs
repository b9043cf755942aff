//! QUIC transport configuration

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use teleport_transport::{TransportError, TransportResult};

/// Server-side QUIC configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Server certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Server private key (PEM)
    pub key_path: PathBuf,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the client may open
    pub max_concurrent_streams: u32,

    /// Time allowed for the client to open its control stream and send `LEASE`
    pub handshake_timeout: Duration,
}

impl QuicConfig {
    /// Create a server configuration with certificate paths
    pub fn server_default(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 16,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval >= self.max_idle_timeout {
            return Err(TransportError::ConfigurationError(format!(
                "Keep-alive interval ({:?}) must be shorter than idle timeout ({:?})",
                self.keep_alive_interval, self.max_idle_timeout
            )));
        }

        if self.handshake_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Handshake timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        self.validate()?;
        crate::ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = vec![crate::ALPN.to_vec(), crate::H3_ALPN.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        let idle_timeout = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(
            self.max_concurrent_streams,
        ));

        server_config.transport_config(Arc::new(transport));

        Ok(server_config)
    }
}

fn load_certs(
    path: &Path,
) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(
    path: &Path,
) -> TransportResult<quinn::rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_default() {
        let config = QuicConfig::server_default("cert.pem", "key.pem");
        assert_eq!(config.keep_alive_interval, Duration::from_secs(3));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_validation() {
        let config = QuicConfig::server_default("cert.pem", "key.pem")
            .with_idle_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());

        let config = QuicConfig::server_default("cert.pem", "key.pem")
            .with_keep_alive(Duration::from_secs(10));
        assert!(config.validate().is_err());

        let config = QuicConfig::server_default("cert.pem", "key.pem")
            .with_handshake_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_cert_file() {
        let dir = std::env::temp_dir().join(format!("teleport-missing-{}", uuid::Uuid::new_v4()));
        let config = QuicConfig::server_default(dir.join("cert.pem"), dir.join("key.pem"));

        match config.build_server_config() {
            Err(TransportError::TlsError(msg)) => assert!(msg.contains("cert file")),
            other => panic!("expected TLS error, got {:?}", other.map(|_| ())),
        }
    }
}
