//! Hostname canonicalisation

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostnameError {
    #[error("Invalid hostname {host:?}: {reason}")]
    InvalidHostname { host: String, reason: String },
}

/// Canonical registry key for `raw`: IDNA to-ASCII (punycode, lowercase).
///
/// The input must not carry a port; see [`strip_port`].
pub fn normalize(raw: &str) -> Result<String, HostnameError> {
    if raw.is_empty() {
        return Err(HostnameError::InvalidHostname {
            host: raw.to_string(),
            reason: "empty hostname".to_string(),
        });
    }

    idna::domain_to_ascii(raw).map_err(|e| HostnameError::InvalidHostname {
        host: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Everything before the first `:`, or the whole input if there is none
pub fn strip_port(raw: &str) -> &str {
    raw.split_once(':').map_or(raw, |(host, _)| host)
}
