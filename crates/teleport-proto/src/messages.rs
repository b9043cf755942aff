//! Control line types

use std::fmt;
use thiserror::Error;

/// Errors produced while parsing control lines
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Empty control line")]
    Empty,

    #[error("Unknown control verb: {0}")]
    UnknownVerb(String),

    #[error("Malformed {verb} line: {line}")]
    Malformed { verb: &'static str, line: String },
}

/// A line written by the server on a session's control stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// Lease succeeded; the client is reachable at this hostname
    Host(String),
    /// Liveness probe, no reply expected
    Ping,
    /// Lease rejected
    Err {
        reason: String,
        candidates: Vec<String>,
    },
}

impl ControlLine {
    /// Wire form, including the trailing newline
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    /// Parse a single line as received by a tunnel client.
    /// A trailing `\n` or `\r\n` is ignored.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ProtoError::Empty);
        }

        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "PING" if rest.is_empty() => Ok(ControlLine::Ping),
            "HOST" if !rest.is_empty() && !rest.contains(' ') => {
                Ok(ControlLine::Host(rest.to_string()))
            }
            "ERR" => {
                let malformed = || ProtoError::Malformed {
                    verb: "ERR",
                    line: line.to_string(),
                };
                let (reason, list) = rest.rsplit_once(": ").ok_or_else(malformed)?;
                let list = list
                    .strip_prefix('[')
                    .and_then(|l| l.strip_suffix(']'))
                    .ok_or_else(malformed)?;
                Ok(ControlLine::Err {
                    reason: reason.to_string(),
                    candidates: list.split_whitespace().map(str::to_string).collect(),
                })
            }
            "PING" | "HOST" => Err(ProtoError::Malformed {
                verb: if verb == "PING" { "PING" } else { "HOST" },
                line: line.to_string(),
            }),
            other => Err(ProtoError::UnknownVerb(other.to_string())),
        }
    }
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlLine::Host(host) => write!(f, "HOST {}", host),
            ControlLine::Ping => f.write_str("PING"),
            ControlLine::Err { reason, candidates } => {
                write!(f, "ERR {}: [{}]", reason, candidates.join(" "))
            }
        }
    }
}

/// First line a client writes on its control stream.
///
/// `LEASE` alone asks for an auto-generated name; `LEASE app api` asks for
/// `app.<root>` then `api.<root>`, in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseRequest {
    pub candidates: Vec<String>,
}

impl LeaseRequest {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_candidates<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn encode(&self) -> String {
        if self.candidates.is_empty() {
            "LEASE\n".to_string()
        } else {
            format!("LEASE {}\n", self.candidates.join(" "))
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut words = line.split_whitespace();
        match words.next() {
            None => Err(ProtoError::Empty),
            Some("LEASE") => Ok(Self {
                candidates: words.map(str::to_string).collect(),
            }),
            Some(other) => Err(ProtoError::UnknownVerb(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            ControlLine::Host("app.example.com".to_string()).encode(),
            "HOST app.example.com\n"
        );
        assert_eq!(ControlLine::Ping.encode(), "PING\n");

        let err = ControlLine::Err {
            reason: crate::NO_AVAILABLE_SUBDOMAIN.to_string(),
            candidates: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.encode(),
            "ERR none of your requested subdomains are currently available: [a b]\n"
        );
    }

    #[test]
    fn test_parse_server_lines() {
        assert_eq!(ControlLine::parse("PING\n").unwrap(), ControlLine::Ping);
        assert_eq!(
            ControlLine::parse("HOST 0.example.com\r\n").unwrap(),
            ControlLine::Host("0.example.com".to_string())
        );
        assert_eq!(
            ControlLine::parse("ERR taken: [a]").unwrap(),
            ControlLine::Err {
                reason: "taken".to_string(),
                candidates: vec!["a".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(ControlLine::parse(""), Err(ProtoError::Empty));
        assert!(matches!(
            ControlLine::parse("HELLO"),
            Err(ProtoError::UnknownVerb(_))
        ));
        assert!(matches!(
            ControlLine::parse("HOST"),
            Err(ProtoError::Malformed { verb: "HOST", .. })
        ));
        assert!(matches!(
            ControlLine::parse("ERR no list here"),
            Err(ProtoError::Malformed { verb: "ERR", .. })
        ));
    }

    #[test]
    fn test_lease_request() {
        assert_eq!(LeaseRequest::parse("LEASE\n").unwrap(), LeaseRequest::anonymous());
        assert_eq!(
            LeaseRequest::parse("LEASE app  api\n").unwrap().candidates,
            vec!["app", "api"]
        );
        assert_eq!(LeaseRequest::with_candidates(["x", "y"]).encode(), "LEASE x y\n");
        assert_eq!(LeaseRequest::anonymous().encode(), "LEASE\n");
        assert!(LeaseRequest::parse("GET / HTTP/1.1").is_err());
        assert_eq!(LeaseRequest::parse("   "), Err(ProtoError::Empty));
    }
}
