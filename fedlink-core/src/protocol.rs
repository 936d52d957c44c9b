//! Federation wire protocol: headers, message type, peer endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default federation port of the reference deployment.
pub const DEFAULT_PORT: u16 = 9131;

/// Line terminator. One logical message per line.
pub const LINE_DELIMITER: u8 = b'\n';

/// Separates the header from the payload inside a line.
pub const HEADER_DELIMITER: char = ':';

/// Client identity announcement; payload is the local uuid.
pub const HEADER_IAM: &str = "IAM";
/// Server challenge (ciphertext) and client response (plaintext).
pub const HEADER_CHALLENGE: &str = "CHALLENGE";
/// Final authentication verdict.
pub const HEADER_AUTH: &str = "AUTH";
/// `AUTH` payload granting the session.
pub const AUTH_ACCEPTED: &str = "ACCEPTED";

/// One line of the protocol: the token before the first `:` and the rest of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: String,
    pub payload: String,
}

impl Message {
    pub fn new(header: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            payload: payload.into(),
        }
    }

    pub fn is(&self, header: &str) -> bool {
        self.header == header
    }
}

/// Remote federation member. `server_name` overrides the TLS name checked against its certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub server_name: Option<String>,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            server_name: None,
        }
    }

    /// Name the peer certificate must be valid for.
    pub fn tls_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
