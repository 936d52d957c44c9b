//! Trust material: pinned TLS anchors and the node private key, loaded once and shared read-only.

use std::path::Path;
use std::sync::Arc;

use fedlink_core::{ChallengeResponder, KeyError};
use sha2::{Digest, Sha256};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use zeroize::Zeroizing;

/// Anchors and key shared by every session. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct TrustMaterial {
    tls: Arc<ClientConfig>,
    responder: Arc<ChallengeResponder>,
    fingerprints: Arc<Vec<String>>,
}

impl TrustMaterial {
    /// Build from in-memory PEM: one or more anchor certificates and the node private key.
    pub fn from_pem(anchor_pem: &[u8], key_pem: Zeroizing<Vec<u8>>) -> Result<Self, TrustError> {
        let mut roots = RootCertStore::empty();
        let mut fingerprints = Vec::new();
        for cert in rustls_pemfile::certs(&mut &anchor_pem[..]) {
            let cert = cert.map_err(TrustError::AnchorPem)?;
            fingerprints.push(hex::encode(Sha256::digest(cert.as_ref())));
            roots.add(cert).map_err(TrustError::Anchor)?;
        }
        if roots.is_empty() {
            return Err(TrustError::NoAnchors);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TrustError::Tls)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let responder = ChallengeResponder::from_pem(&key_pem)?;
        Ok(Self {
            tls: Arc::new(tls),
            responder: Arc::new(responder),
            fingerprints: Arc::new(fingerprints),
        })
    }

    /// Read anchors and key from disk.
    pub fn load(ca_path: &Path, key_path: &Path) -> Result<Self, TrustError> {
        let anchors = std::fs::read(ca_path).map_err(|source| TrustError::Read {
            path: ca_path.display().to_string(),
            source,
        })?;
        let key = Zeroizing::new(std::fs::read(key_path).map_err(|source| TrustError::Read {
            path: key_path.display().to_string(),
            source,
        })?);
        Self::from_pem(&anchors, key)
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls.clone()
    }

    pub fn responder(&self) -> Arc<ChallengeResponder> {
        self.responder.clone()
    }

    /// Hex SHA-256 of each pinned anchor (DER), for logs.
    pub fn anchor_fingerprints(&self) -> &[String] {
        &self.fingerprints
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid anchor PEM: {0}")]
    AnchorPem(#[source] std::io::Error),
    #[error("anchor rejected: {0}")]
    Anchor(#[source] rustls::Error),
    #[error("no trust anchor certificate found")]
    NoAnchors,
    #[error("tls configuration: {0}")]
    Tls(#[source] rustls::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
}
