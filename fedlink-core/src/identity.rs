//! Node identity and proof of key possession: federation uuid, RSA challenge responder.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Local node's federation identifier. Announced to the peer in the `IAM` message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LocalIdentity {
    uuid: Uuid,
}

impl LocalIdentity {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid.hyphenated())
    }
}

/// Decrypts peer-issued challenges with the node's private key.
///
/// The key is parsed once and held only in memory. `Debug` never prints it.
pub struct ChallengeResponder {
    key: RsaPrivateKey,
}

impl ChallengeResponder {
    /// Parse a PEM private key (PKCS#1 `RSA PRIVATE KEY` or PKCS#8 `PRIVATE KEY`).
    /// The PEM buffer is zeroized when dropped by the caller.
    pub fn from_pem(pem: &Zeroizing<Vec<u8>>) -> Result<Self, KeyError> {
        let text = std::str::from_utf8(pem.as_slice()).map_err(|_| KeyError::NotPem)?;
        let key = RsaPrivateKey::from_pkcs1_pem(text)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(text))
            .map_err(|_| KeyError::Unsupported)?;
        Ok(Self::from_key(key))
    }

    pub fn from_key(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Decrypt a challenge payload: base64 of an RSA-OAEP (SHA-1) block.
    /// The plaintext must be a single line of UTF-8 so it can be echoed back in one frame.
    pub fn respond(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let block = BASE64
            .decode(ciphertext.trim_end_matches('\r'))
            .map_err(|_| CryptoError::Encoding)?;
        let plain = self
            .key
            .decrypt(Oaep::new::<Sha1>(), &block)
            .map_err(|_| CryptoError::Decrypt)?;
        let plain = String::from_utf8(plain).map_err(|_| CryptoError::Plaintext)?;
        if plain.is_empty() || plain.contains(['\n', '\r']) {
            return Err(CryptoError::Plaintext);
        }
        Ok(plain)
    }
}

impl fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeResponder")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Error loading the node private key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("private key is not PEM text")]
    NotPem,
    #[error("private key is not an RSA key in PKCS#1 or PKCS#8 PEM form")]
    Unsupported,
}

/// Error answering a challenge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("challenge is not valid base64")]
    Encoding,
    #[error("challenge cannot be decrypted with the local key")]
    Decrypt,
    #[error("challenge plaintext is not a single line of text")]
    Plaintext,
}
