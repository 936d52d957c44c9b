//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fedlink_core::{LocalIdentity, PeerEndpoint, DEFAULT_MAX_LINE_LEN, DEFAULT_PORT};
use serde::Deserialize;
use uuid::Uuid;

use crate::session::SessionOptions;
use crate::trust::{TrustError, TrustMaterial};

/// Daemon configuration. File: $FEDLINK_CONFIG, ~/.config/fedlink/config.toml or /etc/fedlink/config.toml.
/// Env overrides: FEDLINK_UUID, FEDLINK_KEY_PATH, FEDLINK_CA_PATH, FEDLINK_HANDSHAKE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local federation uuid, announced in `IAM`. Required.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Node private key (PEM).
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Pinned trust anchor certificate(s) (PEM).
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// One federation peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS name to verify instead of `address`.
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/fedlink/keys/private.pem")
}
fn default_ca_path() -> PathBuf {
    PathBuf::from("/etc/fedlink/keys/public-cert.pem")
}
const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 86_400;

fn default_handshake_timeout_secs() -> u64 {
    30
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_max_reconnect_delay_secs() -> u64 {
    300
}
fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uuid: None,
            key_path: default_key_path(),
            ca_path: default_ca_path(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            max_line_len: default_max_line_len(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Apply environment overrides through `lookup` (`std::env::var` in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FEDLINK_UUID") {
            self.uuid = Some(Uuid::parse_str(v.trim()).map_err(|_| env_error("FEDLINK_UUID", &v))?);
        }
        if let Some(v) = lookup("FEDLINK_KEY_PATH") {
            self.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FEDLINK_CA_PATH") {
            self.ca_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FEDLINK_HANDSHAKE_TIMEOUT_SECS") {
            self.handshake_timeout_secs = v
                .trim()
                .parse()
                .map_err(|_| env_error("FEDLINK_HANDSHAKE_TIMEOUT_SECS", &v))?;
        }
        Ok(())
    }

    /// Check the values the daemon cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_secs must be positive"));
        }
        if self.handshake_timeout_secs > MAX_HANDSHAKE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid("handshake_timeout_secs must be at most one day"));
        }
        if self.max_line_len == 0 {
            return Err(ConfigError::Invalid("max_line_len must be positive"));
        }
        if self.peers.iter().any(|p| p.address.trim().is_empty()) {
            return Err(ConfigError::Invalid("peer address must not be empty"));
        }
        Ok(())
    }

    pub fn identity(&self) -> Result<LocalIdentity, ConfigError> {
        self.uuid.map(LocalIdentity::new).ok_or(ConfigError::MissingUuid)
    }

    pub fn peer_endpoints(&self) -> Vec<PeerEndpoint> {
        self.peers
            .iter()
            .map(|p| PeerEndpoint {
                host: p.address.clone(),
                port: p.port,
                server_name: p.server_name.clone(),
            })
            .collect()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_line_len: self.max_line_len,
        }
    }

    pub fn trust_material(&self) -> Result<TrustMaterial, TrustError> {
        TrustMaterial::load(&self.ca_path, &self.key_path)
    }
}

fn env_error(var: &'static str, value: &str) -> ConfigError {
    ConfigError::Env {
        var,
        value: value.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("federation uuid is not configured")]
    MissingUuid,
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Load config: explicit path or the first existing default file (else defaults), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => Config::load_from(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Config::load_from(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("FEDLINK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/fedlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/fedlink/config.toml"));
    out
}
