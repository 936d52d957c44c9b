//! Federation control-channel client: TLS transport, authenticated sessions, peer supervision.

pub mod config;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod trust;

pub use config::{Config, ConfigError, PeerConfig};
pub use session::{Session, SessionError, SessionOptions};
pub use transport::{CloseReason, Connection, ConnectionState, TransportError, TransportEvent};
pub use trust::{TrustError, TrustMaterial};
