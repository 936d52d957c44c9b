//! TLS transport to a federation peer: connect, validate against pinned anchors, chunked reads, queued writes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fedlink_core::PeerEndpoint;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::trust::TrustMaterial;

const READ_BUF_SIZE: usize = 16 * 1024;
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Connection lifecycle. `Closed` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Connecting,
    SecureEstablished,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Who ended the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Remote,
    Error,
}

/// Notification from the connection, in arrival order.
/// `SecureEstablished` and `Closed` are each delivered exactly once.
#[derive(Debug)]
pub enum TransportEvent {
    SecureEstablished,
    Data(Vec<u8>),
    Error(TransportError),
    Closed(CloseReason),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot resolve {peer}: {source}")]
    Resolve {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot connect to {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid TLS server name {0:?}")]
    ServerName(String),
    #[error("tls handshake with {peer} failed: {source}")]
    Tls {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connection is {0:?}, not established")]
    NotEstablished(ConnectionState),
}

enum Command {
    Write(Vec<u8>),
    Shutdown,
}

/// Open a TLS connection to `peer`, validating its certificate against the pinned anchors.
///
/// On success the connection is `SecureEstablished` and its first event is `SecureEstablished`.
pub async fn open(peer: &PeerEndpoint, trust: &TrustMaterial) -> Result<Connection, TransportError> {
    let lifecycle = watch::channel(ConnectionState::Unopened).0;
    lifecycle.send_replace(ConnectionState::Connecting);

    let server_name = ServerName::try_from(peer.tls_name().to_owned())
        .map_err(|_| TransportError::ServerName(peer.tls_name().to_owned()))?;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((peer.host.as_str(), peer.port))
        .await
        .map_err(|source| TransportError::Resolve {
            peer: peer.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve {
            peer: peer.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }
    debug!(peer = %peer, ?addrs, "connecting");

    let tcp = TcpStream::connect(&addrs[..])
        .await
        .map_err(|source| TransportError::Connect {
            peer: peer.to_string(),
            source,
        })?;
    tcp.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
        warn!(peer = %peer, error = %e, "cannot enable tcp keepalive");
    }

    let tls = TlsConnector::from(trust.tls_config())
        .connect(server_name, tcp)
        .await
        .map_err(|source| TransportError::Tls {
            peer: peer.to_string(),
            source,
        })?;
    info!(peer = %peer, "secure transport established");
    Ok(Connection::establish(peer.clone(), tls, lifecycle))
}

/// Live connection: the event stream plus a handle for writes and close.
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Take over an already secured stream and start its reader and writer tasks.
    pub(crate) fn establish<S>(
        peer: PeerEndpoint,
        stream: S,
        lifecycle: watch::Sender<ConnectionState>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        lifecycle.send_replace(ConnectionState::SecureEstablished);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            peer: Arc::new(peer),
            commands: command_tx,
            events: event_tx,
            lifecycle: Arc::new(lifecycle),
        };
        let _ = handle.events.send(TransportEvent::SecureEstablished);

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(read_loop(reader, handle.clone()));
        tokio::spawn(write_loop(writer, command_rx, handle.clone()));
        Self {
            handle,
            events: event_rx,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.handle.write(bytes)
    }

    pub fn close(&self) {
        self.handle.close()
    }

    /// Next notification. `None` only after every handle is gone.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.handle, self.events)
    }
}

/// Write/close side of a connection. Cloneable; all clones drive the same socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    peer: Arc<PeerEndpoint>,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    lifecycle: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn peer(&self) -> &PeerEndpoint {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.lifecycle.borrow()
    }

    /// Queue bytes for transmission. Delivery is asynchronous.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::SecureEstablished {
            return Err(TransportError::NotEstablished(state));
        }
        self.commands
            .send(Command::Write(bytes))
            .map_err(|_| TransportError::NotEstablished(ConnectionState::Closed))
    }

    /// Close locally. Idempotent; queued writes are flushed before the TLS close.
    pub fn close(&self) {
        self.finish(CloseReason::Local, None);
    }

    /// Close because of a protocol violation. Reported as `CloseReason::Error`.
    pub fn abort(&self) {
        self.finish(CloseReason::Error, None);
    }

    /// Move to a terminal state. Only the first call emits events.
    fn finish(&self, reason: CloseReason, error: Option<TransportError>) {
        let next = match reason {
            CloseReason::Error => ConnectionState::Errored,
            CloseReason::Local | CloseReason::Remote => ConnectionState::Closed,
        };
        let first = self.lifecycle.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
        if !first {
            return;
        }
        debug!(peer = %self.peer, ?reason, "connection closed");
        if let Some(err) = error {
            let _ = self.events.send(TransportEvent::Error(err));
        }
        let _ = self.events.send(TransportEvent::Closed(reason));
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn read_loop<R>(mut reader: R, handle: ConnectionHandle)
where
    R: AsyncRead + Unpin,
{
    let mut lifecycle = handle.lifecycle.subscribe();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            changed = lifecycle.changed() => {
                let terminal = lifecycle.borrow_and_update().is_terminal();
                if changed.is_err() || terminal {
                    break;
                }
            }
            _ = handle.events.closed() => {
                handle.close();
                break;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    handle.finish(CloseReason::Remote, None);
                    break;
                }
                Ok(n) => {
                    let _ = handle.events.send(TransportEvent::Data(buf[..n].to_vec()));
                }
                // Peer dropped the socket without a TLS close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    handle.finish(CloseReason::Remote, None);
                    break;
                }
                Err(e) => {
                    handle.finish(CloseReason::Error, Some(TransportError::Io(e)));
                    break;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<Command>,
    handle: ConnectionHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write(bytes) => {
                let result = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = result {
                    handle.finish(CloseReason::Error, Some(TransportError::Io(e)));
                    break;
                }
            }
            Command::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}
