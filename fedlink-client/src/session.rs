//! Authenticated federation session: drives transport + handshake, then carries application messages.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fedlink_core::{
    encode_line, Action, FailureReason, FrameEncodeError, FramingError, HandshakeMachine,
    HandshakeState, LocalIdentity, Message, PeerEndpoint, DEFAULT_MAX_LINE_LEN,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::transport::{
    self, CloseReason, ConnectionHandle, ConnectionState, TransportError, TransportEvent,
};
use crate::trust::TrustMaterial;

/// Default deadline for reaching `Authenticated`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deadline covering connect, TLS, and the challenge exchange.
    pub handshake_timeout: Duration,
    pub max_line_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {reason}")]
    Handshake {
        reason: FailureReason,
        #[source]
        source: Option<TransportError>,
    },
    #[error("handshake timed out in state {state}")]
    Timeout { state: HandshakeState },
    #[error("session cannot send: connection is {connection:?}")]
    State { connection: ConnectionState },
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;
type ClosedObserver = Arc<dyn Fn(CloseReason) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// Events held while no observer of their kind is registered, per kind.
const MAX_BACKLOG: usize = 1024;

/// Observer registry. Messages and errors seen before any observer of their kind exists are
/// held in the backlogs.
#[derive(Default)]
struct Observers {
    message: Vec<MessageObserver>,
    closed: Vec<ClosedObserver>,
    error: Vec<ErrorObserver>,
    backlog: Vec<Message>,
    error_backlog: Vec<SessionError>,
    closed_with: Option<CloseReason>,
}

#[derive(Default)]
struct Dispatch {
    observers: Mutex<Observers>,
    /// Held while message and error observers run so backlog flushes and live deliveries
    /// never interleave.
    delivery: Mutex<()>,
}

impl Dispatch {
    fn lock(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn message(&self, msg: Message) {
        let _delivery = self.lock_delivery();
        let observers = {
            let mut o = self.lock();
            if o.message.is_empty() {
                if o.backlog.len() >= MAX_BACKLOG {
                    warn!(header = %msg.header, "message backlog full, dropping message");
                } else {
                    o.backlog.push(msg);
                }
                return;
            }
            o.message.clone()
        };
        for observer in observers {
            observer(&msg);
        }
    }

    fn error(&self, err: SessionError) {
        let _delivery = self.lock_delivery();
        let observers = {
            let mut o = self.lock();
            if o.error.is_empty() {
                if o.error_backlog.len() >= MAX_BACKLOG {
                    warn!(error = %err, "error backlog full, dropping error");
                } else {
                    debug!(error = %err, "no error observer registered yet");
                    o.error_backlog.push(err);
                }
                return;
            }
            o.error.clone()
        };
        for observer in observers {
            observer(&err);
        }
    }

    fn closed(&self, reason: CloseReason) {
        let observers = {
            let mut o = self.lock();
            o.closed_with = Some(reason);
            o.closed.clone()
        };
        for observer in observers {
            observer(reason);
        }
    }

    fn add_message_observer(&self, observer: MessageObserver) {
        let _delivery = self.lock_delivery();
        let backlog = {
            let mut o = self.lock();
            o.message.push(observer.clone());
            std::mem::take(&mut o.backlog)
        };
        for msg in &backlog {
            observer(msg);
        }
    }

    fn add_error_observer(&self, observer: ErrorObserver) {
        let _delivery = self.lock_delivery();
        let backlog = {
            let mut o = self.lock();
            o.error.push(observer.clone());
            std::mem::take(&mut o.error_backlog)
        };
        for err in &backlog {
            observer(err);
        }
    }

    fn add_closed_observer(&self, observer: ClosedObserver) {
        let already = {
            let mut o = self.lock();
            o.closed.push(observer.clone());
            o.closed_with
        };
        if let Some(reason) = already {
            observer(reason);
        }
    }
}

/// Deadline `timeout` from now, saturating far in the future instead of overflowing `Instant`.
fn handshake_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// An authenticated control channel to one peer.
///
/// Observers run on the session's driver task. They should not block, and a message
/// observer must not register further message observers.
/// Dropping the session closes its connection.
pub struct Session {
    connection: ConnectionHandle,
    dispatch: Arc<Dispatch>,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl Session {
    /// Connect to `peer` and complete the challenge handshake before `options.handshake_timeout`.
    ///
    /// Every failure closes the connection before returning.
    pub async fn connect(
        peer: &PeerEndpoint,
        trust: &TrustMaterial,
        identity: LocalIdentity,
        options: &SessionOptions,
    ) -> Result<Session, SessionError> {
        let deadline = handshake_deadline(options.handshake_timeout);
        let mut machine =
            HandshakeMachine::with_max_line_len(identity, trust.responder(), options.max_line_len);
        machine.on_open();

        let opened = timeout_at(deadline, transport::open(peer, trust)).await;
        let connection = match opened {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                machine.on_transport_error();
                return Err(SessionError::Handshake {
                    reason: FailureReason::TransportError,
                    source: Some(err),
                });
            }
            Err(_) => {
                return Err(SessionError::Timeout {
                    state: machine.state(),
                })
            }
        };

        let (handle, mut events) = connection.into_parts();
        let dispatch = Arc::new(Dispatch::default());
        let outcome = timeout_at(
            deadline,
            drive_handshake(&mut machine, &handle, &mut events, &dispatch),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                handle.close();
                warn!(peer = %peer, error = %err, "federation handshake failed");
                return Err(err);
            }
            Err(_) => {
                handle.close();
                warn!(peer = %peer, state = %machine.state(), "federation handshake timed out");
                return Err(SessionError::Timeout {
                    state: machine.state(),
                });
            }
        }
        info!(peer = %peer, "federation session authenticated");

        let (closed_tx, closed_rx) = watch::channel(None);
        tokio::spawn(run_session(
            machine,
            handle.clone(),
            events,
            dispatch.clone(),
            closed_tx,
        ));
        Ok(Session {
            connection: handle,
            dispatch,
            closed: closed_rx,
        })
    }

    pub fn peer(&self) -> &PeerEndpoint {
        self.connection.peer()
    }

    pub fn is_open(&self) -> bool {
        self.connection.state() == ConnectionState::SecureEstablished
    }

    /// Queue `header:payload` on the authenticated channel.
    pub fn send(&self, header: &str, payload: &str) -> Result<(), SessionError> {
        let state = self.connection.state();
        if state != ConnectionState::SecureEstablished {
            return Err(SessionError::State { connection: state });
        }
        let line = encode_line(header, payload)?;
        self.connection.write(line).map_err(|err| match err {
            TransportError::NotEstablished(connection) => SessionError::State { connection },
            other => SessionError::Transport(other),
        })
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Wait until the connection closes.
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.closed.clone();
        loop {
            let current = *closed.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if closed.changed().await.is_err() {
                return CloseReason::Error;
            }
        }
    }

    /// Register a message observer. Messages received so far without an observer are flushed to it.
    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.dispatch.add_message_observer(Arc::new(f));
    }

    /// Register a close observer. Fires immediately if the session already closed.
    pub fn on_closed<F>(&self, f: F)
    where
        F: Fn(CloseReason) + Send + Sync + 'static,
    {
        self.dispatch.add_closed_observer(Arc::new(f));
    }

    /// Register an error observer. Errors reported so far without an observer are flushed to it.
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.dispatch.add_error_observer(Arc::new(f));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.close();
    }
}

async fn drive_handshake(
    machine: &mut HandshakeMachine,
    connection: &ConnectionHandle,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    dispatch: &Dispatch,
) -> Result<(), SessionError> {
    let mut transport_error = None;
    loop {
        let actions = match events.recv().await {
            Some(TransportEvent::SecureEstablished) => machine.on_secure_established(),
            Some(TransportEvent::Data(chunk)) => machine.on_data(&chunk),
            Some(TransportEvent::Error(err)) => {
                transport_error = Some(err);
                machine.on_transport_error()
            }
            Some(TransportEvent::Closed(_)) | None => machine.on_closed(),
        };

        let mut authenticated = false;
        for action in actions {
            match action {
                Action::Write(bytes) => {
                    if let Err(err) = connection.write(bytes) {
                        debug!(error = %err, "handshake write dropped");
                    }
                }
                Action::Close if authenticated => connection.abort(),
                Action::Close => connection.close(),
                Action::Authenticated => authenticated = true,
                Action::Failed(reason) => {
                    return Err(SessionError::Handshake {
                        reason,
                        source: transport_error.take(),
                    })
                }
                Action::Deliver(msg) => dispatch.message(msg),
                Action::FramingError(err) => dispatch.error(err.into()),
            }
        }
        if authenticated {
            return Ok(());
        }
    }
}

async fn run_session(
    mut machine: HandshakeMachine,
    connection: ConnectionHandle,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatch: Arc<Dispatch>,
    closed: watch::Sender<Option<CloseReason>>,
) {
    let peer = connection.peer().clone();
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Data(chunk)) => {
                for action in machine.on_data(&chunk) {
                    match action {
                        Action::Deliver(msg) => dispatch.message(msg),
                        Action::FramingError(err) => dispatch.error(err.into()),
                        Action::Close => connection.abort(),
                        other => debug!(action = ?other, "ignoring post-authentication action"),
                    }
                }
            }
            Some(TransportEvent::Error(err)) => {
                warn!(peer = %peer, error = %err, "federation transport error");
                dispatch.error(err.into());
            }
            Some(TransportEvent::Closed(reason)) => break reason,
            Some(TransportEvent::SecureEstablished) => {}
            None => break CloseReason::Error,
        }
    };
    info!(peer = %peer, ?reason, "federation session closed");
    dispatch.closed(reason);
    closed.send_replace(Some(reason));
}
