//! Host-driven handshake: the host reports transport events, the machine returns actions.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::identity::{ChallengeResponder, LocalIdentity};
use crate::protocol::{Message, AUTH_ACCEPTED, HEADER_AUTH, HEADER_CHALLENGE, HEADER_IAM};
use crate::wire::{self, FrameReader, FramingError};

/// Why a handshake ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("rejected")]
    Rejected,
    #[error("challenge-decrypt-error")]
    ChallengeDecryptError,
    #[error("transport-error")]
    TransportError,
    #[error("closed")]
    Closed,
    #[error("line-too-long")]
    LineTooLong,
}

/// Handshake progress. `Authenticated` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingSecureTransport,
    AwaitingChallenge,
    AwaitingAuthResult,
    Authenticated,
    Failed(FailureReason),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Authenticated | HandshakeState::Failed(_))
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Idle => f.write_str("idle"),
            HandshakeState::AwaitingSecureTransport => f.write_str("awaiting-secure-transport"),
            HandshakeState::AwaitingChallenge => f.write_str("awaiting-challenge"),
            HandshakeState::AwaitingAuthResult => f.write_str("awaiting-auth-result"),
            HandshakeState::Authenticated => f.write_str("authenticated"),
            HandshakeState::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

/// Action for the host to execute, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue bytes on the connection.
    Write(Vec<u8>),
    /// Close the connection.
    Close,
    /// Handshake reached `Authenticated`.
    Authenticated,
    /// Handshake reached `Failed`. Always preceded by `Close` when this machine owns the close.
    Failed(FailureReason),
    /// Post-authentication message for the application.
    Deliver(Message),
    /// A line was dropped. Recoverable unless `is_fatal()`.
    FramingError(FramingError),
}

/// Drives one session's handshake. Owns the receive buffer and the state.
pub struct HandshakeMachine {
    identity: LocalIdentity,
    responder: Arc<ChallengeResponder>,
    reader: FrameReader,
    state: HandshakeState,
}

impl HandshakeMachine {
    pub fn new(identity: LocalIdentity, responder: Arc<ChallengeResponder>) -> Self {
        Self::with_max_line_len(identity, responder, wire::DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_line_len(
        identity: LocalIdentity,
        responder: Arc<ChallengeResponder>,
        max_line_len: usize,
    ) -> Self {
        Self {
            identity,
            responder,
            reader: FrameReader::with_max_line_len(max_line_len),
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Host started opening the transport.
    pub fn on_open(&mut self) {
        if self.state == HandshakeState::Idle {
            self.transition(HandshakeState::AwaitingSecureTransport);
        }
    }

    /// Transport finished its cryptographic handshake. Announces the local identity.
    pub fn on_secure_established(&mut self) -> Vec<Action> {
        if self.state != HandshakeState::AwaitingSecureTransport {
            debug!(state = %self.state, "ignoring secure-established notification");
            return Vec::new();
        }
        self.transition(HandshakeState::AwaitingChallenge);
        let iam = wire::encode_line(HEADER_IAM, &self.identity.to_string());
        match iam {
            Ok(bytes) => vec![Action::Write(bytes)],
            // A hyphenated uuid never contains a line break.
            Err(_) => self.fail(FailureReason::TransportError),
        }
    }

    /// Bytes received from the transport.
    pub fn on_data(&mut self, chunk: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, HandshakeState::Failed(_)) {
            return actions;
        }
        for frame in self.reader.feed(chunk) {
            match frame {
                Ok(msg) => self.on_message(msg, &mut actions),
                Err(err) if err.is_fatal() => {
                    warn!(error = %err, state = %self.state, "fatal framing error");
                    if self.state == HandshakeState::Authenticated {
                        actions.push(Action::Close);
                        actions.push(Action::FramingError(err));
                    } else {
                        actions.extend(self.fail(FailureReason::LineTooLong));
                    }
                }
                Err(err) => {
                    debug!(error = %err, "dropping malformed line");
                    if self.state == HandshakeState::Authenticated {
                        actions.push(Action::FramingError(err));
                    }
                }
            }
            if matches!(self.state, HandshakeState::Failed(_)) {
                break;
            }
        }
        actions
    }

    /// Transport reported an error. Fails the handshake unless already terminal.
    pub fn on_transport_error(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.fail(FailureReason::TransportError)
    }

    /// Transport closed. Fails the handshake unless already terminal.
    pub fn on_closed(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.transition(HandshakeState::Failed(FailureReason::Closed));
        vec![Action::Failed(FailureReason::Closed)]
    }

    fn on_message(&mut self, msg: Message, actions: &mut Vec<Action>) {
        match self.state {
            HandshakeState::AwaitingChallenge if msg.is(HEADER_CHALLENGE) => {
                if msg.payload.is_empty() {
                    debug!("ignoring empty challenge");
                    return;
                }
                match self.responder.respond(&msg.payload) {
                    Ok(plain) => match wire::encode_line(HEADER_CHALLENGE, &plain) {
                        Ok(bytes) => {
                            self.transition(HandshakeState::AwaitingAuthResult);
                            actions.push(Action::Write(bytes));
                        }
                        Err(_) => actions.extend(self.fail(FailureReason::ChallengeDecryptError)),
                    },
                    Err(err) => {
                        warn!(error = %err, "cannot answer challenge");
                        actions.extend(self.fail(FailureReason::ChallengeDecryptError));
                    }
                }
            }
            HandshakeState::AwaitingChallenge if msg.is(HEADER_AUTH) => {
                if msg.payload == AUTH_ACCEPTED {
                    warn!("ignoring acceptance before challenge was answered");
                } else {
                    actions.extend(self.fail(FailureReason::Rejected));
                }
            }
            HandshakeState::AwaitingAuthResult if msg.is(HEADER_AUTH) => {
                if msg.payload == AUTH_ACCEPTED {
                    self.transition(HandshakeState::Authenticated);
                    actions.push(Action::Authenticated);
                } else {
                    actions.extend(self.fail(FailureReason::Rejected));
                }
            }
            HandshakeState::Authenticated => actions.push(Action::Deliver(msg)),
            _ => debug!(header = %msg.header, state = %self.state, "ignoring message"),
        }
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<Action> {
        self.transition(HandshakeState::Failed(reason));
        vec![Action::Close, Action::Failed(reason)]
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = %self.state, to = %next, "handshake transition");
        self.state = next;
    }
}
