//! Federation control-channel protocol.
//! Host-driven: no I/O; host passes transport events and receives actions.

pub mod core;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use crate::core::{Action, FailureReason, HandshakeMachine, HandshakeState};
pub use identity::{ChallengeResponder, CryptoError, KeyError, LocalIdentity};
pub use protocol::{Message, PeerEndpoint, DEFAULT_PORT};
pub use wire::{
    decode_line, encode_line, FrameEncodeError, FrameReader, FramingError, DEFAULT_MAX_LINE_LEN,
};
