//! Per-peer supervisor: keep one authenticated session alive, reconnecting with backoff.

use std::time::Duration;

use fedlink_core::{LocalIdentity, PeerEndpoint};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionOptions};
use crate::trust::TrustMaterial;

/// Exponential reconnect delay, reset after every successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Run forever: connect, log application traffic until the session closes, wait, retry.
pub async fn run_peer(
    peer: PeerEndpoint,
    trust: TrustMaterial,
    identity: LocalIdentity,
    options: SessionOptions,
    mut backoff: Backoff,
) {
    loop {
        match Session::connect(&peer, &trust, identity, &options).await {
            Ok(session) => {
                backoff.reset();
                let msg_peer = peer.clone();
                session.on_message(move |msg| {
                    debug!(peer = %msg_peer, header = %msg.header, len = msg.payload.len(), "federation message");
                });
                let err_peer = peer.clone();
                session.on_error(move |err| {
                    warn!(peer = %err_peer, error = %err, "federation session error");
                });
                let reason = session.closed().await;
                info!(peer = %peer, ?reason, "federation session ended");
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "federation connect failed");
            }
        }
        let delay = backoff.next_delay();
        debug!(peer = %peer, ?delay, "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}
