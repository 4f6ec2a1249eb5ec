//! Control-channel handshake state machine.
//!
//! Before any application channel is usable, a connection runs the
//! bootstrap exchange on the reserved `"$control"` channel:
//!
//! ```text
//! Connecting ──connect issued──► AwaitingHandshakeReply ──replied──► Established
//!      │                                  │                              │
//!      └──────────────────────────► Closed ◄────────────────────────────┘
//! ```
//!
//! The initiator sends `"connect"` with a fresh correlation id; the
//! acceptor answers with the server configuration and only then are
//! channel joins honored. `Closed` is terminal and reachable from every
//! state.

use std::fmt;

/// Handshake progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Transport is up; no `connect` exchanged yet.
    Connecting,
    /// `connect` sent (initiator) or received (acceptor); reply pending.
    AwaitingHandshakeReply,
    /// Configuration exchanged; application channels are usable.
    Established,
    /// Terminal: transport closed or errored.
    Closed,
}

/// Events that drive [`HandshakeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// The `"connect"` control message was sent / received.
    ConnectIssued,
    /// The handshake reply was delivered.
    Replied,
    /// The transport closed or errored.
    TransportClosed,
}

/// An event arrived that the current state does not accept.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    state: HandshakeState,
    event: HandshakeEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handshake event {:?} is invalid in state {:?}",
            self.event, self.state
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl HandshakeState {
    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the event is not legal in the
    /// current state; the caller decides whether that is a protocol warning
    /// (peer misbehavior) or a bug.
    pub fn transition(self, event: HandshakeEvent) -> Result<Self, InvalidTransition> {
        use HandshakeEvent::*;
        use HandshakeState::*;
        match (self, event) {
            (_, TransportClosed) => Ok(Closed),
            (Connecting, ConnectIssued) => Ok(AwaitingHandshakeReply),
            (AwaitingHandshakeReply, Replied) => Ok(Established),
            (state, event) => Err(InvalidTransition { state, event }),
        }
    }

    /// Whether application channels are usable.
    #[must_use]
    pub fn is_established(self) -> bool {
        self == Self::Established
    }
}
