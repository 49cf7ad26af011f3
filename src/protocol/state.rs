//! Handshake state machine and protocol roles.

use serde::{Deserialize, Serialize};

/// Protocol state of one handshake attempt
///
/// ```text
/// Initiator:  INIT ──► SENT_HELLO ──► WAITING_FOR_HANDSHAKE ──► ESTABLISHED
/// Responder:  INIT ─────────────────► WAITING_FOR_HANDSHAKE ──► ESTABLISHED
///
/// any non-terminal ──► FAILED      (authentication / negotiation failure)
/// in flight        ──► EXPIRED     (handshake timeout)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolState {
    /// Attempt allocated, nothing sent yet
    Init,
    /// Initiator sent its Hello
    SentHello,
    /// Hellos exchanged, waiting for the peer's Handshake message
    WaitingForHandshake,
    /// Both identity proofs verified, traffic keys derived
    Established,
    /// Attempt aborted by a negotiation or authentication failure
    Failed,
    /// Attempt abandoned after the handshake timeout
    Expired,
}

impl ProtocolState {
    /// Wire/metadata name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::SentHello => "SENT_HELLO",
            Self::WaitingForHandshake => "WAITING_FOR_HANDSHAKE",
            Self::Established => "ESTABLISHED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Handshake messages are still expected
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::SentHello | Self::WaitingForHandshake)
    }

    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Expired)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: ProtocolState) -> bool {
        use ProtocolState::*;

        matches!(
            (self, next),
            (Init, SentHello | WaitingForHandshake | Failed)
                | (SentHello, WaitingForHandshake | Failed | Expired)
                | (WaitingForHandshake, Established | Failed | Expired)
        )
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Side of the handshake a record or session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Sent the Hello
    Initiator,
    /// Answered with the ResponderHello
    Responder,
}

impl Role {
    /// The other side
    pub fn peer(&self) -> Role {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// Domain-separation label for signatures and key derivation
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}
