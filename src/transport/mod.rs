//! Transport seam for peerlink.
//!
//! The physical transport is an external collaborator. The session manager
//! only hands it addressed envelopes; whatever receives them on the other side
//! feeds the wire bytes to an [`InboundDispatcher`](crate::dispatch::InboundDispatcher).
//!
//! ```text
//! ┌──────────────────┐   LinkEnvelope   ┌──────────────────┐
//! │  SessionManager  │ ───────────────► │  LinkTransport   │ ──► network / channel
//! └──────────────────┘                  └──────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{LinkError, Result};
use crate::protocol::LinkEnvelope;

/// Outbound transport collaborator
pub trait LinkTransport: Send + Sync {
    /// Emit one envelope
    fn send(&self, envelope: LinkEnvelope) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &'static str;
}

/// In-process transport that encodes envelopes and pushes the wire bytes
/// onto an unbounded channel
#[derive(Debug)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    failing: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                failing: AtomicBool::new(false),
            },
            receiver,
        )
    }

    /// Make subsequent sends fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl LinkTransport for ChannelTransport {
    fn send(&self, envelope: LinkEnvelope) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LinkError::Transport("link down".to_string()));
        }

        let bytes = envelope.to_wire()?;
        trace!(
            source = %envelope.source,
            destination = %envelope.destination,
            kind = ?envelope.message.message_type(),
            bytes = bytes.len(),
            "Emitting envelope"
        );
        self.sender
            .send(bytes)
            .map_err(|_| LinkError::Transport("receiver dropped".to_string()))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::protocol::{
        CommonHeader, Identity, InitiatorHello, LinkMessage, MessageType, ProtocolMode, SessionId,
    };

    fn envelope() -> LinkEnvelope {
        let hello = InitiatorHello::new(
            CommonHeader::for_step(SessionId::generate(), MessageType::InitiatorHello),
            *KeyPair::generate().public_key(),
            vec![ProtocolMode::ChaCha20Poly1305],
        )
        .unwrap();
        LinkEnvelope::new(
            Identity::new("alice"),
            Identity::new("bob"),
            LinkMessage::InitiatorHello(hello),
        )
    }

    #[test]
    fn test_channel_delivers_wire_bytes() {
        let (transport, mut receiver) = ChannelTransport::new();
        let sent = envelope();
        transport.send(sent.clone()).unwrap();

        let bytes = receiver.try_recv().unwrap();
        assert_eq!(LinkEnvelope::from_wire(&bytes).unwrap(), sent);
        assert_eq!(transport.name(), "channel");
    }

    #[test]
    fn test_failing_and_closed() {
        let (transport, receiver) = ChannelTransport::new();
        transport.set_failing(true);
        assert!(matches!(transport.send(envelope()), Err(LinkError::Transport(_))));

        transport.set_failing(false);
        drop(receiver);
        assert!(matches!(transport.send(envelope()), Err(LinkError::Transport(_))));
    }
}
