//! Inbound dispatcher.
//!
//! Decodes wire bytes, routes each message variant to the session manager and
//! hands decrypted application payloads to the [`ApplicationSink`].
//!
//! Malformed and out-of-sequence input is dropped without touching state;
//! the reason is reported in [`DispatchOutcome::Dropped`] and logged.
//! Authentication and negotiation failures are returned as errors after the
//! manager has recorded them.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::{LinkError, Result};
use crate::manager::SessionManager;
use crate::protocol::{DataMessage, Identity, LinkEnvelope, LinkMessage, SessionId};

/// Why an inbound message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Undecodable or internally inconsistent
    Malformed,
    /// No session record with this id
    UnknownSession,
    /// Sequence number or state is not the expected next step
    OutOfSequence,
    /// Step already applied
    Duplicate,
    /// Sender or recipient unknown to the directory, or recipient not hosted here
    UnknownIdentity,
    /// Sender is not the peer of the addressed session
    UnexpectedSender,
    /// Data record failed authentication
    AuthenticationFailed,
}

impl DropReason {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::UnknownSession => "unknown_session",
            Self::OutOfSequence => "out_of_sequence",
            Self::Duplicate => "duplicate",
            Self::UnknownIdentity => "unknown_identity",
            Self::UnexpectedSender => "unexpected_sender",
            Self::AuthenticationFailed => "authentication_failed",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What handling an inbound message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Answered a Hello with a ResponderHello
    Responded,
    /// Initiator sent its Handshake after a ResponderHello
    Advanced,
    /// Session reached ESTABLISHED
    Established(SessionId),
    /// Data record opened and delivered to the application
    Delivered,
    /// Duplicate handshake message answered with the stored reply
    Replayed,
    /// Ignored without state change
    Dropped(DropReason),
}

/// Application payload received over an established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    /// Sending identity
    pub source: Identity,
    /// Receiving (local) identity
    pub destination: Identity,
    /// Session the record arrived on
    pub session_id: SessionId,
    /// Data record sequence number
    pub sequence_number: u64,
    /// Decrypted payload
    pub payload: Vec<u8>,
}

/// Receives decrypted application payloads
pub trait ApplicationSink: Send + Sync {
    /// Deliver one payload
    fn deliver(&self, payload: InboundPayload);
}

/// Sink that keeps every payload in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    received: Mutex<Vec<InboundPayload>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads received so far, in arrival order
    pub fn received(&self) -> Vec<InboundPayload> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of payloads received
    pub fn len(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if nothing was received
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ApplicationSink for CollectingSink {
    fn deliver(&self, payload: InboundPayload) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);
    }
}

/// Routes inbound envelopes to the session manager
pub struct InboundDispatcher {
    manager: Arc<SessionManager>,
    sink: Arc<dyn ApplicationSink>,
}

impl InboundDispatcher {
    /// Create a dispatcher
    pub fn new(manager: Arc<SessionManager>, sink: Arc<dyn ApplicationSink>) -> Self {
        Self { manager, sink }
    }

    /// Session manager this dispatcher feeds
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Decode and dispatch raw wire bytes
    pub fn dispatch_wire(&self, bytes: &[u8]) -> Result<DispatchOutcome> {
        match LinkEnvelope::from_wire(bytes) {
            Ok(envelope) => self.dispatch(envelope),
            Err(err @ (LinkError::MalformedMessage(_) | LinkError::InvalidModeList(_))) => {
                warn!(error = %err, "Dropping undecodable message");
                Ok(DispatchOutcome::Dropped(DropReason::Malformed))
            },
            Err(err) => Err(err),
        }
    }

    /// Dispatch a decoded envelope
    pub fn dispatch(&self, envelope: LinkEnvelope) -> Result<DispatchOutcome> {
        if let Err(err) = envelope.message.validate() {
            warn!(error = %err, "Dropping inconsistent message");
            return Ok(DispatchOutcome::Dropped(DropReason::Malformed));
        }

        let LinkEnvelope {
            source,
            destination,
            message,
        } = envelope;
        let session_id = message.session_id().clone();

        let outcome = match &message {
            LinkMessage::InitiatorHello(hello) => {
                self.manager.handle_hello(&source, &destination, hello)
            },
            LinkMessage::ResponderHello(reply) => {
                self.manager
                    .handle_responder_hello(&source, &destination, reply)
            },
            LinkMessage::InitiatorHandshake(handshake) => {
                self.manager
                    .handle_initiator_handshake(&source, &destination, handshake)
            },
            LinkMessage::ResponderHandshake(handshake) => {
                self.manager
                    .handle_responder_handshake(&source, &destination, handshake)
            },
            LinkMessage::Data(data) => self.deliver(&source, &destination, data),
        }?;

        match &outcome {
            DispatchOutcome::Dropped(reason) => warn!(
                session_id = %session_id,
                source = %source,
                kind = ?message.message_type(),
                %reason,
                "Dropped inbound message"
            ),
            other => debug!(session_id = %session_id, outcome = ?other, "Dispatched"),
        }

        Ok(outcome)
    }

    fn deliver(
        &self,
        source: &Identity,
        destination: &Identity,
        data: &DataMessage,
    ) -> Result<DispatchOutcome> {
        if !self.manager.hosts(destination) {
            return Ok(DispatchOutcome::Dropped(DropReason::UnknownIdentity));
        }

        let Some(established) = self.manager.established(&data.header.session_id)? else {
            return Ok(DispatchOutcome::Dropped(DropReason::UnknownSession));
        };
        if &established.counterparties.destination != source {
            return Ok(DispatchOutcome::Dropped(DropReason::UnexpectedSender));
        }

        let payload = match established.session.open(data) {
            Ok(payload) => payload,
            Err(LinkError::AuthenticationFailure(reason)) => {
                warn!(session_id = %data.header.session_id, %reason, "Data record failed authentication");
                return Ok(DispatchOutcome::Dropped(DropReason::AuthenticationFailed));
            },
            Err(LinkError::MalformedMessage(_)) => {
                return Ok(DispatchOutcome::Dropped(DropReason::Malformed));
            },
            Err(err) => return Err(err),
        };

        self.sink.deliver(InboundPayload {
            source: source.clone(),
            destination: destination.clone(),
            session_id: data.header.session_id.clone(),
            sequence_number: data.header.sequence_number,
            payload,
        });
        Ok(DispatchOutcome::Delivered)
    }
}

impl fmt::Debug for InboundDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        assert!(sink.is_empty());
        sink.deliver(InboundPayload {
            source: Identity::new("alice"),
            destination: Identity::new("bob"),
            session_id: SessionId::new("s"),
            sequence_number: 4,
            payload: b"hi".to_vec(),
        });
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.received()[0].payload, b"hi");
    }

    #[test]
    fn test_drop_reason_names() {
        assert_eq!(DropReason::OutOfSequence.to_string(), "out_of_sequence");
        assert_eq!(DropReason::Malformed.name(), "malformed");
    }
}
