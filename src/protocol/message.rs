//! Wire messages for peerlink.
//!
//! Defines the common header, the four handshake messages, data records and
//! the envelope that carries them between participants.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::mode::ProtocolMode;
use super::{
    FIRST_DATA_SEQUENCE, INITIATOR_HANDSHAKE_SEQUENCE, INITIATOR_HELLO_SEQUENCE, PROTOCOL_VERSION,
    RESPONDER_HANDSHAKE_SEQUENCE, RESPONDER_HELLO_SEQUENCE,
};
use crate::crypto::PublicKey;
use crate::error::{LinkError, Result};

/// Identifier of one handshake attempt (UUID v4, never reused)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network identity of a participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create a new identity
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Message types in the peerlink protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Initiator → responder: ephemeral key and supported modes
    InitiatorHello,
    /// Responder → initiator: ephemeral key and selected mode
    ResponderHello,
    /// Initiator → responder: encrypted identity proof
    InitiatorHandshake,
    /// Responder → initiator: encrypted identity proof
    ResponderHandshake,
    /// Encrypted application payload
    Data,
}

impl MessageType {
    /// Sequence number a handshake step must carry (`None` for data)
    pub fn handshake_sequence(&self) -> Option<u64> {
        match self {
            Self::InitiatorHello => Some(INITIATOR_HELLO_SEQUENCE),
            Self::ResponderHello => Some(RESPONDER_HELLO_SEQUENCE),
            Self::InitiatorHandshake => Some(INITIATOR_HANDSHAKE_SEQUENCE),
            Self::ResponderHandshake => Some(RESPONDER_HANDSHAKE_SEQUENCE),
            Self::Data => None,
        }
    }

    fn wire_id(&self) -> u8 {
        match self {
            Self::InitiatorHello => 1,
            Self::ResponderHello => 2,
            Self::InitiatorHandshake => 3,
            Self::ResponderHandshake => 4,
            Self::Data => 5,
        }
    }
}

/// Header present in every wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonHeader {
    /// Protocol version
    pub protocol_version: u8,
    /// Handshake attempt this message belongs to
    pub session_id: SessionId,
    /// Message type (must match the enclosing variant)
    pub message_type: MessageType,
    /// Step or record sequence number
    pub sequence_number: u64,
}

impl CommonHeader {
    /// Create a header with an explicit sequence number
    pub fn new(session_id: SessionId, message_type: MessageType, sequence_number: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            message_type,
            sequence_number,
        }
    }

    /// Create the header for a handshake step
    pub fn for_step(session_id: SessionId, message_type: MessageType) -> Self {
        let sequence_number = message_type
            .handshake_sequence()
            .unwrap_or(FIRST_DATA_SEQUENCE);
        Self::new(session_id, message_type, sequence_number)
    }

    /// Canonical encoding used as AEAD associated data and in the transcript.
    ///
    /// `version:1 ∥ type:1 ∥ sequence:8 (BE) ∥ id_len:2 (BE) ∥ id`
    pub fn to_bytes(&self) -> Vec<u8> {
        let id = self.session_id.as_str().as_bytes();
        let mut out = Vec::with_capacity(12 + id.len());
        out.push(self.protocol_version);
        out.push(self.message_type.wire_id());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id);
        out
    }
}

/// Hello message: `CommonHeader ∥ ephemeralPublicKey ∥ supportedModes[]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InitiatorHelloWire")]
pub struct InitiatorHello {
    header: CommonHeader,
    ephemeral_public_key: PublicKey,
    supported_modes: Vec<ProtocolMode>,
}

#[derive(Deserialize)]
struct InitiatorHelloWire {
    header: CommonHeader,
    ephemeral_public_key: PublicKey,
    supported_modes: Vec<ProtocolMode>,
}

impl TryFrom<InitiatorHelloWire> for InitiatorHello {
    type Error = LinkError;

    fn try_from(wire: InitiatorHelloWire) -> Result<Self> {
        Self::new(wire.header, wire.ephemeral_public_key, wire.supported_modes)
    }
}

impl InitiatorHello {
    /// Create a Hello; an empty mode list is rejected with `InvalidModeList`
    pub fn new(
        header: CommonHeader,
        ephemeral_public_key: PublicKey,
        supported_modes: Vec<ProtocolMode>,
    ) -> Result<Self> {
        if supported_modes.is_empty() {
            return Err(LinkError::InvalidModeList(
                "Hello requires at least one supported mode".to_string(),
            ));
        }
        Ok(Self {
            header,
            ephemeral_public_key,
            supported_modes,
        })
    }

    /// Message header
    pub fn header(&self) -> &CommonHeader {
        &self.header
    }

    /// Initiator's ephemeral public key
    pub fn ephemeral_public_key(&self) -> &PublicKey {
        &self.ephemeral_public_key
    }

    /// Modes the initiator supports (never empty)
    pub fn supported_modes(&self) -> &[ProtocolMode] {
        &self.supported_modes
    }
}

/// ResponderHello message: `CommonHeader ∥ ephemeralPublicKey ∥ selectedMode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderHello {
    /// Message header
    pub header: CommonHeader,
    /// Responder's ephemeral public key
    pub ephemeral_public_key: PublicKey,
    /// Mode chosen from the initiator's list
    pub selected_mode: ProtocolMode,
}

/// Handshake message: `CommonHeader ∥ encryptedPayload ∥ authenticationTag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Message header (bound as associated data)
    pub header: CommonHeader,
    /// Nonce and ciphertext of the identity proof
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    /// AEAD tag over header and payload
    #[serde(with = "base64_bytes")]
    pub authentication_tag: Vec<u8>,
}

/// Data record: `CommonHeader ∥ encryptedPayload ∥ authenticationTag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Message header (bound as associated data)
    pub header: CommonHeader,
    /// Nonce and (possibly encrypted) application payload
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    /// AEAD tag over header and payload
    #[serde(with = "base64_bytes")]
    pub authentication_tag: Vec<u8>,
}

/// Every message that can travel over a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkMessage {
    /// Initiator's Hello
    InitiatorHello(InitiatorHello),
    /// Responder's Hello
    ResponderHello(ResponderHello),
    /// Initiator's identity proof
    InitiatorHandshake(HandshakeMessage),
    /// Responder's identity proof
    ResponderHandshake(HandshakeMessage),
    /// Application data
    Data(DataMessage),
}

impl LinkMessage {
    /// Header of the enclosed message
    pub fn header(&self) -> &CommonHeader {
        match self {
            Self::InitiatorHello(m) => m.header(),
            Self::ResponderHello(m) => &m.header,
            Self::InitiatorHandshake(m) | Self::ResponderHandshake(m) => &m.header,
            Self::Data(m) => &m.header,
        }
    }

    /// Message type implied by the variant
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::InitiatorHello(_) => MessageType::InitiatorHello,
            Self::ResponderHello(_) => MessageType::ResponderHello,
            Self::InitiatorHandshake(_) => MessageType::InitiatorHandshake,
            Self::ResponderHandshake(_) => MessageType::ResponderHandshake,
            Self::Data(_) => MessageType::Data,
        }
    }

    /// Session the message belongs to
    pub fn session_id(&self) -> &SessionId {
        &self.header().session_id
    }

    /// Reject messages whose header disagrees with the variant or version
    pub fn validate(&self) -> Result<()> {
        let header = self.header();

        if header.protocol_version != PROTOCOL_VERSION {
            return Err(LinkError::MalformedMessage(format!(
                "unsupported protocol version {}",
                header.protocol_version
            )));
        }

        if header.message_type != self.message_type() {
            return Err(LinkError::MalformedMessage(format!(
                "header type {:?} does not match {:?}",
                header.message_type,
                self.message_type()
            )));
        }

        if header.session_id.as_str().is_empty() {
            return Err(LinkError::MalformedMessage("empty session id".to_string()));
        }

        Ok(())
    }
}

/// Addressed message as handed to and received from the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEnvelope {
    /// Sending identity
    pub source: Identity,
    /// Receiving identity
    pub destination: Identity,
    /// Enclosed message
    pub message: LinkMessage,
}

impl LinkEnvelope {
    /// Create an envelope
    pub fn new(source: Identity, destination: Identity, message: LinkMessage) -> Self {
        Self {
            source,
            destination,
            message,
        }
    }

    /// Encode for the transport
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate bytes received from the transport.
    ///
    /// Unknown variants, empty Hello mode lists and header/variant mismatches
    /// all surface as `MalformedMessage` or `InvalidModeList`.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| LinkError::MalformedMessage(e.to_string()))?;
        if carries_empty_mode_list(&value) {
            return Err(LinkError::InvalidModeList(
                "Hello carries no supported modes".to_string(),
            ));
        }

        let envelope: LinkEnvelope = serde_json::from_value(value)
            .map_err(|e| LinkError::MalformedMessage(e.to_string()))?;
        envelope.message.validate()?;
        Ok(envelope)
    }
}

/// An encoded Hello whose `supported_modes` is present but empty
fn carries_empty_mode_list(envelope: &serde_json::Value) -> bool {
    let message = &envelope["message"];
    message["type"] == "INITIATOR_HELLO"
        && message["body"]["supported_modes"]
            .as_array()
            .is_some_and(Vec::is_empty)
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
