//! Peerlink handshake protocol.
//!
//! Mutually authenticated key agreement between two participants, followed by
//! protected data records under the negotiated mode.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                                   Responder
//!    |                                            |
//!    |--- INITIATOR_HELLO (eph_i, modes) -------->|  seq 0
//!    |                                            |
//!    |<-- RESPONDER_HELLO (eph_r, mode) ----------|  seq 1
//!    |                                            |
//!    |--- INITIATOR_HANDSHAKE {proof_i} --------->|  seq 2
//!    |                                            |
//!    |<-- RESPONDER_HANDSHAKE {proof_r} ----------|  seq 3
//!    |                                            |
//!    |=== DATA (seq 4, 5, ...) ==================>|
//!    |<== DATA (seq 4, 5, ...) ===================|
//! ```
//!
//! Each Handshake message is AEAD-sealed under a key derived from the
//! ephemeral exchange with the header as associated data. Its payload carries
//! the transcript hash, the sender's identity and an Ed25519 signature over the
//! transcript.
//!
//! ## State Machine
//!
//! | State                   | Description                       | Valid Transitions                   |
//! |-------------------------|-----------------------------------|-------------------------------------|
//! | `INIT`                  | Attempt allocated                 | → SENT_HELLO, WAITING_FOR_HANDSHAKE |
//! | `SENT_HELLO`            | Initiator waiting for its peer    | → WAITING_FOR_HANDSHAKE, EXPIRED    |
//! | `WAITING_FOR_HANDSHAKE` | Hellos exchanged                  | → ESTABLISHED, EXPIRED              |
//! | `ESTABLISHED`           | Traffic keys derived              | (superseded by flag only)           |
//! | `FAILED` / `EXPIRED`    | Attempt abandoned                 | (terminal)                          |
//!
//! Every non-terminal state may also move to `FAILED`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use peerlink::protocol::{HandshakeEngine, ProtocolMode, SessionId, Transcript};
//!
//! let engine = HandshakeEngine::new();
//! let (hello, initiator_eph) = engine.build_hello(&SessionId::generate(), &[ProtocolMode::Aes256Gcm])?;
//! let (reply, responder_eph) = engine.process_hello(&hello, &[ProtocolMode::Aes256Gcm])?;
//! let transcript = Transcript::from_hellos(&hello, &reply);
//! let keys = engine.key_schedule(&initiator_eph, &reply.ephemeral_public_key, &transcript)?;
//! ```

mod engine;
mod message;
mod mode;
mod session;
mod state;
mod transcript;

pub use engine::{HandshakeEngine, IdentityProof, KeySchedule};
pub use message::{
    CommonHeader, DataMessage, HandshakeMessage, Identity, InitiatorHello, LinkEnvelope,
    LinkMessage, MessageType, ResponderHello, SessionId,
};
pub use mode::{common_modes, negotiate, ProtocolMode};
pub use session::Session;
pub use state::{ProtocolState, Role};
pub use transcript::Transcript;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Sequence number of the initiator's Hello
pub const INITIATOR_HELLO_SEQUENCE: u64 = 0;

/// Sequence number of the responder's Hello
pub const RESPONDER_HELLO_SEQUENCE: u64 = 1;

/// Sequence number of the initiator's Handshake
pub const INITIATOR_HANDSHAKE_SEQUENCE: u64 = 2;

/// Sequence number of the responder's Handshake
pub const RESPONDER_HANDSHAKE_SEQUENCE: u64 = 3;

/// First sequence number used by data records
pub const FIRST_DATA_SEQUENCE: u64 = 4;
