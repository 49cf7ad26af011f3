//! # Peerlink - Authenticated Peer-to-Peer Sessions
//!
//! Mutually authenticated, encrypted session establishment between identities
//! of a membership directory, coordinated across concurrent workers through an
//! optimistic-concurrency state store.
//!
//! ## Features
//!
//! - **Mode negotiation**: ChaCha20-Poly1305, AES-256-GCM or authentication-only
//! - **Four-message handshake**: ephemeral X25519 exchange, HKDF key schedule,
//!   Ed25519 identity proofs bound to the handshake transcript
//! - **Worker coordination**: compare-and-set records elect exactly one
//!   initiator per relationship; losers queue behind the winner's session
//! - **Outbound queue**: per-session FIFO with backpressure, cancellation and
//!   migration onto superseding sessions
//! - **Inbound dispatch**: sequence and state checks, replay-safe duplicates
//!
//! ## Protocol Overview
//!
//! ```text
//! Initiator                                                    Responder
//!    |                                                            |
//!    |------ INITIATOR_HELLO    (seq 0: eph key, modes) --------->|
//!    |<----- RESPONDER_HELLO    (seq 1: eph key, mode) -----------|
//!    |------ INITIATOR_HANDSHAKE (seq 2: sealed identity proof) ->|
//!    |<----- RESPONDER_HANDSHAKE (seq 3: sealed identity proof) --|
//!    |                                                            |
//!    |====== DATA (seq 4..) ====================================>|
//!    |<===== DATA (seq 4..) =====================================|
//! ```
//!
//! ### State Machine
//!
//! ```text
//!  Initiator:  INIT ──► SENT_HELLO ──► WAITING_FOR_HANDSHAKE ──► ESTABLISHED
//!  Responder:  INIT ─────────────────► WAITING_FOR_HANDSHAKE ──► ESTABLISHED
//!
//!  authentication / negotiation failure ──► FAILED
//!  handshake timeout                    ──► EXPIRED
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peerlink::{
//!     ChannelTransport, CollectingSink, InboundDispatcher, InMemoryDirectory,
//!     InMemoryStateStore, OutboundQueue, SessionConfig, SessionManager,
//! };
//!
//! let directory = Arc::new(InMemoryDirectory::new());
//! let (transport, mut wire) = ChannelTransport::new();
//! let manager = Arc::new(SessionManager::new(
//!     SessionConfig::default(),
//!     Arc::new(InMemoryStateStore::new()),
//!     Arc::new(OutboundQueue::default()),
//!     Arc::new(transport),
//!     directory.clone(),
//! ));
//!
//! let counterparties = manager.counterparties_for(&"alice".into(), &"bob".into())?;
//! let handle = manager.send(&counterparties, "trace-1", b"hello bob".to_vec())?;
//!
//! // Feed the peer's replies to a dispatcher until the handle completes
//! let dispatcher = InboundDispatcher::new(manager, Arc::new(CollectingSink::new()));
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Messages, modes, states, handshake engine and data sessions
//! - [`manager`]: Session manager driving handshakes over the state store
//! - [`store`]: Versioned state store and its optimistic read-modify-write
//! - [`queue`]: Outbound message queue and delivery handles
//! - [`dispatch`]: Inbound message routing
//! - [`membership`]: Identity directory
//! - [`transport`]: Outbound transport seam
//! - [`crypto`]: AEAD, key exchange, key derivation and identity signatures
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod membership;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, LoggingConfig, QueueConfig, SessionConfig};
pub use dispatch::{
    ApplicationSink, CollectingSink, DispatchOutcome, DropReason, InboundDispatcher,
    InboundPayload,
};
pub use error::{LinkError, Result};
pub use manager::{Counterparties, EstablishedSession, ExpirySummary, SessionManager};
pub use membership::{InMemoryDirectory, MemberInfo, MembershipDirectory, MembershipStatus};
pub use protocol::{
    HandshakeEngine, Identity, LinkEnvelope, LinkMessage, ProtocolMode, ProtocolState, Role,
    Session, SessionId,
};
pub use queue::{DeliveryFailure, DeliveryHandle, DeliveryReceipt, DeliveryResult, OutboundQueue};
pub use store::{InMemoryStateStore, SessionMetadata, SessionStateStore, StateRecord, StateStore};
pub use transport::{ChannelTransport, LinkTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
