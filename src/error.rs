//! Peerlink error types.
//!
//! # Error Classification
//!
//! - **Terminal for the attempt**: `InvalidModeList`, `NoCommonMode`,
//!   `AuthenticationFailure`. Never retried with the same ephemeral material;
//!   a fresh handshake may be started.
//! - **Recoverable by restart**: `HandshakeTimeout` (new session id).
//! - **Transient**: `StateConflict`, `BackingStoreUnavailable`. Retried locally
//!   up to the configured budget, then surfaced so the upstream at-least-once
//!   delivery redelivers the triggering event. See [`LinkError::is_transient`].
//! - **Dropped**: `MalformedMessage` and out-of-sequence messages never mutate
//!   state.
//!
//! The `Crypto` variant preserves the full error chain via `#[source]`.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::protocol::ProtocolState;
use crate::store::StoreError;

/// Peerlink errors.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Hello constructed with an empty supported-mode list.
    #[error("Invalid mode list: {0}")]
    InvalidModeList(String),

    /// No overlap between the peers' supported modes.
    #[error("No common mode: {0}")]
    NoCommonMode(String),

    /// AEAD tag, transcript binding or identity proof did not verify.
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// No peer response within the handshake timeout.
    #[error("Handshake timed out for session {0}")]
    HandshakeTimeout(String),

    /// Optimistic write lost the race after the bounded retry budget.
    #[error("State conflict on {key} after {attempts} attempts")]
    StateConflict {
        /// Record key that kept conflicting.
        key: String,
        /// Number of read-modify-write attempts made.
        attempts: u32,
    },

    /// Transient failure of the backing state store.
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// Wire message could not be decoded or is internally inconsistent.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Identity not known to the membership directory (or not hosted locally).
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// State change the handshake state machine does not allow.
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// State the record was in.
        from: ProtocolState,
        /// State the change asked for.
        to: ProtocolState,
    },

    /// Operation requires an established session.
    #[error("Session not established: {0}")]
    SessionNotEstablished(String),

    /// Transport collaborator rejected an outbound envelope.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for peerlink operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Whether redelivering the triggering event may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::StateConflict { .. } | LinkError::BackingStoreUnavailable(_)
        )
    }
}

impl From<CryptoError> for LinkError {
    fn from(err: CryptoError) -> Self {
        LinkError::Crypto(err)
    }
}

impl From<StoreError> for LinkError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => LinkError::BackingStoreUnavailable(msg),
            StoreError::Serialization(msg) => {
                LinkError::MalformedMessage(format!("stored record: {msg}"))
            },
        }
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for LinkError {
    fn from(err: base64::DecodeError) -> Self {
        LinkError::MalformedMessage(format!("Base64 decode error: {err}"))
    }
}
