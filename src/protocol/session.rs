//! Established session: directional traffic keys for data records.
//!
//! A `Session` lives only in memory and is never written to the state store.
//! Once the process that completed the handshake loses it, the only way back
//! to traffic keys is a fresh handshake.

use std::sync::atomic::{AtomicU64, Ordering};

use super::engine::KeySchedule;
use super::message::{CommonHeader, DataMessage, MessageType, SessionId};
use super::mode::ProtocolMode;
use super::state::Role;
use super::FIRST_DATA_SEQUENCE;
use crate::crypto::{AeadCipher, CryptoError, NONCE_SIZE};
use crate::error::{LinkError, Result};

/// Authenticated data channel for one session id
pub struct Session {
    id: SessionId,
    role: Role,
    mode: ProtocolMode,
    outbound: AeadCipher,
    inbound: AeadCipher,
    next_sequence: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Session {
    /// Bind the traffic keys of `keys` for the local `role`
    pub fn new(id: SessionId, role: Role, mode: ProtocolMode, keys: &KeySchedule) -> Result<Self> {
        let outbound = AeadCipher::new(mode.aead(), keys.traffic_key(role).clone())
            .map_err(CryptoError::from)?;
        let inbound = AeadCipher::new(mode.aead(), keys.traffic_key(role.peer()).clone())
            .map_err(CryptoError::from)?;

        Ok(Self {
            id,
            role,
            mode,
            outbound,
            inbound,
            next_sequence: AtomicU64::new(FIRST_DATA_SEQUENCE),
            messages_sent: 0.into(),
            messages_received: 0.into(),
        })
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Local role in the handshake that produced this session
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiated mode
    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// Data records sealed so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Data records opened so far
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Protect an application payload under the outbound traffic key
    pub fn seal(&self, payload: &[u8]) -> Result<DataMessage> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let header = CommonHeader::new(self.id.clone(), MessageType::Data, sequence);
        let header_bytes = header.to_bytes();

        let (encrypted_payload, authentication_tag) = if self.mode.encrypts_payload() {
            let sealed = self
                .outbound
                .seal(payload, &header_bytes)
                .map_err(CryptoError::from)?;
            (sealed.body, sealed.tag)
        } else {
            // Tag covers header ∥ payload; the payload travels after the nonce
            let sealed = self
                .outbound
                .seal(&[], &authenticated_data(&header_bytes, payload))
                .map_err(CryptoError::from)?;
            let mut body = sealed.body;
            body.extend_from_slice(payload);
            (body, sealed.tag)
        };

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(DataMessage {
            header,
            encrypted_payload,
            authentication_tag,
        })
    }

    /// Authenticate (and decrypt) a data record from the peer
    pub fn open(&self, message: &DataMessage) -> Result<Vec<u8>> {
        if message.header.session_id != self.id {
            return Err(LinkError::MalformedMessage(format!(
                "record for session {} opened with session {}",
                message.header.session_id, self.id
            )));
        }
        if message.header.sequence_number < FIRST_DATA_SEQUENCE {
            return Err(LinkError::MalformedMessage(format!(
                "data record with handshake sequence number {}",
                message.header.sequence_number
            )));
        }

        let header_bytes = message.header.to_bytes();
        let payload = if self.mode.encrypts_payload() {
            self.inbound
                .open(
                    &message.encrypted_payload,
                    &message.authentication_tag,
                    &header_bytes,
                )
                .map_err(|e| LinkError::AuthenticationFailure(format!("data record: {e}")))?
        } else {
            if message.encrypted_payload.len() < NONCE_SIZE {
                return Err(LinkError::MalformedMessage("data record too short".to_string()));
            }
            let (nonce, clear) = message.encrypted_payload.split_at(NONCE_SIZE);
            self.inbound
                .open(
                    nonce,
                    &message.authentication_tag,
                    &authenticated_data(&header_bytes, clear),
                )
                .map_err(|e| LinkError::AuthenticationFailure(format!("data record: {e}")))?;
            clear.to_vec()
        };

        self.messages_received.fetch_add(1, Ordering::Relaxed);
        Ok(payload)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn authenticated_data(header: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + payload.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(payload);
    aad
}
