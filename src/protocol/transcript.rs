//! Handshake transcript.
//!
//! Both sides fold the same canonical bytes into a SHA-256 hash. The hash after
//! the two hellos salts the key schedule; each identity proof signs the hash of
//! everything its sender has seen up to that point.

use sha2::{Digest, Sha256};

use super::message::{CommonHeader, InitiatorHello, ResponderHello};

/// Canonical transcript of one handshake attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    bytes: Vec<u8>,
}

impl Transcript {
    /// Transcript covering both hellos
    pub fn from_hellos(hello: &InitiatorHello, responder_hello: &ResponderHello) -> Self {
        let mut transcript = Self { bytes: Vec::new() };

        transcript.append(&hello.header().to_bytes());
        transcript.append(hello.ephemeral_public_key().as_bytes());
        let modes: Vec<u8> = hello.supported_modes().iter().map(|m| m.wire_id()).collect();
        transcript.append(&modes);

        transcript.append(&responder_hello.header.to_bytes());
        transcript.append(responder_hello.ephemeral_public_key.as_bytes());
        transcript.append(&[responder_hello.selected_mode.wire_id()]);

        transcript
    }

    /// Extend with a later message header (the initiator's Handshake for the
    /// responder's proof)
    pub fn with_header(&self, header: &CommonHeader) -> Self {
        let mut extended = self.clone();
        extended.append(&header.to_bytes());
        extended
    }

    /// SHA-256 over the transcript
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.bytes).into()
    }

    // Length-prefixed so field boundaries cannot shift
    fn append(&mut self, field: &[u8]) {
        self.bytes
            .extend_from_slice(&(field.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(field);
    }
}
