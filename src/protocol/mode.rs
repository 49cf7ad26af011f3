//! Protocol modes offered in the Hello and negotiated by the responder.
//!
//! Priority is the declaration order: the first common mode wins regardless of
//! the order either peer listed them in, so both sides agree deterministically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::AeadAlgorithm;

/// Negotiable protection mode for data records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolMode {
    /// Encrypt and authenticate with ChaCha20-Poly1305
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// Encrypt and authenticate with AES-256-GCM
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
    /// Payload travels in clear; ChaCha20-Poly1305 tag over header and payload
    #[serde(rename = "authentication-only")]
    AuthenticationOnly,
}

impl ProtocolMode {
    /// Every mode, highest priority first
    pub const ALL: [ProtocolMode; 3] = [
        ProtocolMode::ChaCha20Poly1305,
        ProtocolMode::Aes256Gcm,
        ProtocolMode::AuthenticationOnly,
    ];

    /// Wire/config name
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::Aes256Gcm => "aes256-gcm",
            Self::AuthenticationOnly => "authentication-only",
        }
    }

    /// Stable single-byte id used in the transcript encoding
    pub fn wire_id(&self) -> u8 {
        match self {
            Self::ChaCha20Poly1305 => 1,
            Self::Aes256Gcm => 2,
            Self::AuthenticationOnly => 3,
        }
    }

    /// AEAD construction backing this mode
    pub fn aead(&self) -> AeadAlgorithm {
        match self {
            Self::Aes256Gcm => AeadAlgorithm::Aes256Gcm,
            Self::ChaCha20Poly1305 | Self::AuthenticationOnly => AeadAlgorithm::ChaCha20Poly1305,
        }
    }

    /// Whether application payloads are confidential under this mode
    pub fn encrypts_payload(&self) -> bool {
        !matches!(self, Self::AuthenticationOnly)
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chacha20-poly1305" | "chacha" | "chacha20" => Ok(Self::ChaCha20Poly1305),
            "aes256-gcm" | "aes" | "aes-gcm" => Ok(Self::Aes256Gcm),
            "authentication-only" | "auth-only" | "mac" => Ok(Self::AuthenticationOnly),
            _ => Err(format!("Unknown protocol mode: {}", s)),
        }
    }
}

/// Modes supported by both peers, highest priority first, without duplicates
pub fn common_modes(own: &[ProtocolMode], peer: &[ProtocolMode]) -> Vec<ProtocolMode> {
    ProtocolMode::ALL
        .into_iter()
        .filter(|mode| own.contains(mode) && peer.contains(mode))
        .collect()
}

/// Highest-priority mode supported by both peers
pub fn negotiate(own: &[ProtocolMode], peer: &[ProtocolMode]) -> Option<ProtocolMode> {
    common_modes(own, peer).into_iter().next()
}
