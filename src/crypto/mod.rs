//! Cryptographic primitives for the peerlink handshake and data records.
//!
//! - **X25519 key exchange**: ephemeral Diffie-Hellman per handshake attempt
//! - **HKDF-SHA256 key schedule**: handshake and traffic keys from the shared secret
//! - **AEAD**: ChaCha20-Poly1305 (handshake, default data mode) and AES-256-GCM
//! - **Ed25519 identity proofs**: each side signs the handshake transcript
//!
//! # Key Schedule
//!
//! ```text
//! shared   = X25519(own_ephemeral, peer_ephemeral)
//! salt     = SHA-256(transcript after both hellos)
//!
//! HKDF(salt, shared)
//!     ├─ "peerlink/v1 initiator handshake" ─► initiator handshake key
//!     ├─ "peerlink/v1 responder handshake" ─► responder handshake key
//!     ├─ "peerlink/v1 initiator traffic"   ─► initiator → responder data key
//!     └─ "peerlink/v1 responder traffic"   ─► responder → initiator data key
//! ```
//!
//! # Sealed Layout
//!
//! ```text
//! body = nonce:12 ∥ ciphertext      tag = 16 bytes
//! ```
//!
//! The tag travels as its own wire field so the handshake layout stays
//! `header ∥ encryptedPayload ∥ authenticationTag`.

mod aead;
mod error;
mod exchange;
mod identity;
mod keys;

pub use aead::{AeadAlgorithm, AeadCipher, AeadError, Sealed};
pub use error::CryptoError;
pub use exchange::{KeyExchangeError, KeyPair, PublicKey};
pub use identity::{sign_transcript, verify_transcript, IdentityError};
pub use keys::{KeyError, KeyMaterial};

/// Nonce size for both AEAD algorithms (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for both AEAD algorithms (128 bits)
pub const AEAD_TAG_SIZE: usize = 16;

/// Symmetric key size (256 bits)
pub const KEY_SIZE: usize = 32;

/// Generate a fresh random 96-bit nonce from the system CSPRNG.
///
/// Random nonces keep every worker stateless: nothing has to be persisted
/// or coordinated to avoid reuse. The birthday bound of 2^48 messages is far
/// beyond the lifetime of a single session key.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    use rand::RngCore;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_nonce_uniqueness() {
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(
                nonces.insert(random_nonce()),
                "Random nonce collision detected (extremely unlikely)"
            );
        }
    }

    #[test]
    fn test_random_nonce_entropy() {
        let nonce = random_nonce();
        let non_zero_count = nonce.iter().filter(|&&b| b != 0).count();
        assert!(
            non_zero_count >= 3,
            "Random nonce should have reasonable entropy, got {} non-zero bytes",
            non_zero_count
        );
    }
}
