//! X25519 ephemeral key exchange.
//!
//! Every handshake attempt generates a fresh key pair on each side; the
//! shared secret feeds the HKDF key schedule.

#![allow(missing_docs)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use super::keys::KeyMaterial;

/// Errors from key exchange operations
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    /// Invalid public key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Peer key produced a non-contributory (all-zero) shared secret
    #[error("Non-contributory key exchange")]
    NonContributory,
}

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from a slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, KeyExchangeError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| {
            KeyExchangeError::InvalidPublicKey(format!("Expected 32 bytes, got {}", slice.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey([{}...])", hex::encode(&self.0[..4]))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// X25519 key pair (private + public)
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);

        Self {
            secret,
            public: PublicKey::from_bytes(public.to_bytes()),
        }
    }

    /// Rebuild a key pair from a stored secret
    pub fn from_secret(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = X25519Public::from(&secret);

        Self {
            secret,
            public: PublicKey::from_bytes(public.to_bytes()),
        }
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Export the secret scalar for persistence in the session record
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, peer_public: &PublicKey) -> Result<KeyMaterial, KeyExchangeError> {
        let peer = X25519Public::from(*peer_public.as_bytes());
        let shared = self.secret.diffie_hellman(&peer);

        if !shared.was_contributory() {
            return Err(KeyExchangeError::NonContributory);
        }

        Ok(KeyMaterial::new(shared.as_bytes().to_vec()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diffie_hellman_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key()).unwrap();
        let bob_shared = bob.diffie_hellman(alice.public_key()).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = KeyPair::generate();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            alice.diffie_hellman(&zero),
            Err(KeyExchangeError::NonContributory)
        ));
    }

    #[test]
    fn test_public_key_from_slice() {
        let bytes = [0x42u8; 32];
        let pk = PublicKey::from_slice(&bytes).unwrap();
        assert_eq!(pk.as_bytes(), &bytes);

        assert!(PublicKey::from_slice(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_key_pair_from_secret() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret(*original.secret_bytes());

        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_key_serde() {
        let pk = *KeyPair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, parsed);

        assert!(serde_json::from_str::<PublicKey>("\"AAAA\"").is_err());
    }
}
