//! AEAD encryption for handshake payloads and data records.
//!
//! Provides authenticated encryption with associated data (AEAD).
//! The nonce is prepended to the ciphertext and the tag is split off so it can
//! be carried as a separate wire field.

#![allow(missing_docs)]

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use thiserror::Error;

use super::keys::KeyMaterial;
use super::{random_nonce, AEAD_TAG_SIZE, KEY_SIZE, NONCE_SIZE};

/// Errors from AEAD operations
#[derive(Debug, Error)]
pub enum AeadError {
    /// Invalid key
    #[error("Invalid AEAD key: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (auth tag mismatch or corrupted data)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Data too short
    #[error("Ciphertext too short")]
    DataTooShort,
}

/// Supported AEAD constructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    /// ChaCha20-Poly1305 (RFC 8439)
    ChaCha20Poly1305,
    /// AES-256 in Galois/Counter Mode
    Aes256Gcm,
}

/// Output of a seal operation: `nonce ∥ ciphertext` plus the detached tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Nonce followed by ciphertext
    pub body: Vec<u8>,
    /// Authentication tag
    pub tag: Vec<u8>,
}

/// AEAD cipher bound to one key
#[derive(Debug, Clone)]
pub struct AeadCipher {
    algorithm: AeadAlgorithm,
    key: KeyMaterial,
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given key
    pub fn new(algorithm: AeadAlgorithm, key: KeyMaterial) -> Result<Self, AeadError> {
        if key.len() < KEY_SIZE {
            return Err(AeadError::InvalidKey(format!(
                "Key too short: {} bytes (need {})",
                key.len(),
                KEY_SIZE
            )));
        }
        Ok(Self { algorithm, key })
    }

    /// Algorithm this cipher was built for
    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    /// Seal plaintext under a fresh random nonce
    pub fn seal(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed, AeadError> {
        self.seal_with_nonce(plaintext, &random_nonce(), associated_data)
    }

    /// Seal plaintext with an explicit nonce
    pub fn seal_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        associated_data: &[u8],
    ) -> Result<Sealed, AeadError> {
        let payload = Payload {
            msg: plaintext,
            aad: associated_data,
        };

        let mut ciphertext = match self.algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(self.key_bytes())
                .map_err(|e| AeadError::InvalidKey(e.to_string()))?
                .encrypt(Nonce::from_slice(nonce), payload),
            AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(self.key_bytes())
                .map_err(|e| AeadError::InvalidKey(e.to_string()))?
                .encrypt(Nonce::from_slice(nonce), payload),
        }
        .map_err(|e| AeadError::EncryptionFailed(e.to_string()))?;

        // Both constructions append the tag to the ciphertext
        let tag = ciphertext.split_off(ciphertext.len() - AEAD_TAG_SIZE);

        let mut body = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        body.extend_from_slice(nonce);
        body.extend_from_slice(&ciphertext);

        Ok(Sealed { body, tag })
    }

    /// Open a sealed body/tag pair
    pub fn open(&self, body: &[u8], tag: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, AeadError> {
        if body.len() < NONCE_SIZE || tag.len() != AEAD_TAG_SIZE {
            return Err(AeadError::DataTooShort);
        }

        let (nonce, ciphertext) = body.split_at(NONCE_SIZE);
        let mut joined = Vec::with_capacity(ciphertext.len() + AEAD_TAG_SIZE);
        joined.extend_from_slice(ciphertext);
        joined.extend_from_slice(tag);

        let payload = Payload {
            msg: &joined,
            aad: associated_data,
        };

        match self.algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(self.key_bytes())
                .map_err(|e| AeadError::InvalidKey(e.to_string()))?
                .decrypt(Nonce::from_slice(nonce), payload),
            AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(self.key_bytes())
                .map_err(|e| AeadError::InvalidKey(e.to_string()))?
                .decrypt(Nonce::from_slice(nonce), payload),
        }
        .map_err(|e| AeadError::DecryptionFailed(e.to_string()))
    }

    fn key_bytes(&self) -> &[u8] {
        &self.key.as_bytes()[..KEY_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> KeyMaterial {
        KeyMaterial::new(vec![0x42u8; 32])
    }

    fn test_nonce() -> [u8; NONCE_SIZE] {
        [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
    }

    #[test]
    fn test_aead_seal_open() {
        for algorithm in [AeadAlgorithm::ChaCha20Poly1305, AeadAlgorithm::Aes256Gcm] {
            let cipher = AeadCipher::new(algorithm, test_key()).unwrap();
            let plaintext = b"Hello, World!";
            let aad = b"associated data";

            let sealed = cipher.seal_with_nonce(plaintext, &test_nonce(), aad).unwrap();
            assert_eq!(sealed.body.len(), NONCE_SIZE + plaintext.len());
            assert_eq!(sealed.tag.len(), AEAD_TAG_SIZE);

            let opened = cipher.open(&sealed.body, &sealed.tag, aad).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_aead_tamper_detection() {
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, test_key()).unwrap();
        let aad = b"associated data";

        let mut sealed = cipher.seal(b"Hello, World!", aad).unwrap();
        sealed.body[NONCE_SIZE + 1] ^= 0xFF;
        assert!(cipher.open(&sealed.body, &sealed.tag, aad).is_err());

        let mut sealed = cipher.seal(b"Hello, World!", aad).unwrap();
        sealed.tag[0] ^= 0x01;
        assert!(cipher.open(&sealed.body, &sealed.tag, aad).is_err());
    }

    #[test]
    fn test_aead_wrong_aad() {
        let cipher = AeadCipher::new(AeadAlgorithm::Aes256Gcm, test_key()).unwrap();
        let sealed = cipher.seal(b"Hello, World!", b"correct aad").unwrap();
        assert!(cipher.open(&sealed.body, &sealed.tag, b"wrong aad").is_err());
    }

    #[test]
    fn test_aead_wrong_key() {
        let cipher1 =
            AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, KeyMaterial::new(vec![1u8; 32])).unwrap();
        let cipher2 =
            AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, KeyMaterial::new(vec![2u8; 32])).unwrap();

        let sealed = cipher1.seal(b"Hello, World!", b"").unwrap();
        assert!(cipher2.open(&sealed.body, &sealed.tag, b"").is_err());
    }

    #[test]
    fn test_aead_key_too_short() {
        let short_key = KeyMaterial::new(vec![0u8; 16]);
        assert!(AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, short_key).is_err());
    }

    #[test]
    fn test_aead_data_too_short() {
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, test_key()).unwrap();
        let result = cipher.open(&[0u8; 4], &[0u8; AEAD_TAG_SIZE], b"");
        assert!(matches!(result, Err(AeadError::DataTooShort)));
    }

    #[test]
    fn test_aead_random_nonces_differ() {
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, test_key()).unwrap();
        let first = cipher.seal(b"same", b"").unwrap();
        let second = cipher.seal(b"same", b"").unwrap();
        assert_ne!(first.body, second.body);
    }
}
