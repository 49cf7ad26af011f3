//! Secret key material and HKDF derivation.
//!
//! Uses HKDF (HMAC-based Key Derivation Function, RFC 5869) over SHA-256 to
//! turn the X25519 shared secret into handshake and traffic keys.

#![allow(missing_docs)]

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from key material operations
#[derive(Debug, Error)]
pub enum KeyError {
    /// Invalid key material
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Key material (secret bytes), zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create new key material from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Derive a new key using HKDF extract (with `salt`) then expand
    pub fn derive_with_salt(
        &self,
        salt: &[u8],
        info: &[u8],
        output_len: usize,
    ) -> Result<KeyMaterial, KeyError> {
        if self.bytes.is_empty() {
            return Err(KeyError::InvalidKey("empty input key material".to_string()));
        }

        let hk = Hkdf::<Sha256>::new(Some(salt), &self.bytes);
        let mut okm = vec![0u8; output_len];

        hk.expand(info, &mut okm)
            .map_err(|e| KeyError::DerivationFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(KeyMaterial::new(okm))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't leak key material in debug output
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for KeyMaterial {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts() {
        let key = KeyMaterial::new(vec![0xAA; 32]);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("aa"));
    }

    #[test]
    fn test_derive_is_deterministic_and_label_separated() {
        let ikm = KeyMaterial::new(vec![7u8; 32]);
        let a1 = ikm.derive_with_salt(b"salt", b"label-a", 32).unwrap();
        let a2 = ikm.derive_with_salt(b"salt", b"label-a", 32).unwrap();
        let b = ikm.derive_with_salt(b"salt", b"label-b", 32).unwrap();
        let other_salt = ikm.derive_with_salt(b"other", b"label-a", 32).unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_ne!(a1, other_salt);
    }

    #[test]
    fn test_derive_rejects_empty_ikm() {
        let empty = KeyMaterial::new(Vec::new());
        assert!(empty.derive_with_salt(b"salt", b"info", 32).is_err());
    }

    #[test]
    fn test_derive_rejects_oversized_output() {
        let ikm = KeyMaterial::new(vec![1u8; 32]);
        // HKDF-SHA256 caps output at 255 * 32 bytes
        assert!(ikm.derive_with_salt(b"", b"info", 255 * 32 + 1).is_err());
    }
}

#[cfg(test)]
mod rfc5869_tests {
    use super::*;
    use hex_literal::hex;

    /// Test Case 1: Basic test case with SHA-256
    ///
    /// From RFC 5869 Appendix A.1
    #[test]
    fn test_rfc5869_case1_sha256_basic() {
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex!("000102030405060708090a0b0c");
        let info = hex!("f0f1f2f3f4f5f6f7f8f9");

        let expected_okm = hex!(
            "3cb25f25faacd57a90434f64d0362f2a"
            "2d2d0a90cf1a5a4c5db02d56ecc4c5bf"
            "34007208d5b887185865"
        );

        let okm = KeyMaterial::new(ikm.to_vec())
            .derive_with_salt(&salt, &info, expected_okm.len())
            .unwrap();
        assert_eq!(okm.as_bytes(), &expected_okm[..]);
    }

    /// Test Case 3: SHA-256 with zero-length salt and info
    ///
    /// From RFC 5869 Appendix A.3
    #[test]
    fn test_rfc5869_case3_sha256_no_salt() {
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");

        let expected_okm = hex!(
            "8da4e775a563c18f715f802a063c5a31"
            "b8a11f5c5ee1879ec3454e5f3c738d2d"
            "9d201395faa4b61a96c8"
        );

        let okm = KeyMaterial::new(ikm.to_vec())
            .derive_with_salt(&[], &[], expected_okm.len())
            .unwrap();
        assert_eq!(okm.as_bytes(), &expected_okm[..]);
    }
}
