//! Unified cryptographic error type.
//!
//! Aggregates the per-primitive errors and preserves the error chain through
//! `#[source]` so callers can walk down to the failing primitive.
//!
//! | Variant | Falsified belief |
//! |---------|------------------|
//! | `Aead` | Data was sealed under this key and associated data |
//! | `Exchange` | Peer ephemeral key was a valid contributory point |
//! | `Key` | Key material was valid for derivation |
//! | `Identity` | Peer controls the identity key it claims |
//!
//! None of these are retryable with the same inputs.

use thiserror::Error;

use super::aead::AeadError;
use super::exchange::KeyExchangeError;
use super::identity::IdentityError;
use super::keys::KeyError;

/// Unified error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption/decryption error.
    #[error("AEAD: {0}")]
    Aead(#[source] AeadError),

    /// Key exchange error (X25519).
    #[error("Key exchange: {0}")]
    Exchange(#[source] KeyExchangeError),

    /// Key material error (empty, too short, derivation failure).
    #[error("Key: {0}")]
    Key(#[source] KeyError),

    /// Identity proof error (Ed25519).
    #[error("Identity: {0}")]
    Identity(#[source] IdentityError),
}

impl From<AeadError> for CryptoError {
    fn from(err: AeadError) -> Self {
        CryptoError::Aead(err)
    }
}

impl From<KeyExchangeError> for CryptoError {
    fn from(err: KeyExchangeError) -> Self {
        CryptoError::Exchange(err)
    }
}

impl From<KeyError> for CryptoError {
    fn from(err: KeyError) -> Self {
        CryptoError::Key(err)
    }
}

impl From<IdentityError> for CryptoError {
    fn from(err: IdentityError) -> Self {
        CryptoError::Identity(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_error_conversion() {
        let crypto_err: CryptoError = AeadError::DataTooShort.into();
        assert!(matches!(crypto_err, CryptoError::Aead(_)));
        assert!(crypto_err.to_string().contains("AEAD"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let crypto_err: CryptoError = AeadError::DecryptionFailed("bad tag".to_string()).into();
        let source = crypto_err.source();
        assert!(source.is_some());
        assert!(source.unwrap().to_string().contains("bad tag"));
    }

    #[test]
    fn test_identity_error_conversion() {
        let crypto_err: CryptoError = IdentityError::VerificationFailed.into();
        assert!(matches!(crypto_err, CryptoError::Identity(_)));
    }
}
