//! Ed25519 identity proofs over the handshake transcript.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Errors from identity proof verification
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Signature bytes are not a valid Ed25519 signature encoding
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Signature does not verify under the peer's identity key
    #[error("Signature verification failed")]
    VerificationFailed,
}

fn signed_message(label: &[u8], transcript_hash: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(label.len() + 1 + transcript_hash.len());
    message.extend_from_slice(label);
    message.push(0);
    message.extend_from_slice(transcript_hash);
    message
}

/// Sign `label ∥ 0x00 ∥ transcript_hash` with the hosted identity key.
pub fn sign_transcript(key: &SigningKey, label: &[u8], transcript_hash: &[u8; 32]) -> Vec<u8> {
    key.sign(&signed_message(label, transcript_hash))
        .to_bytes()
        .to_vec()
}

/// Verify a transcript signature produced by [`sign_transcript`].
pub fn verify_transcript(
    key: &VerifyingKey,
    label: &[u8],
    transcript_hash: &[u8; 32],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let signature = Signature::from_slice(signature)
        .map_err(|e| IdentityError::MalformedSignature(e.to_string()))?;

    key.verify(&signed_message(label, transcript_hash), &signature)
        .map_err(|_| IdentityError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let hash = [9u8; 32];

        let signature = sign_transcript(&key, b"initiator", &hash);
        verify_transcript(&key.verifying_key(), b"initiator", &hash, &signature).unwrap();
    }

    #[test]
    fn test_label_binding() {
        let key = SigningKey::generate(&mut OsRng);
        let hash = [9u8; 32];

        let signature = sign_transcript(&key, b"initiator", &hash);
        let result = verify_transcript(&key.verifying_key(), b"responder", &hash, &signature);
        assert!(matches!(result, Err(IdentityError::VerificationFailed)));
    }

    #[test]
    fn test_wrong_key_and_malformed() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let hash = [1u8; 32];

        let signature = sign_transcript(&key, b"responder", &hash);
        assert!(verify_transcript(&other.verifying_key(), b"responder", &hash, &signature).is_err());

        let result = verify_transcript(&key.verifying_key(), b"responder", &hash, &[0u8; 10]);
        assert!(matches!(result, Err(IdentityError::MalformedSignature(_))));
    }
}
