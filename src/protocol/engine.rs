//! Handshake protocol engine.
//!
//! Stateless: every operation takes its inputs explicitly and returns the
//! produced message together with any secret the caller must keep. Nothing is
//! cached between calls, so an engine can be copied into any worker.
//!
//! # Key schedule
//!
//! ```text
//! shared = X25519(own ephemeral, peer ephemeral)
//! salt   = SHA-256(transcript after both hellos)
//! k_x    = HKDF-SHA256(salt, shared, "peerlink/v1 <label>")
//! ```
//!
//! Four keys are derived: a handshake key and a traffic key per direction.

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::message::{
    base64_bytes, CommonHeader, HandshakeMessage, Identity, InitiatorHello, MessageType,
    ResponderHello, SessionId,
};
use super::mode::{negotiate, ProtocolMode};
use super::state::Role;
use super::transcript::Transcript;
use crate::crypto::{
    sign_transcript, verify_transcript, AeadCipher, CryptoError, KeyMaterial, KeyPair, PublicKey,
    KEY_SIZE,
};
use crate::error::{LinkError, Result};

const INITIATOR_HANDSHAKE_LABEL: &[u8] = b"peerlink/v1 initiator handshake";
const RESPONDER_HANDSHAKE_LABEL: &[u8] = b"peerlink/v1 responder handshake";
const INITIATOR_TRAFFIC_LABEL: &[u8] = b"peerlink/v1 initiator traffic";
const RESPONDER_TRAFFIC_LABEL: &[u8] = b"peerlink/v1 responder traffic";

/// Directional keys derived from one ephemeral exchange
#[derive(Clone)]
pub struct KeySchedule {
    initiator_handshake: KeyMaterial,
    responder_handshake: KeyMaterial,
    initiator_traffic: KeyMaterial,
    responder_traffic: KeyMaterial,
}

impl KeySchedule {
    /// Key protecting the handshake message sent by `sender`
    pub fn handshake_key(&self, sender: Role) -> &KeyMaterial {
        match sender {
            Role::Initiator => &self.initiator_handshake,
            Role::Responder => &self.responder_handshake,
        }
    }

    /// Key protecting data records sent by `sender`
    pub fn traffic_key(&self, sender: Role) -> &KeyMaterial {
        match sender {
            Role::Initiator => &self.initiator_traffic,
            Role::Responder => &self.responder_traffic,
        }
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule").finish_non_exhaustive()
    }
}

/// Decrypted body of a Handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    /// Transcript hash the sender signed
    #[serde(with = "base64_bytes")]
    pub transcript_hash: Vec<u8>,
    /// Identity the sender claims
    pub identity: Identity,
    /// Ed25519 signature over the transcript hash
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Stateless handshake engine
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeEngine;

impl HandshakeEngine {
    /// Create an engine
    pub fn new() -> Self {
        Self
    }

    /// Build the initiator's Hello with a fresh ephemeral key pair.
    ///
    /// Duplicate modes are dropped, keeping the first occurrence.
    pub fn build_hello(
        &self,
        session_id: &SessionId,
        supported_modes: &[ProtocolMode],
    ) -> Result<(InitiatorHello, KeyPair)> {
        let mut modes: Vec<ProtocolMode> = Vec::with_capacity(supported_modes.len());
        for mode in supported_modes {
            if !modes.contains(mode) {
                modes.push(*mode);
            }
        }

        let ephemeral = KeyPair::generate();
        let hello = InitiatorHello::new(
            CommonHeader::for_step(session_id.clone(), MessageType::InitiatorHello),
            *ephemeral.public_key(),
            modes,
        )?;

        debug!(session_id = %session_id, modes = hello.supported_modes().len(), "Built Hello");
        Ok((hello, ephemeral))
    }

    /// Answer a Hello with the highest-priority common mode
    pub fn process_hello(
        &self,
        hello: &InitiatorHello,
        own_modes: &[ProtocolMode],
    ) -> Result<(ResponderHello, KeyPair)> {
        let selected_mode = negotiate(own_modes, hello.supported_modes()).ok_or_else(|| {
            LinkError::NoCommonMode(format!(
                "offered {:?}, supported {:?}",
                hello.supported_modes(),
                own_modes
            ))
        })?;

        let ephemeral = KeyPair::generate();
        let responder_hello = ResponderHello {
            header: CommonHeader::for_step(
                hello.header().session_id.clone(),
                MessageType::ResponderHello,
            ),
            ephemeral_public_key: *ephemeral.public_key(),
            selected_mode,
        };

        debug!(
            session_id = %hello.header().session_id,
            mode = %selected_mode,
            "Selected mode"
        );
        Ok((responder_hello, ephemeral))
    }

    /// Reject a ResponderHello whose mode was never offered
    pub fn check_selected_mode(
        &self,
        hello: &InitiatorHello,
        responder_hello: &ResponderHello,
    ) -> Result<()> {
        if hello.supported_modes().contains(&responder_hello.selected_mode) {
            Ok(())
        } else {
            Err(LinkError::NoCommonMode(format!(
                "responder selected {} which was not offered",
                responder_hello.selected_mode
            )))
        }
    }

    /// Derive the four directional keys from the ephemeral exchange
    pub fn key_schedule(
        &self,
        own: &KeyPair,
        peer_public: &PublicKey,
        transcript: &Transcript,
    ) -> Result<KeySchedule> {
        let shared = own.diffie_hellman(peer_public).map_err(CryptoError::from)?;
        let salt = transcript.hash();

        let derive = |label: &[u8]| -> Result<KeyMaterial> {
            Ok(shared
                .derive_with_salt(&salt, label, KEY_SIZE)
                .map_err(CryptoError::from)?)
        };

        Ok(KeySchedule {
            initiator_handshake: derive(INITIATOR_HANDSHAKE_LABEL)?,
            responder_handshake: derive(RESPONDER_HANDSHAKE_LABEL)?,
            initiator_traffic: derive(INITIATOR_TRAFFIC_LABEL)?,
            responder_traffic: derive(RESPONDER_TRAFFIC_LABEL)?,
        })
    }

    /// Build the sender's Handshake message.
    ///
    /// `transcript` is what the sender has seen: the hellos for the initiator,
    /// the hellos plus the initiator's Handshake header for the responder.
    #[allow(clippy::too_many_arguments)]
    pub fn build_handshake(
        &self,
        sender: Role,
        session_id: &SessionId,
        mode: ProtocolMode,
        keys: &KeySchedule,
        transcript: &Transcript,
        identity: &Identity,
        signing_key: &SigningKey,
    ) -> Result<HandshakeMessage> {
        let transcript_hash = transcript.hash();
        let proof = IdentityProof {
            transcript_hash: transcript_hash.to_vec(),
            identity: identity.clone(),
            signature: sign_transcript(signing_key, sender.label().as_bytes(), &transcript_hash),
        };

        let header = CommonHeader::for_step(session_id.clone(), handshake_type(sender));
        let cipher = AeadCipher::new(mode.aead(), keys.handshake_key(sender).clone())
            .map_err(CryptoError::from)?;
        let sealed = cipher
            .seal(&serde_json::to_vec(&proof)?, &header.to_bytes())
            .map_err(CryptoError::from)?;

        Ok(HandshakeMessage {
            header,
            encrypted_payload: sealed.body,
            authentication_tag: sealed.tag,
        })
    }

    /// Verify a Handshake message sent by `sender`.
    ///
    /// Tag, transcript, identity and signature failures are all
    /// `AuthenticationFailure`. A payload that authenticates but does not parse
    /// is `MalformedMessage`.
    #[allow(clippy::too_many_arguments)]
    pub fn verify_handshake(
        &self,
        sender: Role,
        message: &HandshakeMessage,
        mode: ProtocolMode,
        keys: &KeySchedule,
        expected_transcript: &Transcript,
        expected_identity: &Identity,
        verifying_key: &VerifyingKey,
    ) -> Result<IdentityProof> {
        if message.header.message_type != handshake_type(sender) {
            return Err(LinkError::MalformedMessage(format!(
                "expected {:?}, got {:?}",
                handshake_type(sender),
                message.header.message_type
            )));
        }

        let cipher = AeadCipher::new(mode.aead(), keys.handshake_key(sender).clone())
            .map_err(CryptoError::from)?;
        let plaintext = cipher
            .open(
                &message.encrypted_payload,
                &message.authentication_tag,
                &message.header.to_bytes(),
            )
            .map_err(|e| LinkError::AuthenticationFailure(format!("handshake tag: {e}")))?;

        let proof: IdentityProof = serde_json::from_slice(&plaintext)
            .map_err(|e| LinkError::MalformedMessage(format!("identity proof: {e}")))?;

        let expected_hash = expected_transcript.hash();
        if proof.transcript_hash != expected_hash {
            return Err(LinkError::AuthenticationFailure(
                "transcript hash mismatch".to_string(),
            ));
        }

        if &proof.identity != expected_identity {
            return Err(LinkError::AuthenticationFailure(format!(
                "expected identity {expected_identity}, peer claimed {}",
                proof.identity
            )));
        }

        verify_transcript(
            verifying_key,
            sender.label().as_bytes(),
            &expected_hash,
            &proof.signature,
        )
        .map_err(|e| LinkError::AuthenticationFailure(format!("identity proof: {e}")))?;

        debug!(session_id = %message.header.session_id, sender = sender.label(), "Verified Handshake");
        Ok(proof)
    }
}

fn handshake_type(sender: Role) -> MessageType {
    match sender {
        Role::Initiator => MessageType::InitiatorHandshake,
        Role::Responder => MessageType::ResponderHandshake,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    struct Run {
        hello: InitiatorHello,
        responder_hello: ResponderHello,
        initiator_keys: KeySchedule,
        responder_keys: KeySchedule,
        transcript: Transcript,
    }

    fn run_hellos(initiator_modes: &[ProtocolMode], responder_modes: &[ProtocolMode]) -> Run {
        let engine = HandshakeEngine::new();
        let id = SessionId::generate();
        let (hello, i_eph) = engine.build_hello(&id, initiator_modes).unwrap();
        let (responder_hello, r_eph) = engine.process_hello(&hello, responder_modes).unwrap();
        let transcript = Transcript::from_hellos(&hello, &responder_hello);

        Run {
            initiator_keys: engine
                .key_schedule(&i_eph, &responder_hello.ephemeral_public_key, &transcript)
                .unwrap(),
            responder_keys: engine
                .key_schedule(&r_eph, hello.ephemeral_public_key(), &transcript)
                .unwrap(),
            hello,
            responder_hello,
            transcript,
        }
    }

    #[test]
    fn test_build_hello_empty_modes() {
        let engine = HandshakeEngine::new();
        let result = engine.build_hello(&SessionId::generate(), &[]);
        assert!(matches!(result, Err(LinkError::InvalidModeList(_))));
    }

    #[test]
    fn test_process_hello_no_common_mode() {
        let engine = HandshakeEngine::new();
        let (hello, _) = engine
            .build_hello(&SessionId::generate(), &[ProtocolMode::Aes256Gcm])
            .unwrap();
        let result = engine.process_hello(&hello, &[ProtocolMode::AuthenticationOnly]);
        assert!(matches!(result, Err(LinkError::NoCommonMode(_))));
    }

    #[test]
    fn test_key_schedules_agree() {
        let run = run_hellos(
            &[ProtocolMode::Aes256Gcm, ProtocolMode::ChaCha20Poly1305],
            &[ProtocolMode::ChaCha20Poly1305],
        );
        assert_eq!(run.responder_hello.selected_mode, ProtocolMode::ChaCha20Poly1305);
        for role in [Role::Initiator, Role::Responder] {
            assert_eq!(
                run.initiator_keys.handshake_key(role),
                run.responder_keys.handshake_key(role)
            );
            assert_eq!(
                run.initiator_keys.traffic_key(role),
                run.responder_keys.traffic_key(role)
            );
        }
        assert_ne!(
            run.initiator_keys.traffic_key(Role::Initiator),
            run.initiator_keys.traffic_key(Role::Responder)
        );
    }

    #[test]
    fn test_handshake_verifies() {
        let engine = HandshakeEngine::new();
        let run = run_hellos(&[ProtocolMode::ChaCha20Poly1305], &[ProtocolMode::ChaCha20Poly1305]);
        let alice_key = SigningKey::generate(&mut OsRng);
        let alice = Identity::new("alice");
        let mode = run.responder_hello.selected_mode;

        let message = engine
            .build_handshake(
                Role::Initiator,
                &run.hello.header().session_id,
                mode,
                &run.initiator_keys,
                &run.transcript,
                &alice,
                &alice_key,
            )
            .unwrap();

        let proof = engine
            .verify_handshake(
                Role::Initiator,
                &message,
                mode,
                &run.responder_keys,
                &run.transcript,
                &alice,
                &alice_key.verifying_key(),
            )
            .unwrap();
        assert_eq!(proof.identity, alice);
    }

    #[test]
    fn test_corrupted_tag_rejected() {
        let engine = HandshakeEngine::new();
        let run = run_hellos(&[ProtocolMode::Aes256Gcm], &[ProtocolMode::Aes256Gcm]);
        let key = SigningKey::generate(&mut OsRng);
        let alice = Identity::new("alice");

        let mut message = engine
            .build_handshake(
                Role::Initiator,
                &run.hello.header().session_id,
                ProtocolMode::Aes256Gcm,
                &run.initiator_keys,
                &run.transcript,
                &alice,
                &key,
            )
            .unwrap();
        message.authentication_tag[0] ^= 0xFF;

        let result = engine.verify_handshake(
            Role::Initiator,
            &message,
            ProtocolMode::Aes256Gcm,
            &run.responder_keys,
            &run.transcript,
            &alice,
            &key.verifying_key(),
        );
        assert!(matches!(result, Err(LinkError::AuthenticationFailure(_))));
    }

    #[test]
    fn test_wrong_identity_rejected() {
        let engine = HandshakeEngine::new();
        let run = run_hellos(&[ProtocolMode::ChaCha20Poly1305], &[ProtocolMode::ChaCha20Poly1305]);
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let mode = ProtocolMode::ChaCha20Poly1305;

        let message = engine
            .build_handshake(
                Role::Responder,
                &run.hello.header().session_id,
                mode,
                &run.responder_keys,
                &run.transcript,
                &Identity::new("mallory"),
                &key,
            )
            .unwrap();

        let claimed = engine.verify_handshake(
            Role::Responder,
            &message,
            mode,
            &run.initiator_keys,
            &run.transcript,
            &Identity::new("bob"),
            &key.verifying_key(),
        );
        assert!(matches!(claimed, Err(LinkError::AuthenticationFailure(_))));

        let signature = engine.verify_handshake(
            Role::Responder,
            &message,
            mode,
            &run.initiator_keys,
            &run.transcript,
            &Identity::new("mallory"),
            &other.verifying_key(),
        );
        assert!(matches!(signature, Err(LinkError::AuthenticationFailure(_))));
    }

    #[test]
    fn test_transcript_mismatch_rejected() {
        let engine = HandshakeEngine::new();
        let run = run_hellos(&[ProtocolMode::ChaCha20Poly1305], &[ProtocolMode::ChaCha20Poly1305]);
        let key = SigningKey::generate(&mut OsRng);
        let alice = Identity::new("alice");
        let mode = ProtocolMode::ChaCha20Poly1305;

        let message = engine
            .build_handshake(
                Role::Initiator,
                &run.hello.header().session_id,
                mode,
                &run.initiator_keys,
                &run.transcript,
                &alice,
                &key,
            )
            .unwrap();

        let other = run.transcript.with_header(&message.header);
        let result = engine.verify_handshake(
            Role::Initiator,
            &message,
            mode,
            &run.responder_keys,
            &other,
            &alice,
            &key.verifying_key(),
        );
        assert!(matches!(result, Err(LinkError::AuthenticationFailure(_))));
    }

    #[test]
    fn test_selected_mode_must_be_offered() {
        let engine = HandshakeEngine::new();
        let run = run_hellos(&[ProtocolMode::Aes256Gcm], &[ProtocolMode::Aes256Gcm]);
        let mut forged = run.responder_hello.clone();
        forged.selected_mode = ProtocolMode::AuthenticationOnly;

        assert!(engine.check_selected_mode(&run.hello, &run.responder_hello).is_ok());
        assert!(matches!(
            engine.check_selected_mode(&run.hello, &forged),
            Err(LinkError::NoCommonMode(_))
        ));
    }
}
