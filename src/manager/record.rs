//! Negotiation material persisted in session records.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::KeyPair;
use crate::error::{LinkError, Result};
use crate::protocol::{
    HandshakeMessage, InitiatorHello, ProtocolMode, ResponderHello, SessionId, Transcript,
};

/// Key of the record that tracks the current outbound attempt for a relationship
pub fn link_key(counterparties_key: &str) -> String {
    format!("link:{counterparties_key}")
}

/// Key of a responder record or an archived outbound attempt
pub fn session_key(session_id: &SessionId) -> String {
    format!("session:{session_id}")
}

/// Everything needed to resume a handshake or answer its duplicates.
///
/// Traffic keys are never stored: the ephemeral secret is erased as soon as
/// the attempt leaves the handshake, whatever its outcome.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMaterial {
    /// Modes this side offered or accepted
    pub own_modes: Vec<ProtocolMode>,
    /// Own ephemeral X25519 secret while the handshake is in flight
    #[serde(with = "optional_secret")]
    pub ephemeral_secret: Option<[u8; 32]>,
    /// Initiator's Hello
    pub hello: Option<InitiatorHello>,
    /// Responder's Hello
    pub responder_hello: Option<ResponderHello>,
    /// Initiator's Handshake, as sent or as verified
    pub initiator_handshake: Option<HandshakeMessage>,
    /// Responder's Handshake as sent, re-emitted for duplicates
    pub responder_handshake: Option<HandshakeMessage>,
}

impl HandshakeMaterial {
    /// Material of a fresh outbound attempt
    pub fn initiator(own_modes: &[ProtocolMode], ephemeral: &KeyPair, hello: InitiatorHello) -> Self {
        Self {
            own_modes: own_modes.to_vec(),
            ephemeral_secret: Some(*ephemeral.secret_bytes()),
            hello: Some(hello),
            responder_hello: None,
            initiator_handshake: None,
            responder_handshake: None,
        }
    }

    /// Material of a Hello that could not be answered
    pub fn rejected(own_modes: &[ProtocolMode], hello: InitiatorHello) -> Self {
        Self {
            own_modes: own_modes.to_vec(),
            ephemeral_secret: None,
            hello: Some(hello),
            responder_hello: None,
            initiator_handshake: None,
            responder_handshake: None,
        }
    }

    /// Material of an answered Hello
    pub fn responder(
        own_modes: &[ProtocolMode],
        ephemeral: &KeyPair,
        hello: InitiatorHello,
        responder_hello: ResponderHello,
    ) -> Self {
        Self {
            own_modes: own_modes.to_vec(),
            ephemeral_secret: Some(*ephemeral.secret_bytes()),
            hello: Some(hello),
            responder_hello: Some(responder_hello),
            initiator_handshake: None,
            responder_handshake: None,
        }
    }

    /// Decode a stored record value
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| LinkError::MalformedMessage(format!("stored negotiation material: {e}")))
    }

    /// Encode as a record value
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Drop the ephemeral secret
    pub fn erase_secret(&mut self) {
        if let Some(secret) = self.ephemeral_secret.as_mut() {
            secret.zeroize();
        }
        self.ephemeral_secret = None;
    }

    /// Own ephemeral key pair
    pub fn ephemeral(&self) -> Result<KeyPair> {
        self.ephemeral_secret
            .map(KeyPair::from_secret)
            .ok_or_else(|| LinkError::MalformedMessage("ephemeral secret erased".to_string()))
    }

    /// Stored Hello
    pub fn hello(&self) -> Result<&InitiatorHello> {
        self.hello
            .as_ref()
            .ok_or_else(|| LinkError::MalformedMessage("Hello missing from record".to_string()))
    }

    /// Stored ResponderHello
    pub fn responder_hello(&self) -> Result<&ResponderHello> {
        self.responder_hello.as_ref().ok_or_else(|| {
            LinkError::MalformedMessage("ResponderHello missing from record".to_string())
        })
    }

    /// Transcript over both stored hellos
    pub fn transcript(&self) -> Result<Transcript> {
        Ok(Transcript::from_hellos(self.hello()?, self.responder_hello()?))
    }

    /// Negotiated mode
    pub fn selected_mode(&self) -> Result<ProtocolMode> {
        Ok(self.responder_hello()?.selected_mode)
    }
}

impl Drop for HandshakeMaterial {
    fn drop(&mut self) {
        if let Some(secret) = self.ephemeral_secret.as_mut() {
            secret.zeroize();
        }
    }
}

impl std::fmt::Debug for HandshakeMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeMaterial")
            .field("own_modes", &self.own_modes)
            .field("has_secret", &self.ephemeral_secret.is_some())
            .field("hello", &self.hello.is_some())
            .field("responder_hello", &self.responder_hello.is_some())
            .field("initiator_handshake", &self.initiator_handshake.is_some())
            .field("responder_handshake", &self.responder_handshake.is_some())
            .finish()
    }
}

mod optional_secret {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error> {
        match secret {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("ephemeral secret must be 32 bytes"))?;
        Ok(Some(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HandshakeEngine;

    #[test]
    fn test_material_survives_storage() {
        let engine = HandshakeEngine::new();
        let modes = [ProtocolMode::ChaCha20Poly1305];
        let (hello, eph) = engine.build_hello(&SessionId::generate(), &modes).unwrap();
        let material = HandshakeMaterial::initiator(&modes, &eph, hello);

        let restored = HandshakeMaterial::from_bytes(&material.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, material);
        assert_eq!(
            restored.ephemeral().unwrap().public_key(),
            eph.public_key()
        );
        assert!(restored.transcript().is_err());
    }

    #[test]
    fn test_erase_secret() {
        let engine = HandshakeEngine::new();
        let modes = [ProtocolMode::Aes256Gcm];
        let (hello, eph) = engine.build_hello(&SessionId::generate(), &modes).unwrap();
        let mut material = HandshakeMaterial::initiator(&modes, &eph, hello);

        material.erase_secret();
        assert!(material.ephemeral().is_err());

        let json = String::from_utf8(material.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"ephemeral_secret\":null"));
    }

    #[test]
    fn test_record_keys() {
        let id = SessionId::new("abc");
        assert_eq!(session_key(&id), "session:abc");
        assert_eq!(link_key("00ff"), "link:00ff");
    }
}
