//! Record metadata: who a session is between and where it stands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LinkError, Result};
use crate::membership::MembershipStatus;
use crate::protocol::{Identity, ProtocolState, Role, SessionId};

/// Parties of a session relationship, seen from the local identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counterparties {
    /// Local identity
    pub source: Identity,
    /// Remote identity
    pub destination: Identity,
    /// Remote membership status
    pub membership_status: MembershipStatus,
    /// Remote membership serial
    pub membership_serial: u64,
    /// Traffic to or from the membership directory itself
    pub is_directory_communication: bool,
}

impl Counterparties {
    /// Create counterparties
    pub fn new(
        source: Identity,
        destination: Identity,
        membership_status: MembershipStatus,
        membership_serial: u64,
        is_directory_communication: bool,
    ) -> Self {
        Self {
            source,
            destination,
            membership_status,
            membership_serial,
            is_directory_communication,
        }
    }

    /// Stable hex SHA-256 digest over every field
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.source.as_str().as_bytes(),
            self.destination.as_str().as_bytes(),
            self.membership_status.name().as_bytes(),
        ] {
            hasher.update((field.len() as u32).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(self.membership_serial.to_be_bytes());
        hasher.update([u8::from(self.is_directory_communication)]);
        hex::encode(hasher.finalize())
    }
}

/// Queryable metadata attached to every session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Session relationship
    pub counterparties: Counterparties,
    /// `counterparties.key()`, stored for metadata filters
    pub counterparties_key: String,
    /// Handshake attempt
    pub session_id: SessionId,
    /// Local role in the attempt
    pub role: Role,
    /// Protocol state
    pub state: ProtocolState,
    /// Replaced by a fresher ESTABLISHED session
    pub superseded: bool,
    /// Initiation attempt number for this relationship (1-based)
    pub attempt: u32,
    /// Attempt creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last state transition
    pub last_transition_at: DateTime<Utc>,
    /// Handshake deadline while in flight
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    /// Metadata for a fresh attempt
    pub fn new(
        counterparties: Counterparties,
        session_id: SessionId,
        role: Role,
        state: ProtocolState,
        attempt: u32,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            counterparties_key: counterparties.key(),
            counterparties,
            session_id,
            role,
            state,
            superseded: false,
            attempt,
            created_at: now,
            last_transition_at: now,
            expires_at,
        }
    }

    /// Copy with a new state stamped at `now`. Moves the state machine does
    /// not allow are rejected with `InvalidTransition`.
    pub fn transitioned(&self, state: ProtocolState, now: DateTime<Utc>) -> Result<Self> {
        if !self.state.can_transition_to(state) {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                to: state,
            });
        }

        let mut next = self.clone();
        next.state = state;
        next.last_transition_at = now;
        if !state.is_in_flight() {
            next.expires_at = None;
        }
        Ok(next)
    }

    /// ESTABLISHED and not superseded
    pub fn is_live(&self) -> bool {
        self.state == ProtocolState::Established && !self.superseded
    }

    /// In flight past its deadline
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state.is_in_flight() && self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Superseded or terminal
    pub fn is_reclaimable(&self) -> bool {
        self.superseded || self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counterparties(serial: u64) -> Counterparties {
        Counterparties::new(
            Identity::new("alice"),
            Identity::new("bob"),
            MembershipStatus::Active,
            serial,
            false,
        )
    }

    #[test]
    fn test_key_stable_and_hex() {
        let key = counterparties(1).key();
        assert_eq!(key, counterparties(1).key());
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_covers_every_field() {
        let base = counterparties(1);
        let mut reversed = base.clone();
        std::mem::swap(&mut reversed.source, &mut reversed.destination);
        let mut suspended = base.clone();
        suspended.membership_status = MembershipStatus::Suspended;
        let mut directory = base.clone();
        directory.is_directory_communication = true;

        assert_ne!(base.key(), counterparties(2).key());
        assert_ne!(base.key(), reversed.key());
        assert_ne!(base.key(), suspended.key());
        assert_ne!(base.key(), directory.key());
    }

    #[test]
    fn test_transition_clears_deadline() {
        let now = Utc::now();
        let meta = SessionMetadata::new(
            counterparties(1),
            SessionId::generate(),
            Role::Initiator,
            ProtocolState::SentHello,
            1,
            now,
            Some(now + chrono::Duration::seconds(5)),
        );
        assert!(!meta.is_overdue(now));
        assert!(meta.is_overdue(now + chrono::Duration::seconds(5)));

        let waiting = meta
            .transitioned(ProtocolState::WaitingForHandshake, now)
            .unwrap();
        assert!(waiting.expires_at.is_some());

        let established = waiting.transitioned(ProtocolState::Established, now).unwrap();
        assert!(established.expires_at.is_none());
        assert!(established.is_live());
        assert!(!established.is_reclaimable());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let now = Utc::now();
        let meta = SessionMetadata::new(
            counterparties(1),
            SessionId::generate(),
            Role::Responder,
            ProtocolState::WaitingForHandshake,
            1,
            now,
            Some(now),
        );
        let expired = meta.transitioned(ProtocolState::Expired, now).unwrap();

        assert!(matches!(
            expired.transitioned(ProtocolState::Established, now),
            Err(LinkError::InvalidTransition {
                from: ProtocolState::Expired,
                to: ProtocolState::Established,
            })
        ));
        // Skipping the Handshake step is not allowed either
        assert!(meta
            .transitioned(ProtocolState::SentHello, now)
            .is_err());
    }
}
