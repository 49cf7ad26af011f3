//! Membership directory.
//!
//! Maps network identities to their membership status, serial and Ed25519
//! verifying key, and holds the signing keys of identities hosted locally.
//! The directory itself is an external collaborator; [`InMemoryDirectory`]
//! serves tests and the `peerlink simulate` command.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::protocol::Identity;

/// Membership status of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    /// Full member
    Active,
    /// Registration not yet confirmed
    Pending,
    /// Temporarily barred
    Suspended,
}

impl MembershipStatus {
    /// Status name as stored in record metadata
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Pending => "PENDING",
            Self::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Directory entry for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Network identity
    pub identity: Identity,
    /// Current status
    pub status: MembershipStatus,
    /// Membership serial (bumped on re-registration)
    pub serial: u64,
    /// Ed25519 key that signs this identity's handshake proofs
    pub verifying_key: VerifyingKey,
}

/// Identity directory collaborator
pub trait MembershipDirectory: Send + Sync {
    /// Look up a participant
    fn lookup(&self, identity: &Identity) -> Option<MemberInfo>;

    /// Signing key of an identity hosted by this process
    fn signing_key(&self, identity: &Identity) -> Option<SigningKey>;
}

#[derive(Default)]
struct DirectoryState {
    members: HashMap<Identity, MemberInfo>,
    hosted: HashMap<Identity, SigningKey>,
}

/// Process-local directory
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `identity` locally with a freshly generated identity key
    pub fn host(&self, identity: Identity, serial: u64) -> VerifyingKey {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.members.insert(
            identity.clone(),
            MemberInfo {
                identity: identity.clone(),
                status: MembershipStatus::Active,
                serial,
                verifying_key,
            },
        );
        state.hosted.insert(identity, signing_key);
        verifying_key
    }

    /// Register a remote participant
    pub fn register(&self, info: MemberInfo) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.members.insert(info.identity.clone(), info);
    }

    /// Change a participant's status and serial (e.g. re-registration)
    pub fn update_membership(
        &self,
        identity: &Identity,
        status: MembershipStatus,
        serial: u64,
    ) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.members.get_mut(identity) {
            Some(info) => {
                info.status = status;
                info.serial = serial;
                true
            },
            None => false,
        }
    }
}

impl MembershipDirectory for InMemoryDirectory {
    fn lookup(&self, identity: &Identity) -> Option<MemberInfo> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.members.get(identity).cloned()
    }

    fn signing_key(&self, identity: &Identity) -> Option<SigningKey> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.hosted.get(identity).cloned()
    }
}

impl fmt::Debug for InMemoryDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryDirectory")
            .field("members", &state.members.len())
            .field("hosted", &state.hosted.len())
            .finish()
    }
}
