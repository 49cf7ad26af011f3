//! Session manager.
//!
//! Drives handshakes for outbound sends and inbound protocol messages. All
//! cross-worker coordination goes through the versioned store.
//!
//! Traffic keys live only in memory, in a session cache shared by the workers
//! of one node (see [`SessionManager::worker`]). Stored records keep the
//! hellos and handshake messages but lose the ephemeral secret once the
//! attempt leaves the handshake. A node that lost its cache finds a live
//! record it cannot use; the next send renews the session instead.
//!
//! # Records
//!
//! | Key                   | Holds                                          |
//! |-----------------------|------------------------------------------------|
//! | `link:{cp_key}`       | current outbound attempt for a relationship    |
//! | `session:{id}`        | responder attempts and archived outbound ones  |
//!
//! Creating `link:{cp_key}` at version 0 is the initiation race: the winner
//! emits the Hello, every loser finds the winner's session id and queues
//! behind it. Restarting (timeout, failure, renewal) is a conditional update
//! of the same record, after which the winner archives the previous attempt
//! under its own `session:{id}` key.
//!
//! # Supersession
//!
//! When a handshake completes, every other ESTABLISHED, non-superseded record
//! of the relationship is flagged superseded and its queued messages migrate
//! to the newest session this node holds keys for (by creation time, then
//! session id). Superseded sessions stay in the cache so late data records
//! still open, until [`SessionManager::reclaim_before`] drops them.

mod record;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub use record::{link_key, session_key, HandshakeMaterial};

use crate::config::SessionConfig;
use crate::dispatch::{DispatchOutcome, DropReason};
use crate::error::{LinkError, Result};
use crate::membership::MembershipDirectory;
use crate::protocol::{
    HandshakeEngine, HandshakeMessage, Identity, InitiatorHello, LinkEnvelope,
    LinkMessage, ProtocolState, ResponderHello, Role, Session, SessionId, Transcript,
    INITIATOR_HANDSHAKE_SEQUENCE, INITIATOR_HELLO_SEQUENCE, RESPONDER_HANDSHAKE_SEQUENCE,
    RESPONDER_HELLO_SEQUENCE,
};
use crate::queue::{DeliveryFailure, DeliveryHandle, DeliveryReceipt, FlushSummary, OutboundQueue};
use crate::store::{
    CreateOutcome, Mutation, SessionMetadata, SessionStateStore, StateRecord, StateStore, Updated,
};
use crate::transport::LinkTransport;

pub use crate::store::Counterparties;

/// Established session together with the relationship it serves
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    /// Traffic keys
    pub session: Arc<Session>,
    /// Relationship, from the local side
    pub counterparties: Counterparties,
}

/// Result of an expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    /// Attempts marked EXPIRED
    pub expired: usize,
    /// Attempts restarted with a fresh session id
    pub restarted: usize,
    /// Queued messages failed with `HandshakeTimeout`
    pub failed_messages: usize,
}

/// How an outbound send proceeds
#[derive(Debug)]
struct OutboundPlan {
    session_id: SessionId,
    ready: bool,
    hello: Option<InitiatorHello>,
    replaced: Option<SessionId>,
}

impl OutboundPlan {
    fn ready(session_id: SessionId) -> Self {
        Self {
            session_id,
            ready: true,
            hello: None,
            replaced: None,
        }
    }

    fn queued(session_id: SessionId) -> Self {
        Self {
            session_id,
            ready: false,
            hello: None,
            replaced: None,
        }
    }
}

enum Initiation {
    Won(OutboundPlan),
    Lost(StateRecord),
}

/// Output of one handshake step's read-modify-write
enum Advance {
    Sent(HandshakeMessage),
    Established {
        reply: Option<HandshakeMessage>,
        session: Session,
    },
    Failed(LinkError),
    Stale,
    Malformed(String),
}

/// Coordinates handshakes, the outbound queue and the state store
pub struct SessionManager {
    config: SessionConfig,
    store: SessionStateStore,
    queue: Arc<OutboundQueue>,
    transport: Arc<dyn LinkTransport>,
    directory: Arc<dyn MembershipDirectory>,
    engine: HandshakeEngine,
    sessions: Arc<RwLock<HashMap<SessionId, EstablishedSession>>>,
}

impl SessionManager {
    /// Create a manager. Workers of one node share `store` and `queue`.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn StateStore>,
        queue: Arc<OutboundQueue>,
        transport: Arc<dyn LinkTransport>,
        directory: Arc<dyn MembershipDirectory>,
    ) -> Self {
        let store = SessionStateStore::new(store, config.max_write_attempts);
        Self {
            config,
            store,
            queue,
            transport,
            directory,
            engine: HandshakeEngine::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Another worker of this node, sharing the store, queue, transport,
    /// directory and session cache
    pub fn worker(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            transport: self.transport.clone(),
            directory: self.directory.clone(),
            engine: self.engine,
            sessions: self.sessions.clone(),
        }
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared outbound queue
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Store wrapper
    pub fn store(&self) -> &SessionStateStore {
        &self.store
    }

    /// Whether `identity` is hosted by this node
    pub fn hosts(&self, identity: &Identity) -> bool {
        self.directory.signing_key(identity).is_some()
    }

    /// Relationship between a hosted identity and a peer, from the directory
    pub fn counterparties_for(&self, local: &Identity, peer: &Identity) -> Result<Counterparties> {
        let info = self
            .directory
            .lookup(peer)
            .ok_or_else(|| LinkError::UnknownIdentity(peer.to_string()))?;
        Ok(Counterparties::new(
            local.clone(),
            peer.clone(),
            info.status,
            info.serial,
            false,
        ))
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue `payload` for delivery to `counterparties.destination`.
    ///
    /// Starts a handshake if no session exists. The returned handle completes
    /// once the payload is sealed and emitted, or with a terminal failure.
    pub fn send(
        &self,
        counterparties: &Counterparties,
        trace_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<DeliveryHandle> {
        if !self.hosts(&counterparties.source) {
            return Err(LinkError::UnknownIdentity(counterparties.source.to_string()));
        }

        let now = Utc::now();
        let mut plan = self.resolve_outbound(counterparties, false, now)?;
        if plan.ready && self.established(&plan.session_id)?.is_none() {
            debug!(session_id = %plan.session_id, "No traffic keys held for live session");
            plan = self.resolve_outbound(counterparties, true, now)?;
        }
        if let Some(previous) = &plan.replaced {
            self.queue.migrate(previous, &plan.session_id);
        }

        let handle = self.queue.enqueue(
            &plan.session_id,
            &counterparties.key(),
            trace_id,
            payload,
        );

        if let Some(hello) = plan.hello {
            self.emit_hello(counterparties, hello);
        }

        // A competing worker may have established the session since we read it
        if plan.ready || self.established(&plan.session_id)?.is_some() {
            self.flush(&plan.session_id)?;
        }

        Ok(handle)
    }

    /// Force a fresh handshake for `counterparties` (peer restart, membership
    /// change). Completion supersedes the current session. Returns the id of
    /// the attempt now in flight.
    pub fn renew(&self, counterparties: &Counterparties) -> Result<SessionId> {
        let plan = self.resolve_outbound(counterparties, true, Utc::now())?;
        if let Some(previous) = &plan.replaced {
            self.queue.migrate(previous, &plan.session_id);
        }
        if let Some(hello) = plan.hello {
            info!(session_id = %plan.session_id, peer = %counterparties.destination, "Renewing session");
            self.emit_hello(counterparties, hello);
        }
        Ok(plan.session_id)
    }

    /// Cancel a queued message by trace id
    pub fn cancel(&self, trace_id: &str) -> bool {
        self.queue.cancel(trace_id)
    }

    /// Flush queued messages of an established session
    pub fn flush(&self, session_id: &SessionId) -> Result<FlushSummary> {
        let Some(established) = self.established(session_id)? else {
            return Ok(FlushSummary::default());
        };

        let source = established.counterparties.source.clone();
        let destination = established.counterparties.destination.clone();
        let summary = self.queue.flush_with(session_id, |context| {
            let data = established
                .session
                .seal(&context.payload)
                .map_err(|e| DeliveryFailure::Transport(e.to_string()))?;
            let sequence_number = data.header.sequence_number;

            self.transport
                .send(LinkEnvelope::new(
                    source.clone(),
                    destination.clone(),
                    LinkMessage::Data(data),
                ))
                .map_err(|e| DeliveryFailure::Transport(e.to_string()))?;

            Ok(DeliveryReceipt {
                trace_id: context.trace_id.clone(),
                session_id: session_id.clone(),
                sequence_number,
            })
        });

        if summary.delivered + summary.failed > 0 {
            debug!(
                session_id = %session_id,
                delivered = summary.delivered,
                failed = summary.failed,
                "Flushed queue"
            );
        }
        Ok(summary)
    }

    /// Decide which session an outbound message goes to, initiating or
    /// restarting a handshake when needed
    fn resolve_outbound(
        &self,
        counterparties: &Counterparties,
        renew: bool,
        now: DateTime<Utc>,
    ) -> Result<OutboundPlan> {
        let counterparties_key = counterparties.key();
        let link = link_key(&counterparties_key);
        let mut current = self.store.get(&link)?;

        for _ in 0..self.store.max_attempts() {
            let record = match current.take() {
                Some(record) => record,
                None => {
                    if !renew {
                        if let Some(live) = self.live_session_id(&counterparties_key)? {
                            return Ok(OutboundPlan::ready(live));
                        }
                    }
                    match self.initiate(counterparties, &link, now)? {
                        Initiation::Won(plan) => return Ok(plan),
                        Initiation::Lost(existing) => existing,
                    }
                },
            };

            let metadata = &record.metadata;
            if !renew {
                if metadata.is_live() {
                    return Ok(OutboundPlan::ready(metadata.session_id.clone()));
                }
                if let Some(live) = self.live_session_id(&counterparties_key)? {
                    return Ok(OutboundPlan::ready(live));
                }
            }

            let waiting = metadata.state == ProtocolState::Init
                || (metadata.state.is_in_flight() && !metadata.is_overdue(now));
            if waiting {
                debug!(session_id = %metadata.session_id, "Queueing behind in-flight handshake");
                return Ok(OutboundPlan::queued(metadata.session_id.clone()));
            }

            match self.restart(&record, now)? {
                Some(plan) => return Ok(plan),
                None => current = self.store.get(&link)?,
            }
        }

        Err(LinkError::StateConflict {
            key: link,
            attempts: self.store.max_attempts(),
        })
    }

    /// Race to create the link record at version 0
    fn initiate(
        &self,
        counterparties: &Counterparties,
        link: &str,
        now: DateTime<Utc>,
    ) -> Result<Initiation> {
        let session_id = SessionId::generate();
        let (hello, ephemeral) = self
            .engine
            .build_hello(&session_id, &self.config.supported_modes)?;
        let material =
            HandshakeMaterial::initiator(&self.config.supported_modes, &ephemeral, hello.clone());
        let metadata = SessionMetadata::new(
            counterparties.clone(),
            session_id.clone(),
            Role::Initiator,
            ProtocolState::SentHello,
            1,
            now,
            Some(self.deadline(now)),
        );

        match self.store.create(link, material.to_bytes()?, metadata)? {
            CreateOutcome::Created(_) => {
                info!(session_id = %session_id, peer = %counterparties.destination, "Initiating handshake");
                Ok(Initiation::Won(OutboundPlan {
                    session_id,
                    ready: false,
                    hello: Some(hello),
                    replaced: None,
                }))
            },
            CreateOutcome::Exists(existing) => {
                debug!(
                    session_id = %existing.metadata.session_id,
                    "Lost initiation race"
                );
                Ok(Initiation::Lost(existing))
            },
        }
    }

    /// Replace the attempt in `previous` with a fresh one. Returns `None` if
    /// another worker changed the link record first.
    fn restart(&self, previous: &StateRecord, now: DateTime<Utc>) -> Result<Option<OutboundPlan>> {
        let old_id = previous.metadata.session_id.clone();
        let counterparties = previous.metadata.counterparties.clone();
        let attempt = if previous.metadata.state == ProtocolState::Expired
            || previous.metadata.is_overdue(now)
        {
            previous.metadata.attempt + 1
        } else {
            1
        };

        let session_id = SessionId::generate();
        let (hello, ephemeral) = self
            .engine
            .build_hello(&session_id, &self.config.supported_modes)?;
        let value =
            HandshakeMaterial::initiator(&self.config.supported_modes, &ephemeral, hello.clone())
                .to_bytes()?;
        let deadline = self.deadline(now);

        let updated = self.store.update(&previous.key, |current| {
            if current.metadata.session_id != old_id {
                return Ok(Mutation::Skip(None));
            }
            let metadata = SessionMetadata::new(
                counterparties.clone(),
                session_id.clone(),
                Role::Initiator,
                ProtocolState::SentHello,
                attempt,
                now,
                Some(deadline),
            );
            Ok(Mutation::Write(value.clone(), metadata, Some(current.clone())))
        })?;

        let Some(Updated {
            output: Some(replaced),
            written: true,
            ..
        }) = updated
        else {
            return Ok(None);
        };

        self.archive(replaced, now)?;
        info!(
            previous = %old_id,
            session_id = %session_id,
            attempt,
            "Restarted handshake"
        );

        Ok(Some(OutboundPlan {
            session_id,
            ready: false,
            hello: Some(hello),
            replaced: Some(old_id),
        }))
    }

    /// Keep a replaced outbound attempt under its own session key
    fn archive(&self, replaced: StateRecord, now: DateTime<Utc>) -> Result<()> {
        let mut metadata = replaced.metadata;
        let mut material = HandshakeMaterial::from_bytes(&replaced.value)?;

        if metadata.state.is_in_flight() {
            metadata = metadata.transitioned(ProtocolState::Expired, now)?;
        }
        if metadata.state.is_terminal() {
            material.erase_secret();
        }

        let key = session_key(&metadata.session_id);
        if let CreateOutcome::Exists(_) = self.store.create(&key, material.to_bytes()?, metadata)? {
            debug!(key, "Attempt already archived");
        }
        Ok(())
    }

    fn emit_hello(&self, counterparties: &Counterparties, hello: InitiatorHello) {
        let envelope = LinkEnvelope::new(
            counterparties.source.clone(),
            counterparties.destination.clone(),
            LinkMessage::InitiatorHello(hello),
        );
        // The expiry sweep restarts attempts whose Hello never left
        if let Err(err) = self.transport.send(envelope) {
            warn!(error = %err, transport = self.transport.name(), "Failed to emit Hello");
        }
    }

    fn emit(&self, local: &Identity, peer: &Identity, message: LinkMessage) -> Result<()> {
        self.transport
            .send(LinkEnvelope::new(local.clone(), peer.clone(), message))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Answer a Hello addressed to a hosted identity
    pub fn handle_hello(
        &self,
        source: &Identity,
        destination: &Identity,
        hello: &InitiatorHello,
    ) -> Result<DispatchOutcome> {
        if hello.header().sequence_number != INITIATOR_HELLO_SEQUENCE {
            return Ok(dropped(DropReason::OutOfSequence));
        }
        if !self.hosts(destination) {
            return Ok(dropped(DropReason::UnknownIdentity));
        }
        let counterparties = match self.counterparties_for(destination, source) {
            Ok(counterparties) => counterparties,
            Err(LinkError::UnknownIdentity(_)) => return Ok(dropped(DropReason::UnknownIdentity)),
            Err(err) => return Err(err),
        };

        let session_id = &hello.header().session_id;
        let key = session_key(session_id);
        if let Some(existing) = self.store.get(&key)? {
            return self.replay_hello(destination, source, &existing, hello);
        }

        let now = Utc::now();
        let modes = &self.config.supported_modes;
        match self.engine.process_hello(hello, modes) {
            Ok((responder_hello, ephemeral)) => {
                let material = HandshakeMaterial::responder(
                    modes,
                    &ephemeral,
                    hello.clone(),
                    responder_hello.clone(),
                );
                let metadata = SessionMetadata::new(
                    counterparties,
                    session_id.clone(),
                    Role::Responder,
                    ProtocolState::WaitingForHandshake,
                    1,
                    now,
                    Some(self.deadline(now)),
                );

                match self.store.create(&key, material.to_bytes()?, metadata)? {
                    CreateOutcome::Created(_) => {
                        debug!(
                            session_id = %session_id,
                            mode = %responder_hello.selected_mode,
                            "Answering Hello"
                        );
                        self.emit(
                            destination,
                            source,
                            LinkMessage::ResponderHello(responder_hello),
                        )?;
                        Ok(DispatchOutcome::Responded)
                    },
                    CreateOutcome::Exists(existing) => {
                        self.replay_hello(destination, source, &existing, hello)
                    },
                }
            },
            Err(err @ LinkError::NoCommonMode(_)) => {
                let material = HandshakeMaterial::rejected(modes, hello.clone());
                let metadata = SessionMetadata::new(
                    counterparties,
                    session_id.clone(),
                    Role::Responder,
                    ProtocolState::Failed,
                    1,
                    now,
                    None,
                );
                self.store.create(&key, material.to_bytes()?, metadata)?;
                warn!(session_id = %session_id, peer = %source, error = %err, "Rejected Hello");
                Err(err)
            },
            Err(err) => Err(err),
        }
    }

    /// Re-emit the stored ResponderHello for a duplicate Hello
    fn replay_hello(
        &self,
        local: &Identity,
        peer: &Identity,
        existing: &StateRecord,
        hello: &InitiatorHello,
    ) -> Result<DispatchOutcome> {
        if existing.metadata.role != Role::Responder {
            return Ok(dropped(DropReason::OutOfSequence));
        }

        let material = HandshakeMaterial::from_bytes(&existing.value)?;
        if existing.metadata.state == ProtocolState::WaitingForHandshake
            && material.hello.as_ref() == Some(hello)
        {
            debug!(session_id = %existing.metadata.session_id, "Re-emitting ResponderHello");
            self.emit(
                local,
                peer,
                LinkMessage::ResponderHello(material.responder_hello()?.clone()),
            )?;
            return Ok(DispatchOutcome::Replayed);
        }

        Ok(dropped(DropReason::Duplicate))
    }

    /// Continue an outbound attempt with the initiator's Handshake
    pub fn handle_responder_hello(
        &self,
        source: &Identity,
        destination: &Identity,
        reply: &ResponderHello,
    ) -> Result<DispatchOutcome> {
        if reply.header.sequence_number != RESPONDER_HELLO_SEQUENCE {
            return Ok(dropped(DropReason::OutOfSequence));
        }

        let session_id = &reply.header.session_id;
        let Some(record) = self.find_record(session_id, Some(Role::Initiator))? else {
            return Ok(dropped(DropReason::UnknownSession));
        };
        if let Some(reason) = check_peer(&record.metadata, source, destination) {
            return Ok(dropped(reason));
        }
        if record.metadata.state != ProtocolState::SentHello {
            let material = HandshakeMaterial::from_bytes(&record.value)?;
            if material.responder_hello.as_ref() != Some(reply) {
                return Ok(dropped(DropReason::OutOfSequence));
            }
            // Our Handshake may never have left; answer the duplicate with it
            if let (ProtocolState::WaitingForHandshake, Some(handshake)) =
                (record.metadata.state, material.initiator_handshake.clone())
            {
                debug!(session_id = %session_id, "Re-emitting initiator Handshake");
                self.emit(destination, source, LinkMessage::InitiatorHandshake(handshake))?;
                return Ok(DispatchOutcome::Replayed);
            }
            return Ok(dropped(DropReason::Duplicate));
        }
        let Some(signing_key) = self.directory.signing_key(destination) else {
            return Ok(dropped(DropReason::UnknownIdentity));
        };

        let now = Utc::now();
        let updated = self.store.update(&record.key, |current| {
            if &current.metadata.session_id != session_id
                || current.metadata.state != ProtocolState::SentHello
            {
                return Ok(Mutation::Skip(Advance::Stale));
            }

            let mut material = HandshakeMaterial::from_bytes(&current.value)?;
            let hello = material.hello()?.clone();
            if let Err(err) = self.engine.check_selected_mode(&hello, reply) {
                return fail(current, material, err, now);
            }

            let ephemeral = material.ephemeral()?;
            let transcript = Transcript::from_hellos(&hello, reply);
            let keys = match self.engine.key_schedule(
                &ephemeral,
                &reply.ephemeral_public_key,
                &transcript,
            ) {
                Ok(keys) => keys,
                Err(err) => {
                    let err = LinkError::AuthenticationFailure(err.to_string());
                    return fail(current, material, err, now);
                },
            };

            let handshake = self.engine.build_handshake(
                Role::Initiator,
                session_id,
                reply.selected_mode,
                &keys,
                &transcript,
                destination,
                &signing_key,
            )?;

            material.responder_hello = Some(reply.clone());
            material.initiator_handshake = Some(handshake.clone());
            let mut metadata = current
                .metadata
                .transitioned(ProtocolState::WaitingForHandshake, now)?;
            metadata.expires_at = Some(self.deadline(now));

            Ok(Mutation::Write(
                material.to_bytes()?,
                metadata,
                Advance::Sent(handshake),
            ))
        })?;

        self.finish_step(destination, source, session_id, updated, now)
    }

    /// Verify the initiator's Handshake and answer with ours
    pub fn handle_initiator_handshake(
        &self,
        source: &Identity,
        destination: &Identity,
        handshake: &HandshakeMessage,
    ) -> Result<DispatchOutcome> {
        if handshake.header.sequence_number != INITIATOR_HANDSHAKE_SEQUENCE {
            return Ok(dropped(DropReason::OutOfSequence));
        }

        let session_id = &handshake.header.session_id;
        let key = session_key(session_id);
        let Some(record) = self
            .store
            .get(&key)?
            .filter(|r| r.metadata.role == Role::Responder)
        else {
            return Ok(dropped(DropReason::UnknownSession));
        };
        if let Some(reason) = check_peer(&record.metadata, source, destination) {
            return Ok(dropped(reason));
        }
        if record.metadata.state == ProtocolState::Established {
            return self.replay_handshake(destination, source, &record, handshake);
        }
        if record.metadata.state != ProtocolState::WaitingForHandshake {
            return Ok(dropped(step_already_taken(record.metadata.state)));
        }
        let (Some(signing_key), Some(peer)) = (
            self.directory.signing_key(destination),
            self.directory.lookup(source),
        ) else {
            return Ok(dropped(DropReason::UnknownIdentity));
        };

        let now = Utc::now();
        let updated = self.store.update(&key, |current| {
            if current.metadata.state != ProtocolState::WaitingForHandshake {
                return Ok(Mutation::Skip(Advance::Stale));
            }

            let mut material = HandshakeMaterial::from_bytes(&current.value)?;
            let mode = material.selected_mode()?;
            let transcript = material.transcript()?;
            let initiator_public = *material.hello()?.ephemeral_public_key();
            let ephemeral = material.ephemeral()?;
            let keys = match self
                .engine
                .key_schedule(&ephemeral, &initiator_public, &transcript)
            {
                Ok(keys) => keys,
                Err(err) => {
                    let err = LinkError::AuthenticationFailure(err.to_string());
                    return fail(current, material, err, now);
                },
            };

            match self.engine.verify_handshake(
                Role::Initiator,
                handshake,
                mode,
                &keys,
                &transcript,
                source,
                &peer.verifying_key,
            ) {
                Ok(_) => {},
                Err(LinkError::MalformedMessage(reason)) => {
                    return Ok(Mutation::Skip(Advance::Malformed(reason)));
                },
                Err(err @ LinkError::AuthenticationFailure(_)) => {
                    return fail(current, material, err, now);
                },
                Err(err) => return Err(err),
            }

            let reply = self.engine.build_handshake(
                Role::Responder,
                session_id,
                mode,
                &keys,
                &transcript.with_header(&handshake.header),
                destination,
                &signing_key,
            )?;
            let session = Session::new(session_id.clone(), Role::Responder, mode, &keys)?;

            material.erase_secret();
            material.initiator_handshake = Some(handshake.clone());
            material.responder_handshake = Some(reply.clone());
            let metadata = current
                .metadata
                .transitioned(ProtocolState::Established, now)?;

            Ok(Mutation::Write(
                material.to_bytes()?,
                metadata,
                Advance::Established {
                    reply: Some(reply),
                    session,
                },
            ))
        })?;

        self.finish_step(destination, source, session_id, updated, now)
    }

    /// Verify the responder's Handshake and establish the outbound session
    pub fn handle_responder_handshake(
        &self,
        source: &Identity,
        destination: &Identity,
        handshake: &HandshakeMessage,
    ) -> Result<DispatchOutcome> {
        if handshake.header.sequence_number != RESPONDER_HANDSHAKE_SEQUENCE {
            return Ok(dropped(DropReason::OutOfSequence));
        }

        let session_id = &handshake.header.session_id;
        let Some(record) = self.find_record(session_id, Some(Role::Initiator))? else {
            return Ok(dropped(DropReason::UnknownSession));
        };
        if let Some(reason) = check_peer(&record.metadata, source, destination) {
            return Ok(dropped(reason));
        }
        if record.metadata.state == ProtocolState::Established {
            // Finish whatever an earlier delivery left undone
            self.settle(&record.metadata, Utc::now())?;
            return Ok(dropped(DropReason::Duplicate));
        }
        if record.metadata.state != ProtocolState::WaitingForHandshake {
            return Ok(dropped(step_already_taken(record.metadata.state)));
        }
        let Some(peer) = self.directory.lookup(source) else {
            return Ok(dropped(DropReason::UnknownIdentity));
        };

        let now = Utc::now();
        let updated = self.store.update(&record.key, |current| {
            if &current.metadata.session_id != session_id
                || current.metadata.state != ProtocolState::WaitingForHandshake
            {
                return Ok(Mutation::Skip(Advance::Stale));
            }

            let mut material = HandshakeMaterial::from_bytes(&current.value)?;
            let Some(own_header) = material
                .initiator_handshake
                .as_ref()
                .map(|sent| sent.header.clone())
            else {
                return Ok(Mutation::Skip(Advance::Malformed(
                    "initiator Handshake header missing".to_string(),
                )));
            };
            let mode = material.selected_mode()?;
            let transcript = material.transcript()?;
            let responder_public = material.responder_hello()?.ephemeral_public_key;
            let ephemeral = material.ephemeral()?;
            let keys = match self
                .engine
                .key_schedule(&ephemeral, &responder_public, &transcript)
            {
                Ok(keys) => keys,
                Err(err) => {
                    let err = LinkError::AuthenticationFailure(err.to_string());
                    return fail(current, material, err, now);
                },
            };

            match self.engine.verify_handshake(
                Role::Responder,
                handshake,
                mode,
                &keys,
                &transcript.with_header(&own_header),
                source,
                &peer.verifying_key,
            ) {
                Ok(_) => {},
                Err(LinkError::MalformedMessage(reason)) => {
                    return Ok(Mutation::Skip(Advance::Malformed(reason)));
                },
                Err(err @ LinkError::AuthenticationFailure(_)) => {
                    return fail(current, material, err, now);
                },
                Err(err) => return Err(err),
            }

            let session = Session::new(session_id.clone(), Role::Initiator, mode, &keys)?;
            material.erase_secret();
            let metadata = current
                .metadata
                .transitioned(ProtocolState::Established, now)?;

            Ok(Mutation::Write(
                material.to_bytes()?,
                metadata,
                Advance::Established {
                    reply: None,
                    session,
                },
            ))
        })?;

        self.finish_step(destination, source, session_id, updated, now)
    }

    /// Emit, cache, supersede and flush after a handshake step was stored.
    ///
    /// Local work for an established session happens before the reply is
    /// emitted, so a transport error leaves only the emission to a redelivery.
    fn finish_step(
        &self,
        local: &Identity,
        peer: &Identity,
        session_id: &SessionId,
        updated: Option<Updated<Advance>>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let Some(updated) = updated else {
            return Ok(dropped(DropReason::UnknownSession));
        };

        match updated.output {
            Advance::Stale => Ok(dropped(DropReason::OutOfSequence)),
            Advance::Malformed(reason) => {
                warn!(session_id = %session_id, %reason, "Authenticated but unreadable Handshake");
                Ok(dropped(DropReason::Malformed))
            },
            Advance::Sent(handshake) => {
                self.emit(local, peer, LinkMessage::InitiatorHandshake(handshake))?;
                Ok(DispatchOutcome::Advanced)
            },
            Advance::Established { reply, session } => {
                let metadata = &updated.record.metadata;
                info!(
                    session_id = %session_id,
                    peer = %peer,
                    role = metadata.role.label(),
                    mode = %session.mode(),
                    "Session established"
                );
                self.cache(session, metadata.counterparties.clone());
                let survivor = self
                    .supersede_stale(&metadata.counterparties_key, now)?
                    .unwrap_or_else(|| session_id.clone());

                // Data must not overtake the Handshake that lets the peer open it
                if let Some(reply) = reply {
                    self.emit(local, peer, LinkMessage::ResponderHandshake(reply))?;
                }
                self.flush(&survivor)?;

                Ok(DispatchOutcome::Established(session_id.clone()))
            },
            Advance::Failed(err) => {
                self.evict(session_id);
                self.queue.fail_all(
                    session_id,
                    &DeliveryFailure::HandshakeFailed(err.to_string()),
                );
                warn!(session_id = %session_id, peer = %peer, error = %err, "Handshake failed");
                Err(err)
            },
        }
    }

    /// Answer a redelivered initiator Handshake for an established responder
    /// record with the stored reply
    fn replay_handshake(
        &self,
        local: &Identity,
        peer: &Identity,
        record: &StateRecord,
        handshake: &HandshakeMessage,
    ) -> Result<DispatchOutcome> {
        let material = HandshakeMaterial::from_bytes(&record.value)?;
        let (Some(verified), Some(reply)) =
            (&material.initiator_handshake, material.responder_handshake.clone())
        else {
            return Ok(dropped(DropReason::Duplicate));
        };
        if verified != handshake {
            return Ok(dropped(DropReason::Duplicate));
        }

        let now = Utc::now();
        let survivor = if record.metadata.superseded {
            None
        } else {
            self.supersede_stale(&record.metadata.counterparties_key, now)?
        };

        debug!(session_id = %record.metadata.session_id, "Re-emitting responder Handshake");
        self.emit(local, peer, LinkMessage::ResponderHandshake(reply))?;
        if let Some(survivor) = survivor {
            self.flush(&survivor)?;
        }
        Ok(DispatchOutcome::Replayed)
    }

    /// Supersede and flush for an ESTABLISHED record whose first delivery may
    /// have stopped short
    fn settle(&self, metadata: &SessionMetadata, now: DateTime<Utc>) -> Result<()> {
        if metadata.superseded {
            return Ok(());
        }
        if let Some(survivor) = self.supersede_stale(&metadata.counterparties_key, now)? {
            self.flush(&survivor)?;
        }
        Ok(())
    }

    /// Flag every live session of the relationship except the newest one
    /// this node holds keys for as superseded and move their queues to it.
    /// Returns the survivor.
    fn supersede_stale(
        &self,
        counterparties_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>> {
        let mut live = self.live_records(counterparties_key)?;
        let Some(index) = live
            .iter()
            .rposition(|r| self.cached(&r.metadata.session_id).is_some())
        else {
            return Ok(None);
        };
        let survivor = live.remove(index).metadata.session_id;

        for stale in live {
            let stale_id = stale.metadata.session_id.clone();
            let marked = self.store.update(&stale.key, |current| {
                if current.metadata.session_id != stale_id || !current.metadata.is_live() {
                    return Ok(Mutation::Skip(()));
                }
                let mut metadata = current.metadata.clone();
                metadata.superseded = true;
                metadata.last_transition_at = now;
                Ok(Mutation::Write(current.value.clone(), metadata, ()))
            })?;

            let moved = self.queue.migrate(&stale_id, &survivor);
            if marked.is_some_and(|u| u.written) {
                info!(
                    session_id = %stale_id,
                    replacement = %survivor,
                    moved,
                    "Session superseded"
                );
            }
        }

        Ok(Some(survivor))
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Apply the handshake timeout to every in-flight attempt.
    ///
    /// Outbound attempts with queued messages and attempt budget left are
    /// restarted; everything else overdue becomes EXPIRED and its queued
    /// messages fail with `HandshakeTimeout`.
    pub fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<ExpirySummary> {
        let mut summary = ExpirySummary::default();

        for state in [ProtocolState::SentHello, ProtocolState::WaitingForHandshake] {
            for record in self.store.find_by_metadata("state", state.name())? {
                if !record.metadata.is_overdue(now) {
                    continue;
                }
                let session_id = record.metadata.session_id.clone();

                let retry = record.key.starts_with("link:")
                    && self.queue.pending(&session_id) > 0
                    && record.metadata.attempt < self.config.max_handshake_attempts;
                if retry {
                    if let Some(plan) = self.restart(&record, now)? {
                        self.queue.migrate(&session_id, &plan.session_id);
                        if let Some(hello) = plan.hello {
                            self.emit_hello(&record.metadata.counterparties, hello);
                        }
                        summary.restarted += 1;
                    }
                    continue;
                }

                let expired = self.store.update(&record.key, |current| {
                    if current.metadata.session_id != session_id || !current.metadata.is_overdue(now)
                    {
                        return Ok(Mutation::Skip(()));
                    }
                    let mut material = HandshakeMaterial::from_bytes(&current.value)?;
                    material.erase_secret();
                    let metadata = current.metadata.transitioned(ProtocolState::Expired, now)?;
                    Ok(Mutation::Write(material.to_bytes()?, metadata, ()))
                })?;

                if expired.is_some_and(|u| u.written) {
                    summary.expired += 1;
                    summary.failed_messages += self.queue.fail_all(
                        &session_id,
                        &DeliveryFailure::HandshakeTimeout(
                            LinkError::HandshakeTimeout(session_id.to_string()).to_string(),
                        ),
                    );
                    self.evict(&session_id);
                    warn!(session_id = %session_id, attempt = record.metadata.attempt, "Handshake expired");
                }
            }
        }

        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Queries and cache
    // ------------------------------------------------------------------

    /// Metadata of the current outbound attempt for `counterparties`
    pub fn outbound_state(&self, counterparties: &Counterparties) -> Result<Option<SessionMetadata>> {
        Ok(self
            .store
            .get(&link_key(&counterparties.key()))?
            .map(|r| r.metadata))
    }

    /// Newest live session of the relationship
    pub fn live_session(&self, counterparties: &Counterparties) -> Result<Option<SessionId>> {
        self.live_session_id(&counterparties.key())
    }

    /// Record of a handshake attempt (outbound or responder)
    pub fn session_record(&self, session_id: &SessionId) -> Result<Option<StateRecord>> {
        self.find_record(session_id, None)
    }

    /// Traffic keys of an ESTABLISHED session, superseded or not, if this node
    /// completed its handshake. Keys are never recovered from the store.
    pub fn established(&self, session_id: &SessionId) -> Result<Option<EstablishedSession>> {
        Ok(self.cached(session_id))
    }

    /// Delete superseded, failed and expired records last modified before
    /// `time` and forget the keys of sessions whose record is gone. Returns
    /// the number of records deleted.
    pub fn reclaim_before(&self, time: DateTime<Utc>) -> Result<usize> {
        let deleted = self.store.reclaim_before(time)?;
        if deleted == 0 {
            return Ok(0);
        }

        let cached: Vec<SessionId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for session_id in cached {
            if self.find_record(&session_id, None)?.is_none() {
                self.evict(&session_id);
            }
        }
        debug!(deleted, "Reclaimed session records");
        Ok(deleted)
    }

    fn cached(&self, session_id: &SessionId) -> Option<EstablishedSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn cache(&self, session: Session, counterparties: Counterparties) -> EstablishedSession {
        let established = EstablishedSession {
            session: Arc::new(session),
            counterparties,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(established.session.id().clone())
            .or_insert(established)
            .clone()
    }

    fn evict(&self, session_id: &SessionId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Live records of a relationship, oldest first
    fn live_records(&self, counterparties_key: &str) -> Result<Vec<StateRecord>> {
        let mut live: Vec<StateRecord> = self
            .store
            .find_by_metadata("counterparties_key", counterparties_key)?
            .into_iter()
            .filter(|r| r.metadata.is_live())
            .collect();
        live.sort_by(|a, b| {
            (a.metadata.created_at, &a.metadata.session_id)
                .cmp(&(b.metadata.created_at, &b.metadata.session_id))
        });
        Ok(live)
    }

    fn live_session_id(&self, counterparties_key: &str) -> Result<Option<SessionId>> {
        Ok(self
            .live_records(counterparties_key)?
            .pop()
            .map(|r| r.metadata.session_id))
    }

    /// Record for `session_id`, preferring the link record over an archive
    fn find_record(&self, session_id: &SessionId, role: Option<Role>) -> Result<Option<StateRecord>> {
        let mut records: Vec<StateRecord> = self
            .store
            .find_by_metadata("session_id", session_id.as_str())?
            .into_iter()
            .filter(|r| role.map_or(true, |role| r.metadata.role == role))
            .collect();
        records.sort_by_key(|r| !r.key.starts_with("link:"));
        Ok(records.into_iter().next())
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.config.handshake_timeout()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

fn dropped(reason: DropReason) -> DispatchOutcome {
    DispatchOutcome::Dropped(reason)
}

/// Drop reason for a step whose record already moved past it
fn step_already_taken(state: ProtocolState) -> DropReason {
    if state == ProtocolState::Established {
        DropReason::Duplicate
    } else {
        DropReason::OutOfSequence
    }
}

/// The envelope must come from the record's peer and go to its local identity
fn check_peer(metadata: &SessionMetadata, source: &Identity, destination: &Identity) -> Option<DropReason> {
    if &metadata.counterparties.destination != source || &metadata.counterparties.source != destination {
        Some(DropReason::UnexpectedSender)
    } else {
        None
    }
}

/// FAILED successor of `current` with the ephemeral secret erased
fn fail(
    current: &StateRecord,
    mut material: HandshakeMaterial,
    err: LinkError,
    now: DateTime<Utc>,
) -> Result<Mutation<Advance>> {
    material.erase_secret();
    let metadata = current.metadata.transitioned(ProtocolState::Failed, now)?;
    Ok(Mutation::Write(material.to_bytes()?, metadata, Advance::Failed(err)))
}
