//! Shared fixtures: in-process nodes wired together through channel
//! transports. Every node owns its store, queue, directory and session cache;
//! workers of a node share them.

#![allow(dead_code)]

use std::sync::Arc;

use peerlink::{
    ChannelTransport, CollectingSink, Counterparties, DispatchOutcome, Identity,
    InMemoryDirectory, InMemoryStateStore, InboundDispatcher, LinkEnvelope, LinkMessage,
    MembershipDirectory, OutboundQueue, ProtocolMode, Result, SessionConfig,
    SessionManager, StateRecord,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Queue capacity used by every fixture node
pub const CAPACITY: usize = 8;

pub struct Node {
    pub identity: Identity,
    pub config: SessionConfig,
    pub directory: Arc<InMemoryDirectory>,
    pub store: Arc<InMemoryStateStore>,
    pub queue: Arc<OutboundQueue>,
    pub transport: Arc<ChannelTransport>,
    pub sink: Arc<CollectingSink>,
    pub manager: Arc<SessionManager>,
    pub dispatcher: InboundDispatcher,
    wire: UnboundedReceiver<Vec<u8>>,
}

impl Node {
    pub fn new(name: &str, config: SessionConfig) -> Self {
        let identity = Identity::new(name);
        let directory = Arc::new(InMemoryDirectory::new());
        directory.host(identity.clone(), 1);

        let store = Arc::new(InMemoryStateStore::new());
        let queue = Arc::new(OutboundQueue::new(CAPACITY));
        let (transport, wire) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let sink = Arc::new(CollectingSink::new());
        let manager = Arc::new(SessionManager::new(
            config.clone(),
            store.clone(),
            queue.clone(),
            transport.clone(),
            directory.clone(),
        ));
        let dispatcher = InboundDispatcher::new(manager.clone(), sink.clone());

        Self {
            identity,
            config,
            directory,
            store,
            queue,
            transport,
            sink,
            manager,
            dispatcher,
            wire,
        }
    }

    /// Another worker of this node: same store, queue, transport, directory
    /// and session cache
    pub fn worker(&self) -> Arc<SessionManager> {
        Arc::new(self.manager.worker())
    }

    /// Make `peer` known to this node's directory
    pub fn trust(&self, peer: &Node) {
        let info = peer
            .directory
            .lookup(&peer.identity)
            .expect("peer hosts its identity");
        self.directory.register(info);
    }

    pub fn counterparties(&self, peer: &Node) -> Counterparties {
        self.manager
            .counterparties_for(&self.identity, &peer.identity)
            .expect("peer registered")
    }

    /// Everything emitted since the last call, decoded
    pub fn outbox(&mut self) -> Vec<LinkEnvelope> {
        let mut out = Vec::new();
        while let Ok(bytes) = self.wire.try_recv() {
            out.push(LinkEnvelope::from_wire(&bytes).expect("emitted envelopes decode"));
        }
        out
    }

    /// Every record for `counterparties` in this node's store
    pub fn records_for(&self, counterparties: &Counterparties) -> Vec<StateRecord> {
        self.manager
            .store()
            .find_by_metadata("counterparties_key", counterparties.key())
            .expect("store available")
    }
}

pub fn config(modes: &[ProtocolMode]) -> SessionConfig {
    SessionConfig {
        supported_modes: modes.to_vec(),
        ..SessionConfig::default()
    }
}

/// Two nodes that know each other
pub fn connect(a: (&str, SessionConfig), b: (&str, SessionConfig)) -> (Node, Node) {
    let a = Node::new(a.0, a.1);
    let b = Node::new(b.0, b.1);
    a.trust(&b);
    b.trust(&a);
    (a, b)
}

pub fn alice_and_bob(alice: &[ProtocolMode], bob: &[ProtocolMode]) -> (Node, Node) {
    connect(("alice", config(alice)), ("bob", config(bob)))
}

/// Deliver what `from` emitted to `to`
pub fn relay(from: &mut Node, to: &Node) -> Vec<Result<DispatchOutcome>> {
    from.outbox()
        .into_iter()
        .map(|envelope| to.dispatcher.dispatch(envelope))
        .collect()
}

/// Relay in both directions until both sides go quiet
pub fn pump(a: &mut Node, b: &mut Node) -> Vec<Result<DispatchOutcome>> {
    let mut outcomes = Vec::new();
    for _ in 0..32 {
        let forward = relay(a, b);
        let backward = relay(b, a);
        if forward.is_empty() && backward.is_empty() {
            break;
        }
        outcomes.extend(forward);
        outcomes.extend(backward);
    }
    outcomes
}

/// Take the first emitted message of the given kind, keeping the rest queued
/// for the caller
pub fn take_first(
    envelopes: &mut Vec<LinkEnvelope>,
    pick: impl Fn(&LinkMessage) -> bool,
) -> LinkEnvelope {
    let index = envelopes
        .iter()
        .position(|e| pick(&e.message))
        .expect("message emitted");
    envelopes.remove(index)
}

/// Complete a handshake started by `a` sending one message to `b`, returning
/// the session id
pub fn establish(a: &mut Node, b: &mut Node) -> peerlink::SessionId {
    let cp = a.counterparties(b);
    let mut handle = a
        .manager
        .send(&cp, "establish", b"hello".to_vec())
        .expect("send accepted");
    pump(a, b);
    handle
        .try_result()
        .expect("completed")
        .expect("delivered")
        .session_id
}
