//! Outbound message queue.
//!
//! Application payloads wait here, per session id, until their session is
//! ESTABLISHED. Each entry carries a one-shot completion sender; every entry
//! is completed exactly once (delivered, failed, or cancelled).
//!
//! Ordering: entries get a process-wide enqueue sequence. Flushing drains a
//! session in FIFO order and migration between session ids merges by that
//! sequence, so messages keep their original order across restarts and
//! supersession. Flushes of one session are single-flighted.

mod handle;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use handle::{DeliveryFailure, DeliveryHandle, DeliveryReceipt, DeliveryResult};

use crate::protocol::SessionId;

/// Default per-session queue capacity
pub const DEFAULT_CAPACITY_PER_SESSION: usize = 1024;

/// One queued application message
#[derive(Debug)]
pub struct OutboundMessageContext {
    /// Caller's correlation id
    pub trace_id: String,
    /// Opaque application payload
    pub payload: Vec<u8>,
    /// Process-wide enqueue order
    pub enqueue_sequence: u64,
    completion: oneshot::Sender<DeliveryResult>,
}

impl OutboundMessageContext {
    fn complete(self, result: DeliveryResult) {
        // Caller may have dropped its handle
        let _ = self.completion.send(result);
    }
}

#[derive(Debug)]
struct SessionQueue {
    counterparties_key: String,
    items: VecDeque<OutboundMessageContext>,
    flushing: bool,
}

impl SessionQueue {
    fn new(counterparties_key: &str) -> Self {
        Self {
            counterparties_key: counterparties_key.to_string(),
            items: VecDeque::new(),
            flushing: false,
        }
    }
}

/// Outcome of one flush call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Entries completed successfully
    pub delivered: usize,
    /// Entries completed with a failure
    pub failed: usize,
    /// Another thread was already flushing this session
    pub already_flushing: bool,
}

/// Per-session FIFO queues
#[derive(Debug)]
pub struct OutboundQueue {
    capacity_per_session: usize,
    sessions: Mutex<HashMap<SessionId, SessionQueue>>,
    next_sequence: AtomicU64,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_PER_SESSION)
    }
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity_per_session` entries per session
    pub fn new(capacity_per_session: usize) -> Self {
        Self {
            capacity_per_session,
            sessions: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Per-session capacity
    pub fn capacity_per_session(&self) -> usize {
        self.capacity_per_session
    }

    /// Queue `payload` behind `session_id`.
    ///
    /// A full queue completes the returned handle with `Backpressure`
    /// immediately.
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        counterparties_key: &str,
        trace_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> DeliveryHandle {
        let trace_id = trace_id.into();
        let (completion, handle) = DeliveryHandle::channel(trace_id.clone());
        let context = OutboundMessageContext {
            trace_id,
            payload,
            enqueue_sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            completion,
        };

        let mut sessions = self.lock();
        let queue = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionQueue::new(counterparties_key));

        if queue.items.len() >= self.capacity_per_session {
            drop(sessions);
            warn!(session_id = %session_id, trace_id = %context.trace_id, "Queue full, rejecting message");
            context.complete(Err(DeliveryFailure::Backpressure {
                capacity: self.capacity_per_session,
            }));
            return handle;
        }

        debug!(
            session_id = %session_id,
            trace_id = %context.trace_id,
            sequence = context.enqueue_sequence,
            "Queued message"
        );
        queue.items.push_back(context);
        handle
    }

    /// Move every entry of `from` onto `to`, merging by enqueue sequence.
    /// Returns the number moved.
    pub fn migrate(&self, from: &SessionId, to: &SessionId) -> usize {
        if from == to {
            return 0;
        }

        let mut sessions = self.lock();
        let Some(mut source) = sessions.remove(from) else {
            return 0;
        };
        let moved = source.items.len();

        let target = sessions
            .entry(to.clone())
            .or_insert_with(|| SessionQueue::new(&source.counterparties_key));

        let mut merged: Vec<OutboundMessageContext> = target.items.drain(..).collect();
        merged.extend(source.items.drain(..));
        merged.sort_by_key(|c| c.enqueue_sequence);
        target.items = merged.into();

        if moved > 0 {
            debug!(from = %from, to = %to, moved, "Migrated queued messages");
        }
        moved
    }

    /// Drain `session_id` in FIFO order, completing each entry with `send`'s
    /// result. Entries queued while draining are drained too. Returns at once
    /// if another thread is already flushing the session.
    pub fn flush_with<F>(&self, session_id: &SessionId, mut send: F) -> FlushSummary
    where
        F: FnMut(&OutboundMessageContext) -> DeliveryResult,
    {
        let mut summary = FlushSummary::default();

        {
            let mut sessions = self.lock();
            match sessions.get_mut(session_id) {
                Some(queue) if queue.flushing => {
                    summary.already_flushing = true;
                    return summary;
                },
                Some(queue) => queue.flushing = true,
                None => return summary,
            }
        }

        loop {
            let next = {
                let mut sessions = self.lock();
                match sessions.get_mut(session_id) {
                    Some(queue) => match queue.items.pop_front() {
                        Some(context) => Some(context),
                        None => {
                            sessions.remove(session_id);
                            None
                        },
                    },
                    // Migrated away mid-flush
                    None => None,
                }
            };

            let Some(context) = next else {
                break;
            };

            let result = send(&context);
            match &result {
                Ok(_) => summary.delivered += 1,
                Err(failure) => {
                    warn!(session_id = %session_id, trace_id = %context.trace_id, %failure, "Delivery failed");
                    summary.failed += 1;
                },
            }
            context.complete(result);
        }

        summary
    }

    /// Complete every entry of `session_id` with `failure`. Returns the count.
    pub fn fail_all(&self, session_id: &SessionId, failure: &DeliveryFailure) -> usize {
        let removed = self.lock().remove(session_id);
        let Some(queue) = removed else {
            return 0;
        };

        let count = queue.items.len();
        for context in queue.items {
            context.complete(Err(failure.clone()));
        }
        if count > 0 {
            warn!(session_id = %session_id, count, %failure, "Failed queued messages");
        }
        count
    }

    /// Remove the entry with `trace_id` and complete it with `Cancelled`
    pub fn cancel(&self, trace_id: &str) -> bool {
        let found = {
            let mut sessions = self.lock();
            sessions.values_mut().find_map(|queue| {
                let index = queue.items.iter().position(|c| c.trace_id == trace_id)?;
                queue.items.remove(index)
            })
        };

        match found {
            Some(context) => {
                debug!(trace_id, "Cancelled queued message");
                context.complete(Err(DeliveryFailure::Cancelled));
                true
            },
            None => false,
        }
    }

    /// Entries waiting on `session_id`
    pub fn pending(&self, session_id: &SessionId) -> usize {
        self.lock()
            .get(session_id)
            .map_or(0, |queue| queue.items.len())
    }

    /// Trace ids waiting on `session_id`, in flush order
    pub fn pending_trace_ids(&self, session_id: &SessionId) -> Vec<String> {
        self.lock()
            .get(session_id)
            .map(|queue| queue.items.iter().map(|c| c.trace_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Entries waiting across all sessions
    pub fn total_pending(&self) -> usize {
        self.lock().values().map(|queue| queue.items.len()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionQueue>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
