//! One-shot completion handles for queued deliveries.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::SessionId;

/// Proof that a payload was sealed and handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Caller's correlation id
    pub trace_id: String,
    /// Session the payload was sealed under
    pub session_id: SessionId,
    /// Data record sequence number
    pub sequence_number: u64,
}

/// Terminal failure of a queued delivery
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// Session queue was full at enqueue time
    #[error("Queue full ({capacity} messages pending)")]
    Backpressure {
        /// Per-session capacity
        capacity: usize,
    },

    /// Cancelled by the caller before flush
    #[error("Cancelled")]
    Cancelled,

    /// Handshake failed (negotiation or authentication)
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake did not complete within the timeout and attempt budget
    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    /// Sealing or emitting the record failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Sender dropped without completing (process shutting down)
    #[error("Delivery abandoned")]
    Abandoned,
}

/// Terminal result delivered to the caller
pub type DeliveryResult = Result<DeliveryReceipt, DeliveryFailure>;

/// Receiving side of a queued delivery
#[derive(Debug)]
pub struct DeliveryHandle {
    trace_id: String,
    receiver: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryHandle {
    /// Create a linked sender/handle pair
    pub fn channel(trace_id: impl Into<String>) -> (oneshot::Sender<DeliveryResult>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                trace_id: trace_id.into(),
                receiver,
            },
        )
    }

    /// Caller's correlation id
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Result if already available
    pub fn try_result(&mut self) -> Option<DeliveryResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DeliveryFailure::Abandoned)),
        }
    }

    /// Wait for the terminal result
    pub async fn wait(self) -> DeliveryResult {
        self.receiver
            .await
            .unwrap_or(Err(DeliveryFailure::Abandoned))
    }

    /// Block the current thread for the terminal result.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_wait(self) -> DeliveryResult {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(DeliveryFailure::Abandoned))
    }
}
