//! The in-flight envelope an outbound mail travels the pipeline in.

use tokio::sync::oneshot;

use crate::message::Message;

/// Terminal classification of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Accepted by the remote MTA (2xx on the final dot).
    Delivered,
    /// Blocked by the sender's exclusion list.
    Revoked,
    /// The per-destination rate window is exhausted.
    OverLimit,
    /// Republished to a delayed queue for a later retry.
    Delayed,
    /// Republished to a failure queue; no further retries here.
    Failed,
}

/// Wraps a [`Message`] with its single-shot result sink.
///
/// Exactly one terminal result is delivered per envelope: stages either
/// forward the envelope or call [`SendEnvelope::complete`], and dropping an
/// uncompleted envelope (a stage channel closed mid-flight) resolves the
/// sink with [`SendResult::Failed`] so the submitter never hangs.
#[derive(Debug)]
pub struct SendEnvelope {
    pub message: Message,
    /// In-process connection attempt counter, bounded by the connector.
    pub try_count: u32,
    result: Option<oneshot::Sender<SendResult>>,
}

impl SendEnvelope {
    pub fn new(message: Message) -> (Self, oneshot::Receiver<SendResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                try_count: 0,
                result: Some(tx),
            },
            rx,
        )
    }

    /// Resolve the result sink. Receiver gone is fine; the submitter may
    /// have given up waiting.
    pub fn complete(mut self, result: SendResult) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
    }
}

impl Drop for SendEnvelope {
    fn drop(&mut self) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(SendResult::Failed);
        }
    }
}
