//! Reconcile outcomes and the error taxonomy the dispatcher acts on.

use std::time::Duration;

use thiserror::Error;

use crate::options::{ProcessResponse, QueueKeyRequest};

/// The successful outcome of one reconcile attempt.
///
/// Control flow is carried here rather than on the error channel: an error
/// return always means the attempt failed, and the dispatcher decides
/// between retry and dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The key is done; remove it from the queue.
    Done,
    /// Re-run the key after the given delay without counting an attempt.
    RequeueAfter(Duration),
    /// Enqueue children, then complete the current key. A child equal to
    /// the current key implements explicit self-requeue.
    Fanout(Vec<QueueKeyRequest>),
}

impl Action {
    /// Complete the key.
    #[must_use]
    pub fn done() -> Self {
        Action::Done
    }

    /// Schedule the key to run again after `delay`.
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Action::RequeueAfter(delay)
    }

    /// Enqueue `children` and complete the current key.
    #[must_use]
    pub fn fanout(children: impl IntoIterator<Item = QueueKeyRequest>) -> Self {
        Action::Fanout(children.into_iter().collect())
    }

    /// Decode from the wire shape.
    ///
    /// `queue_keys` takes precedence over `requeue_after_seconds`; a
    /// processor that wants both queues itself as one of the children.
    pub fn from_response(resp: ProcessResponse) -> Self {
        if !resp.queue_keys.is_empty() {
            Action::Fanout(resp.queue_keys)
        } else if let Some(secs) = resp.requeue_after_seconds {
            Action::RequeueAfter(Duration::from_secs(secs.max(0) as u64))
        } else {
            Action::Done
        }
    }

    /// Encode into the wire shape.
    pub fn into_response(self) -> ProcessResponse {
        match self {
            Action::Done => ProcessResponse::default(),
            Action::RequeueAfter(delay) => ProcessResponse {
                requeue_after_seconds: Some(delay.as_secs() as i64),
                ..ProcessResponse::default()
            },
            Action::Fanout(queue_keys) => ProcessResponse {
                queue_keys,
                ..ProcessResponse::default()
            },
        }
    }
}

/// Why a reconcile attempt failed.
///
/// The distinction the dispatcher cares about is retriability:
/// [`ReconcileError::NonRetriable`] completes the key without another
/// attempt (the reason is logged), anything else counts toward the retry
/// cap and is retried with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A logical precondition was violated; retrying cannot help.
    #[error("non-retriable: {reason}")]
    NonRetriable {
        /// Human-readable explanation, logged by the dispatcher.
        reason: String,
    },
    /// The attempt failed for a reason that may clear up on retry.
    #[error("reconcile failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ReconcileError {
    /// A failure that must not be retried.
    pub fn non_retriable(reason: impl Into<String>) -> Self {
        ReconcileError::NonRetriable { reason: reason.into() }
    }

    /// A retriable failure wrapping its source.
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ReconcileError::Failed(err.into())
    }

    /// Whether the dispatcher should complete the key instead of retrying.
    pub fn is_non_retriable(&self) -> bool {
        matches!(self, ReconcileError::NonRetriable { .. })
    }
}
