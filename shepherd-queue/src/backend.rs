//! Persistence contract for the work queue.
//!
//! The queue needs exactly two things from a store: a transactional
//! read-modify-write of a single key's record, and a snapshot scan of all
//! records. Everything else (ordering, leases, retries) is layered on top
//! by [`WorkQueue`](crate::WorkQueue).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single key's durable record.
///
/// Exactly one record exists per key; a key is never simultaneously
/// present in two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    /// The opaque work key.
    pub key: String,
    /// Higher runs first.
    pub priority: i64,
    /// Earliest eligibility; may be in the past.
    pub not_before: DateTime<Utc>,
    /// Attempts completed so far. Increments only on transition out of
    /// in-progress back to queued or to dead-letter.
    pub attempts: u32,
    /// When the key was first enqueued; survives merges.
    pub first_seen: DateTime<Utc>,
    /// When the record last changed state.
    pub last_transition: DateTime<Utc>,
    /// Which of the three sets the key currently occupies.
    pub phase: KeyPhase,
}

impl KeyState {
    /// Whether the record is queued and eligible to start at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.phase, KeyPhase::Queued) && self.not_before <= now
    }
}

/// The queue state machine's three sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyPhase {
    /// Waiting to be started.
    Queued,
    /// Held by a worker under a heartbeat lease.
    InProgress {
        /// Identity of the worker holding the lease.
        owner_id: String,
        /// The lease deadline; past this the key is orphaned.
        lease_expires_at: DateTime<Utc>,
        /// A re-enqueue requested while the attempt was running, applied
        /// when the attempt finishes (the dual-state rule).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requeue_on_complete: Option<PendingRequeue>,
    },
    /// Retries exhausted or explicitly dead-lettered.
    Deadlettered {
        /// The error that sent the key here.
        last_error: String,
    },
}

/// A pending re-enqueue recorded against an in-progress key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequeue {
    /// Priority for the re-enqueued record.
    pub priority: i64,
    /// Eligibility for the re-enqueued record.
    pub not_before: DateTime<Utc>,
}

impl PendingRequeue {
    /// Merge a second pending request into this one: priority rises
    /// monotonically, eligibility only moves earlier.
    pub fn merge(self, priority: i64, not_before: DateTime<Utc>) -> Self {
        Self {
            priority: self.priority.max(priority),
            not_before: self.not_before.min(not_before),
        }
    }
}

/// Why a mutation refused to apply.
///
/// These are ordinary races under concurrent dispatchers (a key started by
/// another replica, a lease that was extended after enumeration observed it
/// expired), surfaced so callers can skip rather than fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    /// The key has no record.
    #[error("key {0} does not exist")]
    Missing(String),
    /// The record is not in the phase the mutation requires.
    #[error("key {key} is not {expected}")]
    Phase {
        /// The key.
        key: String,
        /// The phase the mutation required.
        expected: &'static str,
    },
    /// The record's lease is held by a different worker.
    #[error("key {key} lease is held by {holder}")]
    NotOwner {
        /// The key.
        key: String,
        /// The worker currently holding the lease.
        holder: String,
    },
    /// The record is queued but not yet visible.
    #[error("key {key} is not eligible until {not_before}")]
    NotEligible {
        /// The key.
        key: String,
        /// When it becomes eligible.
        not_before: DateTime<Utc>,
    },
}

impl MutationError {
    /// The key the mutation was rejected for.
    pub fn key(&self) -> &str {
        match self {
            MutationError::Missing(key)
            | MutationError::Phase { key, .. }
            | MutationError::NotOwner { key, .. }
            | MutationError::NotEligible { key, .. } => key,
        }
    }
}

/// Backend failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not serve the request.
    #[error("backend unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The mutation closure refused to apply.
    #[error(transparent)]
    Rejected(#[from] MutationError),
}

/// A transactional transition for one key: receives the current record (if
/// any) and returns the new record, `None` to remove it, or a rejection.
pub type Mutation<'a> =
    Box<dyn FnOnce(Option<KeyState>) -> Result<Option<KeyState>, MutationError> + Send + 'a>;

/// A transactional key/value store with snapshot enumeration.
///
/// `update` must apply the mutation atomically with respect to other
/// updates of the same key; this atomicity is the sole foundation of
/// multi-replica correctness.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Atomically read, transform and write back one key's record.
    /// Returns the record as stored after the mutation (`None` if removed).
    async fn update(&self, key: &str, mutation: Mutation<'_>) -> Result<Option<KeyState>, BackendError>;

    /// Snapshot all records.
    async fn list(&self) -> Result<Vec<KeyState>, BackendError>;
}

#[async_trait]
impl<B: Backend> Backend for std::sync::Arc<B> {
    async fn update(&self, key: &str, mutation: Mutation<'_>) -> Result<Option<KeyState>, BackendError> {
        (**self).update(key, mutation).await
    }

    async fn list(&self) -> Result<Vec<KeyState>, BackendError> {
        (**self).list().await
    }
}
