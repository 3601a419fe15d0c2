//! The work-queue state machine.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use shepherd_core::QueueOptions;
use thiserror::Error;
use tracing::debug;

use crate::{
    backend::{Backend, BackendError, KeyPhase, KeyState, MutationError, PendingRequeue},
    backoff::retry_delay,
};

/// Queue tunables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Base delay for the first retry.
    pub backoff_base: Duration,
    /// Exponent cap: delays stop doubling after this many attempts.
    pub backoff_cap: u32,
    /// How long a started key may go without a heartbeat before it is
    /// considered orphaned.
    pub lease_duration: Duration,
    /// This worker's identity, stamped onto leases it takes.
    pub owner_id: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: 6,
            lease_duration: Duration::from_secs(30),
            owner_id: format!("worker-{:08x}", rand::rng().random::<u32>()),
        }
    }
}

/// Queue operation failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Work keys must be non-empty strings.
    #[error("work keys must be non-empty")]
    EmptyKey,
    /// The transition lost a race: the key is no longer in the phase (or
    /// under the lease) the operation requires. Callers should skip the
    /// key; another replica owns it.
    #[error("conflicting transition for key {0}")]
    Conflict(String),
    /// The backend failed.
    #[error("queue backend error")]
    Backend(#[source] BackendError),
}

impl From<BackendError> for QueueError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(rejection) => QueueError::Conflict(rejection.key().to_string()),
            other => QueueError::Backend(other),
        }
    }
}

/// Durable, priority-aware work queue over a transactional [`Backend`].
///
/// Handles are cheap to clone and share one backend.
#[derive(Debug)]
pub struct WorkQueue<B> {
    inner: Arc<Inner<B>>,
}

#[derive(Debug)]
struct Inner<B> {
    backend: B,
    config: QueueConfig,
}

impl<B> Clone for WorkQueue<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// One enumeration pass: a consistent-enough snapshot of the three sets.
///
/// Queued keys are ordered by effective rank: priority descending, then
/// `not_before` ascending, then `first_seen` ascending.
pub struct Enumeration<B> {
    /// Keys currently held by workers, orphan-flagged as of the snapshot.
    pub in_progress: Vec<InProgressKey<B>>,
    /// Keys waiting to run, in rank order.
    pub queued: Vec<QueuedKey<B>>,
    /// Keys whose retries were exhausted.
    pub deadlettered: Vec<DeadletteredKey>,
}

impl<B: Backend> WorkQueue<B> {
    /// A queue over `backend` with default tunables.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, QueueConfig::default())
    }

    /// A queue over `backend` with explicit tunables.
    pub fn with_config(backend: B, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner { backend, config }),
        }
    }

    /// The queue's tunables.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// The underlying backend, for direct inspection and state injection.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Insert or merge a queued record for `key`.
    ///
    /// - Already queued: priorities merge upward, eligibility merges
    ///   earlier, `first_seen` and `attempts` are preserved. With
    ///   `deduplicate` the existing record wins unchanged.
    /// - In progress: a re-enqueue is recorded and applied when the
    ///   running attempt completes (dual-state). `deduplicate` skips this
    ///   as well.
    /// - Dead-lettered: the key is resurrected with `attempts = 0`.
    pub async fn queue(&self, key: &str, opts: QueueOptions) -> Result<(), QueueError> {
        if key.is_empty() {
            return Err(QueueError::EmptyKey);
        }
        let now = Utc::now();
        let not_before = opts.not_before.unwrap_or(now);
        let priority = opts.priority;
        let deduplicate = opts.deduplicate;
        let key_owned = key.to_string();
        self.inner
            .backend
            .update(
                key,
                Box::new(move |existing| {
                    Ok(Some(match existing {
                        None => KeyState {
                            key: key_owned,
                            priority,
                            not_before,
                            attempts: 0,
                            first_seen: now,
                            last_transition: now,
                            phase: KeyPhase::Queued,
                        },
                        Some(mut state) => {
                            match &mut state.phase {
                                KeyPhase::Queued => {
                                    if !deduplicate {
                                        state.priority = state.priority.max(priority);
                                        state.not_before = state.not_before.min(not_before);
                                        state.last_transition = now;
                                    }
                                }
                                KeyPhase::InProgress { requeue_on_complete, .. } => {
                                    if !deduplicate {
                                        *requeue_on_complete = Some(match requeue_on_complete.take() {
                                            None => PendingRequeue { priority, not_before },
                                            Some(pending) => pending.merge(priority, not_before),
                                        });
                                    }
                                }
                                KeyPhase::Deadlettered { .. } => {
                                    state.priority = priority;
                                    state.not_before = not_before;
                                    state.attempts = 0;
                                    state.last_transition = now;
                                    state.phase = KeyPhase::Queued;
                                }
                            }
                            state
                        }
                    }))
                }),
            )
            .await?;
        debug!(%key, priority, "queued");
        Ok(())
    }

    /// Snapshot the three sets.
    pub async fn enumerate(&self) -> Result<Enumeration<B>, QueueError> {
        let now = Utc::now();
        let mut in_progress = Vec::new();
        let mut queued = Vec::new();
        let mut deadlettered = Vec::new();
        for state in self.inner.backend.list().await.map_err(QueueError::Backend)? {
            match &state.phase {
                KeyPhase::Queued => queued.push(QueuedKey { queue: self.clone(), state }),
                KeyPhase::InProgress { lease_expires_at, .. } => {
                    let orphaned = *lease_expires_at < now;
                    in_progress.push(InProgressKey { queue: self.clone(), state, orphaned });
                }
                KeyPhase::Deadlettered { last_error } => deadlettered.push(DeadletteredKey {
                    key: state.key.clone(),
                    attempts: state.attempts,
                    last_error: last_error.clone(),
                    since: state.last_transition,
                }),
            }
        }
        queued.sort_by(|a, b| {
            b.state
                .priority
                .cmp(&a.state.priority)
                .then(a.state.not_before.cmp(&b.state.not_before))
                .then(a.state.first_seen.cmp(&b.state.first_seen))
        });
        Ok(Enumeration { in_progress, queued, deadlettered })
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.inner.config.lease_duration
    }
}

/// A queued key as seen by one enumeration.
pub struct QueuedKey<B> {
    queue: WorkQueue<B>,
    state: KeyState,
}

impl<B: Backend> QueuedKey<B> {
    /// The work key.
    pub fn name(&self) -> &str {
        &self.state.key
    }

    /// The key's merged priority.
    pub fn priority(&self) -> i64 {
        self.state.priority
    }

    /// Earliest eligibility.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.state.not_before
    }

    /// Attempts completed so far.
    pub fn attempts(&self) -> u32 {
        self.state.attempts
    }

    /// Whether the key may be started now.
    pub fn is_eligible(&self) -> bool {
        self.state.is_eligible(Utc::now())
    }

    /// Queued keys are never orphaned; the flag exists on the shared
    /// enumeration surface for symmetry with in-progress keys.
    pub fn is_orphaned(&self) -> bool {
        false
    }

    /// Atomically take the key: queued and eligible becomes in-progress
    /// under this worker's lease. Loses cleanly with
    /// [`QueueError::Conflict`] when another replica got there first.
    pub async fn start(&self) -> Result<OwnedKey<B>, QueueError> {
        let now = Utc::now();
        let lease_expires_at = self.queue.lease_deadline(now);
        let owner_id = self.queue.inner.config.owner_id.clone();
        let key = self.state.key.clone();
        let started = self
            .queue
            .inner
            .backend
            .update(
                &self.state.key,
                Box::new(move |existing| {
                    let state = existing.ok_or(MutationError::Missing(key.clone()))?;
                    match state.phase {
                        KeyPhase::Queued if state.not_before > now => Err(MutationError::NotEligible {
                            key,
                            not_before: state.not_before,
                        }),
                        KeyPhase::Queued => Ok(Some(KeyState {
                            last_transition: now,
                            phase: KeyPhase::InProgress {
                                owner_id,
                                lease_expires_at,
                                requeue_on_complete: None,
                            },
                            ..state
                        })),
                        _ => Err(MutationError::Phase { key, expected: "queued" }),
                    }
                }),
            )
            .await?;
        // The mutation always writes a record back on success.
        let state = started.ok_or_else(|| QueueError::Conflict(self.state.key.clone()))?;
        debug!(key = %state.key, attempts = state.attempts, "started");
        Ok(OwnedKey {
            queue: self.queue.clone(),
            key: state.key,
            priority: state.priority,
            attempts: state.attempts,
        })
    }

    /// Make the key eligible immediately.
    pub async fn requeue(&self) -> Result<(), QueueError> {
        self.requeue_with_options(QueueOptions::default().with_priority(self.state.priority))
            .await
    }

    /// Merge `opts` into the queued record, as a fresh enqueue would.
    pub async fn requeue_with_options(&self, opts: QueueOptions) -> Result<(), QueueError> {
        self.queue.queue(&self.state.key, opts).await
    }
}

/// An in-progress key as seen by one enumeration (held by some worker,
/// possibly this one, possibly an orphan).
pub struct InProgressKey<B> {
    queue: WorkQueue<B>,
    state: KeyState,
    orphaned: bool,
}

impl<B: Backend> InProgressKey<B> {
    /// The work key.
    pub fn name(&self) -> &str {
        &self.state.key
    }

    /// The worker holding the lease.
    pub fn owner_id(&self) -> &str {
        match &self.state.phase {
            KeyPhase::InProgress { owner_id, .. } => owner_id,
            // Enumeration only constructs this wrapper for in-progress records.
            _ => "",
        }
    }

    /// The lease deadline observed at enumeration time.
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        match &self.state.phase {
            KeyPhase::InProgress { lease_expires_at, .. } => *lease_expires_at,
            _ => self.state.last_transition,
        }
    }

    /// Whether the lease had lapsed when the snapshot was taken.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    /// Recover an orphan: put the key back in the queued set, eligible
    /// immediately, counting the lapsed attempt. Refuses (with
    /// [`QueueError::Conflict`]) if the lease turns out to be live again
    /// or held by a different worker than observed.
    pub async fn requeue(&self) -> Result<(), QueueError> {
        let now = Utc::now();
        let key = self.state.key.clone();
        let observed_owner = self.owner_id().to_string();
        self.queue
            .inner
            .backend
            .update(
                &self.state.key,
                Box::new(move |existing| {
                    let state = existing.ok_or(MutationError::Missing(key.clone()))?;
                    match state.phase.clone() {
                        KeyPhase::InProgress {
                            owner_id,
                            lease_expires_at,
                            requeue_on_complete,
                        } => {
                            if owner_id != observed_owner {
                                return Err(MutationError::NotOwner { key, holder: owner_id });
                            }
                            if lease_expires_at >= now {
                                // The worker heartbeated after we enumerated.
                                return Err(MutationError::Phase { key, expected: "orphaned" });
                            }
                            let (priority, not_before) = match requeue_on_complete {
                                Some(pending) => {
                                    let merged = pending.merge(state.priority, now);
                                    (merged.priority, merged.not_before)
                                }
                                None => (state.priority, now),
                            };
                            Ok(Some(KeyState {
                                priority,
                                not_before,
                                attempts: state.attempts + 1,
                                last_transition: now,
                                phase: KeyPhase::Queued,
                                ..state
                            }))
                        }
                        _ => Err(MutationError::Phase { key, expected: "in-progress" }),
                    }
                }),
            )
            .await?;
        debug!(key = %self.state.key, "orphan requeued");
        Ok(())
    }
}

/// A dead-lettered key.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadletteredKey {
    key: String,
    attempts: u32,
    last_error: String,
    since: DateTime<Utc>,
}

impl DeadletteredKey {
    /// The work key.
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Attempts consumed before dead-lettering.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The error that sent the key here.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// When the key was dead-lettered.
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }
}

/// A started key, held under this worker's lease until one of the
/// consuming transitions runs.
pub struct OwnedKey<B> {
    queue: WorkQueue<B>,
    key: String,
    priority: i64,
    attempts: u32,
}

impl<B: Backend> OwnedKey<B> {
    /// The work key.
    pub fn name(&self) -> &str {
        &self.key
    }

    /// The key's priority at start time.
    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Attempts completed before this one started.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Extend the lease. Workers must call this at a cadence comfortably
    /// inside the configured lease duration.
    pub async fn extend_lease(&self) -> Result<(), QueueError> {
        let now = Utc::now();
        let deadline = self.queue.lease_deadline(now);
        self.mutate_owned(move |state, phase| match phase {
            KeyPhase::InProgress {
                owner_id,
                requeue_on_complete,
                ..
            } => Some(KeyState {
                phase: KeyPhase::InProgress {
                    owner_id,
                    lease_expires_at: deadline,
                    requeue_on_complete,
                },
                ..state
            }),
            // Unreachable: mutate_owned only forwards our own in-progress phase.
            other => Some(KeyState { phase: other, ..state }),
        })
        .await
    }

    /// The attempt succeeded: remove the record, or hand the key straight
    /// back to the queued set if a re-enqueue arrived while it ran.
    pub async fn complete(self) -> Result<(), QueueError> {
        let now = Utc::now();
        let result = self
            .mutate_owned(move |state, phase| match phase {
                KeyPhase::InProgress {
                    requeue_on_complete: Some(pending),
                    ..
                } => Some(KeyState {
                    priority: pending.priority,
                    not_before: pending.not_before,
                    attempts: 0,
                    last_transition: now,
                    phase: KeyPhase::Queued,
                    ..state
                }),
                _ => None,
            })
            .await;
        if result.is_ok() {
            debug!(key = %self.key, "completed");
        }
        result
    }

    /// The attempt failed: count it and reschedule with exponential
    /// backoff and jitter.
    pub async fn requeue(self) -> Result<(), QueueError> {
        let config = self.queue.config();
        let delay = retry_delay(config.backoff_base, config.backoff_cap, self.attempts);
        let now = Utc::now();
        let not_before = now + delay;
        let result = self
            .mutate_owned(move |state, phase| {
                let (priority, not_before) = match phase {
                    KeyPhase::InProgress {
                        requeue_on_complete: Some(pending),
                        ..
                    } => {
                        let merged = pending.merge(state.priority, not_before);
                        (merged.priority, merged.not_before)
                    }
                    _ => (state.priority, not_before),
                };
                Some(KeyState {
                    priority,
                    not_before,
                    attempts: state.attempts + 1,
                    last_transition: now,
                    phase: KeyPhase::Queued,
                    ..state
                })
            })
            .await;
        if result.is_ok() {
            debug!(key = %self.key, delay_ms = delay.as_millis() as u64, "requeued after failure");
        }
        result
    }

    /// Reschedule on explicit request (`RequeueAfter`): eligibility moves
    /// to `opts.not_before`, the attempt does not count.
    pub async fn requeue_with_options(self, opts: QueueOptions) -> Result<(), QueueError> {
        let now = Utc::now();
        let not_before = opts.not_before.unwrap_or(now);
        let priority = opts.priority;
        let result = self
            .mutate_owned(move |state, phase| {
                let requested = PendingRequeue {
                    priority: state.priority.max(priority),
                    not_before,
                };
                let merged = match phase {
                    KeyPhase::InProgress {
                        requeue_on_complete: Some(pending),
                        ..
                    } => pending.merge(requested.priority, requested.not_before),
                    _ => requested,
                };
                Some(KeyState {
                    priority: merged.priority,
                    not_before: merged.not_before,
                    last_transition: now,
                    phase: KeyPhase::Queued,
                    ..state
                })
            })
            .await;
        if result.is_ok() {
            debug!(key = %self.key, "requeued on request");
        }
        result
    }

    /// The attempt failed and retries are exhausted: move the record to
    /// the dead-letter set.
    pub async fn deadletter(self, last_error: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let last_error = last_error.to_string();
        let result = self
            .mutate_owned(move |state, _| {
                Some(KeyState {
                    attempts: state.attempts + 1,
                    last_transition: now,
                    phase: KeyPhase::Deadlettered { last_error },
                    ..state
                })
            })
            .await;
        if result.is_ok() {
            debug!(key = %self.key, "dead-lettered");
        }
        result
    }

    /// Run a transition that is only valid while this worker holds the
    /// lease. The closure receives the record and its (verified
    /// in-progress) phase and returns the replacement record, `None` to
    /// remove.
    async fn mutate_owned(
        &self,
        transition: impl FnOnce(KeyState, KeyPhase) -> Option<KeyState> + Send,
    ) -> Result<(), QueueError> {
        let key = self.key.clone();
        let owner = self.queue.inner.config.owner_id.clone();
        self.queue
            .inner
            .backend
            .update(
                &self.key,
                Box::new(move |existing| {
                    let state = existing.ok_or(MutationError::Missing(key.clone()))?;
                    match &state.phase {
                        KeyPhase::InProgress { owner_id, .. } if *owner_id == owner => {
                            let phase = state.phase.clone();
                            Ok(transition(state, phase))
                        }
                        KeyPhase::InProgress { owner_id, .. } => Err(MutationError::NotOwner {
                            key,
                            holder: owner_id.clone(),
                        }),
                        _ => Err(MutationError::Phase { key, expected: "in-progress" }),
                    }
                }),
            )
            .await?;
        Ok(())
    }
}
