//! Durable, priority-aware work queue.
//!
//! Keys move through a three-state machine (queued, in-progress,
//! dead-lettered) persisted behind the [`Backend`] contract. The queue
//! provides priority ordering with delayed visibility, heartbeat leases
//! with orphan detection, bounded retries with jittered backoff, and
//! dedup/merge semantics on re-enqueue.
//!
//! The [`WorkQueue`] itself holds no state: every transition is a single
//! transactional read-modify-write against the backend, which is what makes
//! it safe to run several dispatcher replicas over one store.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod backend;
mod backoff;
mod memory;
mod queue;

pub use backend::{Backend, BackendError, KeyPhase, KeyState, Mutation, MutationError, PendingRequeue};
pub use memory::MemoryBackend;
pub use queue::{
    DeadletteredKey, Enumeration, InProgressKey, OwnedKey, QueueConfig, QueueError, QueuedKey, WorkQueue,
};
