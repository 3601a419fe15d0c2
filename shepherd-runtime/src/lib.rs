//! Dispatcher and reconciler runtime.
//!
//! The [`Dispatcher`] turns queued work into bounded concurrent
//! invocations of a [`Processor`] and translates each verdict back into a
//! queue transition. The [`ReconcilerRuntime`] is the canonical processor:
//! it parses the work key into a typed resource, serializes reconciles per
//! repository, binds an authenticated client, and runs user-supplied
//! reconcile logic.
//!
//! GitHub and git I/O stay behind narrow capability traits
//! ([`client::ClientCache`], [`clone_pool::WorkingTree`],
//! [`change::ChangeSession`]) so the runtime itself never speaks HTTP.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod change;
pub mod client;
pub mod clone_pool;
pub mod dispatcher;
pub mod processor;
pub mod reconciler;
mod repo_lock;

pub use client::{ClientCache, ClientError, TokenSource};
pub use dispatcher::{CycleOutcome, DispatchError, Dispatcher, PulseHandle};
pub use processor::Processor;
pub use reconciler::{FnReconcile, Reconcile, ReconcilerRuntime};
pub use repo_lock::RepoLocks;
