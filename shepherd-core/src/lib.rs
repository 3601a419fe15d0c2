//! Core types for the shepherd reconciliation platform.
//!
//! A unit of work is identified by an opaque string key. Producers submit
//! keys (with [`QueueOptions`]) to the work queue, the dispatcher hands them
//! to a processor, and the processor's verdict travels back as an
//! [`Action`] or a [`ReconcileError`]. This crate holds those shared
//! vocabulary types plus the strict parser that turns GitHub-shaped keys
//! into typed [`Resource`]s.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod action;
pub mod key;
pub mod options;

pub use action::{Action, ReconcileError};
pub use key::{ParseKeyError, RepoId, Resource};
pub use options::{EnqueueRequest, ProcessRequest, ProcessResponse, QueueKeyRequest, QueueOptions};
