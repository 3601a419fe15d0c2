//! Offline evaluation support: observer trees, reconcile traces and reports.
//!
//! Evaluations exercise reconciler components over many inputs and need
//! their outcomes aggregated across a categorization hierarchy (typically
//! model / test case / eval). The [`NamespacedObserver`] tree collects
//! those outcomes, [`Trace`] records what each reconcile attempt actually
//! did, and the [`report`] renderers turn a finished tree into something a
//! human can act on.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod collector;
mod observer;
pub mod report;
mod trace;

pub use collector::{Collect, ResultCollector};
pub use observer::{Grade, LogObserver, NamespacedObserver, Observe};
pub use trace::{ToolCall, ToolCallId, Trace, TraceId, TraceSink};
