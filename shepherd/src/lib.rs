//! shepherd: reconcile external GitHub resources to a desired state.
//!
//! A producer enqueues URL-shaped work keys onto a durable, priority-aware
//! [`queue`]; the [`runtime`] dispatcher drives each key through a
//! processor under concurrency budgets, heartbeat leases and bounded
//! retries; the reconciler runtime parses keys into typed resources and
//! runs user-supplied reconcile logic against an authenticated client.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shepherd::core::{Action, QueueOptions, ReconcileError, RepoId, Resource};
//! use shepherd::queue::{MemoryBackend, WorkQueue};
//! use shepherd::runtime::{
//!     client::MemoizedClients, ClientError, Dispatcher, FnReconcile, ReconcilerRuntime,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = WorkQueue::new(MemoryBackend::new());
//!     queue
//!         .queue(
//!             "https://github.com/octo/widgets/pull/42",
//!             QueueOptions::default().with_priority(5),
//!         )
//!         .await?;
//!
//!     let clients = MemoizedClients::new(|repo: RepoId| async move {
//!         // Bind a real GitHub client here.
//!         Ok::<_, ClientError>(Arc::new(repo))
//!     });
//!     let runtime = ReconcilerRuntime::new(
//!         FnReconcile::new(|resource: Resource, _client: Arc<RepoId>| async move {
//!             println!("reconciling {resource}");
//!             Ok::<_, ReconcileError>(Action::done())
//!         }),
//!         clients,
//!     );
//!
//!     Dispatcher::new(queue, runtime)
//!         .concurrency(8)
//!         .run(std::future::pending())
//!         .await;
//!     Ok(())
//! }
//! ```

/// Shared vocabulary: keys, resources, options, actions and errors.
pub mod core {
    pub use shepherd_core::*;
}

/// The durable work queue and its backend contract.
#[cfg(feature = "queue")]
pub mod queue {
    pub use shepherd_queue::*;
}

/// Dispatcher, reconciler runtime and the GitHub-facing capabilities.
#[cfg(feature = "runtime")]
pub mod runtime {
    pub use shepherd_runtime::*;
}

/// Observer trees, traces and evaluation reports.
#[cfg(feature = "eval")]
pub mod eval {
    pub use shepherd_eval::*;
}

#[doc(inline)] pub use crate::core::{Action, QueueOptions, ReconcileError, Resource};
#[cfg(feature = "queue")]
#[doc(inline)]
pub use crate::queue::WorkQueue;
#[cfg(feature = "runtime")]
#[doc(inline)]
pub use crate::runtime::{Dispatcher, ReconcilerRuntime};
