//! The in-process reconciler runtime.
//!
//! Turns a [`ProcessRequest`] into one invocation of user-supplied
//! reconcile logic: parse the key into a [`Resource`], serialize on the
//! repository, bind a client, run the reconciler, translate its
//! [`Action`] into the wire response.

use async_trait::async_trait;
use shepherd_core::{Action, ProcessRequest, ProcessResponse, ReconcileError, Resource};
use tracing::{info_span, Instrument};

use crate::{client::ClientCache, processor::Processor, repo_lock::RepoLocks};

/// User-supplied reconcile logic.
///
/// Implementations drive the external resource toward its desired state
/// and report how the attempt ended. They must be idempotent: the same
/// resource may be reconciled many times, including concurrently across
/// processes (though never concurrently within one process for the same
/// repository).
#[async_trait]
pub trait Reconcile<C>: Send + Sync {
    /// Reconcile `resource` using `client`.
    async fn reconcile(&self, resource: Resource, client: C) -> Result<Action, ReconcileError>;
}

/// Adapts an async closure into a [`Reconcile`] implementation.
pub struct FnReconcile<F>(F);

impl<F> FnReconcile<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<C, F, Fut> Reconcile<C> for FnReconcile<F>
where
    C: Send + Sync + 'static,
    F: Fn(Resource, C) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Action, ReconcileError>> + Send,
{
    async fn reconcile(&self, resource: Resource, client: C) -> Result<Action, ReconcileError> {
        (self.0)(resource, client).await
    }
}

/// The canonical [`Processor`]: key parsing, per-repository serialization,
/// client binding and outcome translation around a [`Reconcile`]r.
pub struct ReconcilerRuntime<R, K> {
    reconciler: R,
    clients: K,
    locks: RepoLocks,
}

impl<R, K> ReconcilerRuntime<R, K> {
    /// A runtime dispatching into `reconciler` with clients from `clients`.
    pub fn new(reconciler: R, clients: K) -> Self {
        Self {
            reconciler,
            clients,
            locks: RepoLocks::new(),
        }
    }
}

#[async_trait]
impl<R, K> Processor for ReconcilerRuntime<R, K>
where
    K: ClientCache,
    R: Reconcile<K::Client> + 'static,
{
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ReconcileError> {
        let resource = request
            .key
            .parse::<Resource>()
            .map_err(|err| ReconcileError::non_retriable(err.to_string()))?;
        let repo = resource.repo_id();
        let span = info_span!(
            "reconciling resource",
            key = %request.key,
            repo = %repo,
            attempts = request.attempts,
        );
        async {
            let _serialized = self.locks.lock(&repo).await;
            let client = self.clients.client_for(&repo).await.map_err(ReconcileError::failed)?;
            let action = self.reconciler.reconcile(resource, client).await?;
            Ok(action.into_response())
        }
        .instrument(span)
        .await
    }
}
