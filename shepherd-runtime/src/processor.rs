//! The processing seam between the dispatcher and whatever executes work.

use async_trait::async_trait;
use shepherd_core::{ProcessRequest, ProcessResponse, ReconcileError};

/// Executes one work item and reports the verdict.
///
/// Implementations may run in-process (see
/// [`ReconcilerRuntime`](crate::ReconcilerRuntime)) or proxy the request
/// over RPC; the dispatcher only sees the message shapes. A transport that
/// carries a non-retriable marker should surface it as
/// [`ReconcileError::NonRetriable`], everything else is treated as
/// retriable failure.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Run one attempt for `request.key`.
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ReconcileError>;
}

#[async_trait]
impl<P: Processor> Processor for std::sync::Arc<P> {
    async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse, ReconcileError> {
        (**self).process(request).await
    }
}
