//! Per-repository reconcile serialization.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use shepherd_core::RepoId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One exclusive lock per repository, created on first use.
///
/// Two concurrent reconciles of the same repository within one process
/// would race on clones and change state, so the runtime holds the
/// repository's lock for the duration of a reconcile. Waiters are served
/// in FIFO order.
#[derive(Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<RepoId, Arc<AsyncMutex<()>>>>,
}

impl RepoLocks {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `repo`, waiting behind earlier holders.
    pub async fn lock(&self, repo: &RepoId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(repo.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
