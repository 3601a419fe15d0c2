//! Pooled repository clones.
//!
//! Hydrating a clone is the most expensive part of a path reconcile, so
//! working trees are pooled. The pool is strictly FIFO: returned clones go
//! to the back of the free list and acquisition pops the front, so one
//! broken clone cannot be handed out over and over while healthy ones sit
//! idle. Trees are reset at lease time, not at return time, keeping the
//! return path synchronous.

use std::{collections::VecDeque, path::Path, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Clone and worktree failures.
#[derive(Debug, Error)]
pub enum CloneError {
    /// A git operation failed.
    #[error("git operation failed")]
    Git(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The requested ref does not exist.
    #[error("ref {0} not found")]
    RefNotFound(String),
}

impl CloneError {
    /// Wrap an underlying git failure.
    pub fn git(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        CloneError::Git(err.into())
    }
}

/// A change to apply inside a scratch worktree before committing.
pub type TreeMutation = Box<dyn FnOnce(&Path) -> std::io::Result<()> + Send>;

/// The git surface a pooled clone needs.
///
/// Implementations own one on-disk clone. All methods take `&mut self`:
/// a tree is only ever used by the lease currently holding it.
#[async_trait]
pub trait WorkingTree: Send + 'static {
    /// Return the tree to a pristine state between leases.
    async fn reset(&mut self) -> Result<(), CloneError>;

    /// Check out `git_ref`, returning the commit sha it resolved to.
    async fn checkout(&mut self, git_ref: &str) -> Result<String, CloneError>;

    /// Whether `path` exists in the checked-out tree.
    fn contains(&self, path: &str) -> bool;

    /// Apply `mutation` in a scratch worktree, create a signed commit on
    /// `branch`, force-push it, and return the new commit sha.
    async fn commit_and_push(
        &mut self,
        branch: &str,
        message: &str,
        mutation: TreeMutation,
    ) -> Result<String, CloneError>;
}

struct Shared<T> {
    free: Mutex<VecDeque<T>>,
    returned: Notify,
}

/// A FIFO pool of pre-hydrated working trees.
#[derive(Clone)]
pub struct ClonePool<T> {
    shared: Arc<Shared<T>>,
}

impl<T: WorkingTree> ClonePool<T> {
    /// A pool over `trees`.
    pub fn new(trees: impl IntoIterator<Item = T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(trees.into_iter().collect()),
                returned: Notify::new(),
            }),
        }
    }

    /// Lease a tree checked out at `git_ref`, waiting for a return when
    /// the pool is empty. A tree that fails to reset or check out goes to
    /// the back of the pool and the error surfaces to the caller.
    pub async fn lease(&self, git_ref: &str) -> Result<CloneLease<T>, CloneError> {
        let mut tree = loop {
            if let Some(tree) = self.shared.free.lock().pop_front() {
                break tree;
            }
            self.shared.returned.notified().await;
        };
        if let Err(err) = tree.reset().await {
            self.release(tree);
            return Err(err);
        }
        match tree.checkout(git_ref).await {
            Ok(head_sha) => {
                debug!(git_ref, %head_sha, "leased clone");
                Ok(CloneLease {
                    tree: Some(tree),
                    head_sha,
                    shared: Arc::clone(&self.shared),
                })
            }
            Err(err) => {
                self.release(tree);
                Err(err)
            }
        }
    }

    fn release(&self, tree: T) {
        self.shared.free.lock().push_back(tree);
        self.shared.returned.notify_one();
    }
}

/// An exclusive hold on one pooled working tree.
///
/// Dropping the lease returns the tree to the back of the pool.
pub struct CloneLease<T: WorkingTree> {
    tree: Option<T>,
    head_sha: String,
    shared: Arc<Shared<T>>,
}

impl<T: WorkingTree> CloneLease<T> {
    /// The commit the leased ref resolved to.
    pub fn head_sha(&self) -> &str {
        &self.head_sha
    }

    /// Whether `path` exists in the checked-out tree.
    pub fn contains(&self, path: &str) -> bool {
        match &self.tree {
            Some(tree) => tree.contains(path),
            None => false,
        }
    }

    /// Apply `mutation` in a scratch worktree, commit it to `branch`
    /// (signed) and force-push. Returns the pushed commit sha.
    pub async fn commit_and_push(
        &mut self,
        branch: &str,
        message: &str,
        mutation: TreeMutation,
    ) -> Result<String, CloneError> {
        match &mut self.tree {
            Some(tree) => tree.commit_and_push(branch, message, mutation).await,
            // The tree is only absent after drop, which consumes self.
            None => Err(CloneError::git("lease already released")),
        }
    }
}

impl<T: WorkingTree> Drop for CloneLease<T> {
    fn drop(&mut self) {
        if let Some(tree) = self.tree.take() {
            self.shared.free.lock().push_back(tree);
            self.shared.returned.notify_one();
        }
    }
}
