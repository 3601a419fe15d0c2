//! Observers and the namespaced observer tree.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A sink for evaluation events.
///
/// One evaluation is expected to record at most one `fail` and at most one
/// `grade`, and to `increment` once; `total` reports how many evaluations
/// the sink has seen.
pub trait Observe: Send + Sync {
    /// Record a failure.
    fn fail(&self, msg: &str);
    /// Free-form annotation.
    fn log(&self, msg: &str);
    /// Record a grade.
    fn grade(&self, score: f64, reasoning: &str);
    /// Count an evaluation.
    fn increment(&self);
    /// Evaluations counted so far.
    fn total(&self) -> u64;
}

/// A score in `[-1, 1]` with the reasoning behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    /// The score, clamped to `[-1, 1]` at construction.
    pub score: f64,
    /// Why the grader chose this score.
    pub reasoning: String,
}

impl Grade {
    /// A grade with `score` clamped into `[-1, 1]`.
    pub fn new(score: f64, reasoning: impl Into<String>) -> Self {
        Self {
            score: score.clamp(-1.0, 1.0),
            reasoning: reasoning.into(),
        }
    }
}

/// An [`Observe`] that emits events as tracing logs and counts evaluations.
#[derive(Debug, Default)]
pub struct LogObserver {
    evaluations: AtomicU64,
}

impl Observe for LogObserver {
    fn fail(&self, msg: &str) {
        warn!(msg, "evaluation failed");
    }

    fn log(&self, msg: &str) {
        info!(msg, "evaluation note");
    }

    fn grade(&self, score: f64, reasoning: &str) {
        debug!(score, reasoning, "evaluation graded");
    }

    fn increment(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}

struct Node<O> {
    path: String,
    inner: O,
    children: Mutex<BTreeMap<String, Arc<Node<O>>>>,
}

/// A tree of observers with slash-joined names, rooted at `/`.
///
/// [`NamespacedObserver::child`] is idempotent and thread-safe: asking for
/// the same child twice returns a handle to the same node. Handles are
/// cheap to clone.
///
/// Concurrent mutation during [`walk`](NamespacedObserver::walk) is
/// allowed: each node's child list is snapshotted under a short lock which
/// is released before recursing, so a walker sees children added before
/// its visit of the parent and may or may not see later additions.
pub struct NamespacedObserver<O> {
    node: Arc<Node<O>>,
    make: Arc<dyn Fn() -> O + Send + Sync>,
}

impl<O> Clone for NamespacedObserver<O> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            make: Arc::clone(&self.make),
        }
    }
}

impl<O: Observe> NamespacedObserver<O> {
    /// A root node whose observers are built by `make`.
    pub fn root_with(make: impl Fn() -> O + Send + Sync + 'static) -> Self {
        let node = Arc::new(Node {
            path: "/".to_string(),
            inner: make(),
            children: Mutex::new(BTreeMap::new()),
        });
        Self {
            node,
            make: Arc::new(make),
        }
    }

    /// A root node using `O::default()` for every observer.
    pub fn root() -> Self
    where
        O: Default + 'static,
    {
        Self::root_with(O::default)
    }

    /// The node's slash-joined name (the root is `/`).
    pub fn name(&self) -> &str {
        &self.node.path
    }

    /// The node's own observer.
    pub fn observer(&self) -> &O {
        &self.node.inner
    }

    /// The child called `name`, created on first access.
    ///
    /// A name containing slashes descends one level per segment, so
    /// `child("a/b")` is `child("a").child("b")`; empty segments are
    /// skipped.
    pub fn child(&self, name: &str) -> Self {
        let mut current = self.clone();
        for segment in name.split('/').filter(|s| !s.is_empty()) {
            current = current.child_segment(segment);
        }
        current
    }

    fn child_segment(&self, segment: &str) -> Self {
        let mut children = self.node.children.lock();
        let node = children
            .entry(segment.to_string())
            .or_insert_with(|| {
                let path = if self.node.path == "/" {
                    format!("/{segment}")
                } else {
                    format!("{}/{segment}", self.node.path)
                };
                Arc::new(Node {
                    path,
                    inner: (self.make)(),
                    children: Mutex::new(BTreeMap::new()),
                })
            })
            .clone();
        drop(children);
        Self {
            node,
            make: Arc::clone(&self.make),
        }
    }

    /// Snapshot of the node's direct children in lexicographic name order.
    pub fn children(&self) -> Vec<Self> {
        self.node
            .children
            .lock()
            .values()
            .map(|node| Self {
                node: Arc::clone(node),
                make: Arc::clone(&self.make),
            })
            .collect()
    }

    /// Pre-order traversal: the node itself first, then each subtree with
    /// children in lexicographic name order.
    pub fn walk(&self, visitor: &mut impl FnMut(&str, &O)) {
        visitor(&self.node.path, &self.node.inner);
        for child in self.children() {
            child.walk(visitor);
        }
    }
}

impl<O: Observe> Observe for NamespacedObserver<O> {
    fn fail(&self, msg: &str) {
        self.node.inner.fail(msg);
    }

    fn log(&self, msg: &str) {
        self.node.inner.log(msg);
    }

    fn grade(&self, score: f64, reasoning: &str) {
        self.node.inner.grade(score, reasoning);
    }

    fn increment(&self) {
        self.node.inner.increment();
    }

    fn total(&self) -> u64 {
        self.node.inner.total()
    }
}
