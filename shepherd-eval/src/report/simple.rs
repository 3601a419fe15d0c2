//! Flat hierarchical report: the tree as recorded, annotated per node.

use crate::{collector::Collect, observer::NamespacedObserver};

use super::{detail_lines, render_entries, value_label, Stats, TreeEntry};

/// Renders the observer tree as recorded: every node with results gets a
/// pass rate (and grade average when grades exist) against the threshold,
/// with failure messages and below-threshold grades as child lines.
#[derive(Debug, Clone, Copy)]
pub struct SimpleReport {
    threshold: f64,
}

impl SimpleReport {
    /// A report judging nodes against `threshold`.
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Render the tree rooted at `root`.
    pub fn render<C: Collect>(&self, root: &NamespacedObserver<C>) -> String {
        let entry = self.entry_for(root);
        let mut out = String::new();
        out.push_str(&entry.line);
        out.push('\n');
        render_entries(&mut out, "", &entry.children);
        out
    }

    fn entry_for<C: Collect>(&self, node: &NamespacedObserver<C>) -> TreeEntry {
        let stats = Stats::of(node.observer());
        let name = match node.name().rsplit('/').next() {
            Some(segment) if !segment.is_empty() => segment.to_string(),
            _ => "/".to_string(),
        };
        let line = match value_label(&stats, self.threshold) {
            Some(value) => format!("{name} {value}"),
            None => name,
        };
        let mut children: Vec<TreeEntry> = detail_lines(&stats, self.threshold)
            .into_iter()
            .map(TreeEntry::leaf)
            .collect();
        children.extend(node.children().iter().map(|child| self.entry_for(child)));
        TreeEntry { line, children }
    }
}
