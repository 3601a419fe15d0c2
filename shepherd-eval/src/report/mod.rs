//! Report rendering over a finished observer tree.
//!
//! Both renderers walk the tree through the [`Collect`] surface, compute
//! pass rates and grade averages per node, and compare them against a
//! threshold supplied at render time. All sibling iteration is pre-sorted
//! and numeric fields use fixed precision, so output is deterministic.

mod by_eval;
mod simple;

pub use by_eval::{ByEvalReport, ReportError};
pub use simple::SimpleReport;

use crate::{collector::Collect, observer::Grade};

/// Aggregated results for one node (or one pivot cell).
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Evaluations counted.
    pub total: u64,
    /// Failure messages recorded.
    pub failures: Vec<String>,
    /// Grades recorded.
    pub grades: Vec<Grade>,
}

impl Stats {
    /// Read a node's results.
    pub fn of<C: Collect>(collector: &C) -> Self {
        Self {
            total: collector.total(),
            failures: collector.failures(),
            grades: collector.grades(),
        }
    }

    /// Fold another set of results into this one.
    pub fn merge(&mut self, other: &Stats) {
        self.total += other.total;
        self.failures.extend(other.failures.iter().cloned());
        self.grades.extend(other.grades.iter().cloned());
    }

    /// Whether anything was recorded here at all.
    pub fn has_data(&self) -> bool {
        self.total > 0 || !self.failures.is_empty() || !self.grades.is_empty()
    }

    /// Fraction of evaluations that did not fail. `None` when nothing was
    /// counted and nothing failed; a failure with no counted evaluations
    /// reads as a zero pass rate.
    pub fn pass_rate(&self) -> Option<f64> {
        if self.total == 0 {
            if self.failures.is_empty() {
                None
            } else {
                Some(0.0)
            }
        } else {
            let failed = (self.failures.len() as u64).min(self.total);
            Some((self.total - failed) as f64 / self.total as f64)
        }
    }

    /// Mean grade score, when any grades were recorded.
    pub fn mean_grade(&self) -> Option<f64> {
        if self.grades.is_empty() {
            return None;
        }
        Some(self.grades.iter().map(|g| g.score).sum::<f64>() / self.grades.len() as f64)
    }

    /// Below threshold iff the pass rate is below it, or grades exist and
    /// their mean is below it.
    pub fn below(&self, threshold: f64) -> bool {
        if matches!(self.pass_rate(), Some(rate) if rate < threshold) {
            return true;
        }
        matches!(self.mean_grade(), Some(mean) if mean < threshold)
    }
}

/// `[97.5%, avg 0.42] (pass)`-style suffix for a node line; `None` when
/// the node has no data to report.
fn value_label(stats: &Stats, threshold: f64) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(rate) = stats.pass_rate() {
        parts.push(format!("{:.1}%", rate * 100.0));
    }
    if let Some(mean) = stats.mean_grade() {
        parts.push(format!("avg {mean:.2}"));
    }
    if parts.is_empty() {
        return None;
    }
    let label = if stats.below(threshold) { "fail" } else { "pass" };
    Some(format!("[{}] ({label})", parts.join(", ")))
}

/// Failure messages plus below-threshold grade reasons, one line each.
fn detail_lines(stats: &Stats, threshold: f64) -> Vec<String> {
    let mut lines: Vec<String> = stats.failures.iter().map(|msg| format!("failure: {msg}")).collect();
    for grade in &stats.grades {
        if grade.score < threshold {
            lines.push(format!("grade {:.2}: {}", grade.score, grade.reasoning));
        }
    }
    lines
}

/// One rendered tree line and its nested children.
struct TreeEntry {
    line: String,
    children: Vec<TreeEntry>,
}

impl TreeEntry {
    fn leaf(line: String) -> Self {
        Self { line, children: Vec::new() }
    }
}

/// Append `entries` to `out` with tree-drawing glyphs under `prefix`.
fn render_entries(out: &mut String, prefix: &str, entries: &[TreeEntry]) {
    for (index, entry) in entries.iter().enumerate() {
        let last = index + 1 == entries.len();
        out.push_str(prefix);
        out.push_str(if last { "└── " } else { "├── " });
        out.push_str(&entry.line);
        out.push('\n');
        let extended = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_entries(out, &extended, &entry.children);
    }
}
