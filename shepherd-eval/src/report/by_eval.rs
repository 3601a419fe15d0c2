//! Eval-first pivot report in Markdown.
//!
//! Requires every recorded path to match `/{model}/{testcase}/{eval}`.
//! The tree is pivoted to group by eval, then model, then test case: a
//! summary table with one row per eval and one column per model (plus
//! `Average`), followed by a failure-detail tree for each eval with
//! below-threshold cells.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::{collector::Collect, observer::NamespacedObserver};

use super::{detail_lines, render_entries, value_label, Stats, TreeEntry};

/// Rendering failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    /// A node with results sat outside the three-level hierarchy.
    #[error("observer path {0} does not match /{{model}}/{{testcase}}/{{eval}}")]
    MalformedPath(String),
}

#[derive(Default)]
struct Cell {
    stats: Stats,
    testcases: BTreeMap<String, Stats>,
}

/// Markdown pivot report grouped by eval.
#[derive(Debug, Clone, Copy)]
pub struct ByEvalReport {
    threshold: f64,
}

impl ByEvalReport {
    /// A report judging cells against `threshold`.
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Render the tree rooted at `root`.
    pub fn render<C: Collect>(&self, root: &NamespacedObserver<C>) -> Result<String, ReportError> {
        let (models, evals) = collect_cells(root)?;

        let mut out = String::new();
        out.push_str("| Eval |");
        for model in &models {
            out.push_str(&format!(" {model} |"));
        }
        out.push_str(" Average |\n|---|");
        for _ in 0..=models.len() {
            out.push_str("---|");
        }
        out.push('\n');

        for (eval, cells) in &evals {
            out.push_str(&format!("| {eval} |"));
            let mut combined = Stats::default();
            for model in &models {
                match cells.get(model) {
                    Some(cell) => {
                        combined.merge(&cell.stats);
                        out.push_str(&format!(" {} |", self.cell_text(&cell.stats)));
                    }
                    None => out.push_str(" — |"),
                }
            }
            out.push_str(&format!(" {} |\n", self.cell_text(&combined)));
        }

        for (eval, cells) in &evals {
            let mut rows = Vec::new();
            for (model, cell) in cells {
                for (testcase, stats) in &cell.testcases {
                    if stats.below(self.threshold) {
                        let line = match value_label(stats, self.threshold) {
                            Some(value) => format!("{model}/{testcase} {value}"),
                            None => format!("{model}/{testcase}"),
                        };
                        let children = detail_lines(stats, self.threshold)
                            .into_iter()
                            .map(TreeEntry::leaf)
                            .collect();
                        rows.push(TreeEntry { line, children });
                    }
                }
            }
            if !rows.is_empty() {
                out.push_str(&format!("\n{eval}\n"));
                render_entries(&mut out, "", &rows);
            }
        }

        Ok(out)
    }

    fn cell_text(&self, stats: &Stats) -> String {
        let mut parts = Vec::new();
        if let Some(rate) = stats.pass_rate() {
            parts.push(format!("{:.1}%", rate * 100.0));
        }
        if let Some(mean) = stats.mean_grade() {
            parts.push(format!("avg {mean:.2}"));
        }
        if parts.is_empty() {
            return "—".to_string();
        }
        let mut text = parts.join(", ");
        if stats.below(self.threshold) {
            text.push_str(" ✗");
        }
        text
    }
}

type Cells = BTreeMap<String, BTreeMap<String, Cell>>;

fn collect_cells<C: Collect>(
    root: &NamespacedObserver<C>,
) -> Result<(BTreeSet<String>, Cells), ReportError> {
    if Stats::of(root.observer()).has_data() {
        return Err(ReportError::MalformedPath(root.name().to_string()));
    }
    let mut models = BTreeSet::new();
    let mut evals: Cells = BTreeMap::new();
    for model_node in root.children() {
        if Stats::of(model_node.observer()).has_data() {
            return Err(ReportError::MalformedPath(model_node.name().to_string()));
        }
        let model = leaf_name(&model_node);
        models.insert(model.clone());
        for tc_node in model_node.children() {
            if Stats::of(tc_node.observer()).has_data() {
                return Err(ReportError::MalformedPath(tc_node.name().to_string()));
            }
            let testcase = leaf_name(&tc_node);
            for eval_node in tc_node.children() {
                if let Some(deeper) = eval_node.children().first() {
                    return Err(ReportError::MalformedPath(deeper.name().to_string()));
                }
                let stats = Stats::of(eval_node.observer());
                let cell = evals
                    .entry(leaf_name(&eval_node))
                    .or_default()
                    .entry(model.clone())
                    .or_default();
                cell.stats.merge(&stats);
                cell.testcases.insert(testcase.clone(), stats);
            }
        }
    }
    Ok((models, evals))
}

fn leaf_name<C: Collect>(node: &NamespacedObserver<C>) -> String {
    match node.name().rsplit('/').next() {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{ByEvalReport, ReportError};
    use crate::{
        collector::ResultCollector,
        observer::{NamespacedObserver, Observe},
    };

    fn scenario_tree() -> NamespacedObserver<ResultCollector> {
        let root = NamespacedObserver::<ResultCollector>::root();
        let eval_a = root.child("m1/tc1/evalA");
        eval_a.fail("flaky widget");
        eval_a.grade(0.5, "partially correct");
        let eval_b = root.child("m1/tc1/evalB");
        eval_b.increment();
        root
    }

    #[test]
    fn pivots_into_a_summary_table_with_average_column() {
        let report = ByEvalReport::new(0.8).render(&scenario_tree()).unwrap();
        let mut lines = report.lines();
        assert_eq!(lines.next(), Some("| Eval | m1 | Average |"));
        assert_eq!(lines.next(), Some("|---|---|---|"));
        assert_eq!(lines.next(), Some("| evalA | 0.0%, avg 0.50 ✗ | 0.0%, avg 0.50 ✗ |"));
        assert_eq!(lines.next(), Some("| evalB | 100.0% | 100.0% |"));
    }

    #[test]
    fn failing_cells_get_a_detail_tree() {
        let report = ByEvalReport::new(0.8).render(&scenario_tree()).unwrap();
        let expected_section = "\
evalA
└── m1/tc1 [0.0%, avg 0.50] (fail)
    ├── failure: flaky widget
    └── grade 0.50: partially correct
";
        assert!(report.contains(expected_section), "report was:\n{report}");
        assert!(!report.contains("\nevalB\n"), "passing eval should have no section");
    }

    #[test]
    fn missing_model_cells_render_as_dashes() {
        let root = NamespacedObserver::<ResultCollector>::root();
        root.child("m1/tc1/evalA").increment();
        let eval_on_m2 = root.child("m2/tc1/evalB");
        eval_on_m2.increment();
        eval_on_m2.fail("broke");

        let report = ByEvalReport::new(0.8).render(&root).unwrap();
        assert!(report.contains("| evalA | 100.0% | — | 100.0% |"));
        assert!(report.contains("| evalB | — | 0.0% ✗ | 0.0% ✗ |"));
    }

    #[test]
    fn aggregates_across_test_cases_within_a_cell() {
        let root = NamespacedObserver::<ResultCollector>::root();
        for tc in ["tc1", "tc2", "tc3", "tc4"] {
            let eval = root.child(&format!("m1/{tc}/evalA"));
            eval.increment();
        }
        root.child("m1/tc4/evalA").fail("one of four failed");

        let report = ByEvalReport::new(0.8).render(&root).unwrap();
        assert!(report.contains("| evalA | 75.0% ✗ | 75.0% ✗ |"));
        assert!(report.contains("└── m1/tc4 [0.0%] (fail)"));
    }

    #[test]
    fn results_off_the_hierarchy_are_rejected() {
        let root = NamespacedObserver::<ResultCollector>::root();
        root.child("m1/tc1").increment();
        assert_eq!(
            ByEvalReport::new(0.8).render(&root),
            Err(ReportError::MalformedPath("/m1/tc1".into()))
        );

        let root = NamespacedObserver::<ResultCollector>::root();
        root.child("m1/tc1/evalA/extra").increment();
        assert_eq!(
            ByEvalReport::new(0.8).render(&root),
            Err(ReportError::MalformedPath("/m1/tc1/evalA/extra".into()))
        );
    }
}
