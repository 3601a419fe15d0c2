//! Accumulating observer wrapper used by the report renderers.

use parking_lot::Mutex;

use crate::observer::{Grade, LogObserver, Observe};

/// An observer whose recorded failures and grades can be read back.
pub trait Collect: Observe {
    /// Copies of the recorded failure messages.
    fn failures(&self) -> Vec<String>;
    /// Copies of the recorded grades.
    fn grades(&self) -> Vec<Grade>;
}

/// Wraps an observer and accumulates results for later reporting.
///
/// A `fail` is *logged* to the inner observer rather than failed, so the
/// wrapped sink never aborts anything; the message is kept here instead.
/// Grades pass through and are kept as well.
#[derive(Default)]
pub struct ResultCollector<O = LogObserver> {
    inner: O,
    failures: Mutex<Vec<String>>,
    grades: Mutex<Vec<Grade>>,
}

impl<O: Observe> ResultCollector<O> {
    /// Collect around an explicit inner observer.
    pub fn wrapping(inner: O) -> Self {
        Self {
            inner,
            failures: Mutex::new(Vec::new()),
            grades: Mutex::new(Vec::new()),
        }
    }
}

impl<O: Observe> Observe for ResultCollector<O> {
    fn fail(&self, msg: &str) {
        self.inner.log(msg);
        self.failures.lock().push(msg.to_string());
    }

    fn log(&self, msg: &str) {
        self.inner.log(msg);
    }

    fn grade(&self, score: f64, reasoning: &str) {
        self.inner.grade(score, reasoning);
        self.grades.lock().push(Grade::new(score, reasoning));
    }

    fn increment(&self) {
        self.inner.increment();
    }

    fn total(&self) -> u64 {
        self.inner.total()
    }
}

impl<O: Observe> Collect for ResultCollector<O> {
    fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    fn grades(&self) -> Vec<Grade> {
        self.grades.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{Collect, ResultCollector};
    use crate::observer::{LogObserver, Observe};

    #[test]
    fn fail_accumulates_without_failing_the_inner_observer() {
        let collector = ResultCollector::<LogObserver>::default();
        collector.increment();
        collector.fail("widget misbehaved");
        collector.fail("gadget misbehaved");

        assert_eq!(collector.failures(), vec!["widget misbehaved", "gadget misbehaved"]);
        assert_eq!(collector.total(), 1);
    }

    #[test]
    fn grades_pass_through_and_accumulate() {
        let collector = ResultCollector::<LogObserver>::default();
        collector.grade(0.5, "partially correct");
        collector.grade(2.0, "clamped");

        let grades = collector.grades();
        assert_eq!(grades.len(), 2);
        assert_eq!(grades[0].score, 0.5);
        assert_eq!(grades[1].score, 1.0);
    }

    #[test]
    fn accessors_return_copies() {
        let collector = ResultCollector::<LogObserver>::default();
        collector.fail("once");
        let mut copy = collector.failures();
        copy.push("tampered".into());
        assert_eq!(collector.failures(), vec!["once"]);
    }
}
