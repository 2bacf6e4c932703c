//! Test selection: exclusivity markers and title filtering
//!
//! Computed once before traversal. A test excluded by `only` is still
//! reported as pending; a test excluded by `grep` is not reported at all.

use crate::config::RunnerConfig;
use crate::models::{RunnableId, SuiteId, SuiteTree};

#[derive(Debug)]
pub(crate) struct Selection {
    /// Indexed by runnable id; false for hooks
    selected: Vec<bool>,
    hidden: Vec<bool>,
    /// Per suite: tests in the subtree that will actually execute
    runnable: Vec<usize>,
    /// Per suite: tests in the subtree that are reported at all
    visible: Vec<usize>,
}

impl Selection {
    pub fn compute(tree: &SuiteTree, config: &RunnerConfig) -> Self {
        let tests = tree.tests();
        let mut selection = Self {
            selected: vec![false; tree.runnable_count()],
            hidden: vec![false; tree.runnable_count()],
            runnable: vec![0; tree.suite_count()],
            visible: vec![0; tree.suite_count()],
        };

        let root = tree.root();
        let enabled = !tree.has_only() || tree.suite(root).is_only();
        selection.mark(tree, root, enabled);

        if let Some(pattern) = &config.grep {
            for id in &tests {
                let matches = tree.full_title(*id).contains(pattern.as_str());
                selection.hidden[id.index()] = matches == config.invert;
            }
        }

        selection.count(tree, root, false);
        selection
    }

    fn mark(&mut self, tree: &SuiteTree, id: SuiteId, enabled: bool) {
        let suite = tree.suite(id);
        if has_only_inside(tree, id) {
            for test in suite.tests() {
                self.selected[test.index()] = tree.runnable(*test).is_only();
            }
            for child in suite.suites() {
                self.mark(tree, *child, tree.suite(*child).is_only());
            }
        } else {
            for test in suite.tests() {
                self.selected[test.index()] = enabled;
            }
            for child in suite.suites() {
                self.mark(tree, *child, enabled);
            }
        }
    }

    fn count(&mut self, tree: &SuiteTree, id: SuiteId, pending: bool) -> (usize, usize) {
        let suite = tree.suite(id);
        let pending = pending || suite.is_pending();
        let mut runnable = 0;
        let mut visible = 0;

        for test in suite.tests() {
            if self.is_hidden(*test) {
                continue;
            }
            visible += 1;
            if !pending && self.is_selected(*test) && !tree.runnable(*test).is_pending() {
                runnable += 1;
            }
        }
        for child in suite.suites() {
            let (r, v) = self.count(tree, *child, pending);
            runnable += r;
            visible += v;
        }

        self.runnable[id.index()] = runnable;
        self.visible[id.index()] = visible;
        (runnable, visible)
    }

    pub fn is_selected(&self, id: RunnableId) -> bool {
        self.selected.get(id.index()).copied().unwrap_or(false)
    }

    pub fn is_hidden(&self, id: RunnableId) -> bool {
        self.hidden.get(id.index()).copied().unwrap_or(false)
    }

    /// Tests under `id` that will execute
    pub fn runnable_in(&self, id: SuiteId) -> usize {
        self.runnable.get(id.index()).copied().unwrap_or(0)
    }

    /// Tests under `id` that will be reported
    pub fn visible_in(&self, id: SuiteId) -> usize {
        self.visible.get(id.index()).copied().unwrap_or(0)
    }
}

/// Exclusive marks strictly below `id`
fn has_only_inside(tree: &SuiteTree, id: SuiteId) -> bool {
    let suite = tree.suite(id);
    suite.tests().iter().any(|t| tree.runnable(*t).is_only())
        || suite
            .suites()
            .iter()
            .any(|c| tree.suite(*c).is_only() || has_only_inside(tree, *c))
}
