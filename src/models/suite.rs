//! Suite tree
//!
//! Suites and runnables live in one arena owned by [`SuiteTree`]. Children are
//! held by index in their parent; the parent link is a plain index, so the
//! tree has a single ownership edge per node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::runnable::{HookKind, Runnable, RunnableId, RunnableKind};
use crate::executor::Body;

/// Index of a suite inside its [`SuiteTree`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SuiteId(pub(crate) usize);

impl SuiteId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Hook lists of a suite, each in registration order
#[derive(Clone, Debug, Default)]
pub struct Hooks {
    pub before_all: Vec<RunnableId>,
    pub after_all: Vec<RunnableId>,
    pub before_each: Vec<RunnableId>,
    pub after_each: Vec<RunnableId>,
}

impl Hooks {
    pub fn of(&self, kind: HookKind) -> &[RunnableId] {
        match kind {
            HookKind::BeforeAll => &self.before_all,
            HookKind::AfterAll => &self.after_all,
            HookKind::BeforeEach => &self.before_each,
            HookKind::AfterEach => &self.after_each,
        }
    }

    fn of_mut(&mut self, kind: HookKind) -> &mut Vec<RunnableId> {
        match kind {
            HookKind::BeforeAll => &mut self.before_all,
            HookKind::AfterAll => &mut self.after_all,
            HookKind::BeforeEach => &mut self.before_each,
            HookKind::AfterEach => &mut self.after_each,
        }
    }
}

/// A grouping node owning tests, hooks and child suites
#[derive(Clone, Debug)]
pub struct Suite {
    pub(crate) title: String,
    pub(crate) parent: Option<SuiteId>,
    pub(crate) suites: Vec<SuiteId>,
    pub(crate) tests: Vec<RunnableId>,
    pub(crate) hooks: Hooks,
    pub(crate) pending: bool,
    pub(crate) only: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) slow: Option<Duration>,
    pub(crate) retries: Option<u32>,
    pub(crate) file: Option<String>,
}

impl Suite {
    fn new(title: impl Into<String>, parent: Option<SuiteId>) -> Self {
        Self {
            title: title.into(),
            parent,
            suites: Vec::new(),
            tests: Vec::new(),
            hooks: Hooks::default(),
            pending: false,
            only: false,
            timeout: None,
            slow: None,
            retries: None,
            file: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn parent(&self) -> Option<SuiteId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn suites(&self) -> &[SuiteId] {
        &self.suites
    }

    pub fn tests(&self) -> &[RunnableId] {
        &self.tests
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_only(&self) -> bool {
        self.only
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// Titles may change until the run starts; full titles are derived on demand
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }
}

/// Arena holding a root suite and everything below it
#[derive(Clone, Debug)]
pub struct SuiteTree {
    suites: Vec<Suite>,
    runnables: Vec<Runnable>,
}

impl Default for SuiteTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SuiteTree {
    /// Create a tree with an untitled root suite
    pub fn new() -> Self {
        Self {
            suites: vec![Suite::new("", None)],
            runnables: Vec::new(),
        }
    }

    pub fn root(&self) -> SuiteId {
        SuiteId(0)
    }

    pub fn suite(&self, id: SuiteId) -> &Suite {
        &self.suites[id.0]
    }

    pub fn suite_mut(&mut self, id: SuiteId) -> &mut Suite {
        &mut self.suites[id.0]
    }

    pub fn runnable(&self, id: RunnableId) -> &Runnable {
        &self.runnables[id.0]
    }

    pub fn runnable_mut(&mut self, id: RunnableId) -> &mut Runnable {
        &mut self.runnables[id.0]
    }

    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    pub fn runnable_count(&self) -> usize {
        self.runnables.len()
    }

    pub fn add_suite(&mut self, parent: SuiteId, title: impl Into<String>) -> SuiteId {
        let id = SuiteId(self.suites.len());
        let mut suite = Suite::new(title, Some(parent));
        suite.file = self.suites[parent.0].file.clone();
        self.suites.push(suite);
        self.suites[parent.0].suites.push(id);
        id
    }

    /// Register a test; a test without a body is pending
    pub fn add_test(
        &mut self,
        suite: SuiteId,
        title: impl Into<String>,
        body: Option<Body>,
    ) -> RunnableId {
        let id = RunnableId(self.runnables.len());
        self.runnables
            .push(Runnable::new(RunnableKind::Test, title, suite, body));
        self.suites[suite.0].tests.push(id);
        id
    }

    pub fn add_hook(
        &mut self,
        suite: SuiteId,
        kind: HookKind,
        title: Option<&str>,
        body: Body,
    ) -> RunnableId {
        let title = match title {
            Some(name) => format!("{kind}: {name}"),
            None => kind.to_string(),
        };
        let id = RunnableId(self.runnables.len());
        self.runnables
            .push(Runnable::new(RunnableKind::Hook(kind), title, suite, Some(body)));
        self.suites[suite.0].hooks.of_mut(kind).push(id);
        id
    }

    /// Open a builder scope on a new child of the root suite
    pub fn describe(
        &mut self,
        title: impl Into<String>,
        f: impl FnOnce(&mut SuiteScope<'_>),
    ) -> SuiteId {
        let root = self.root();
        self.scope(root).describe(title, f)
    }

    /// Builder scope over an existing suite
    pub fn scope(&mut self, id: SuiteId) -> SuiteScope<'_> {
        SuiteScope { tree: self, id }
    }

    /// Ancestor chain of `id`, root first, `id` last
    pub fn ancestors(&self, id: SuiteId) -> Vec<SuiteId> {
        let mut chain = vec![id];
        let mut current = self.suite(id).parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.suite(parent).parent;
        }
        chain.reverse();
        chain
    }

    pub fn suite_full_title(&self, id: SuiteId) -> String {
        self.ancestors(id)
            .into_iter()
            .map(|s| self.suite(s).title.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn full_title(&self, id: RunnableId) -> String {
        let runnable = self.runnable(id);
        let parent = self.suite_full_title(runnable.parent);
        if parent.is_empty() {
            runnable.title.clone()
        } else {
            format!("{parent} {}", runnable.title)
        }
    }

    /// Number of tests in the subtree rooted at `id`
    pub fn total_tests(&self, id: SuiteId) -> usize {
        let suite = self.suite(id);
        suite.tests.len()
            + suite
                .suites
                .iter()
                .map(|child| self.total_tests(*child))
                .sum::<usize>()
    }

    /// Whether any suite or test anywhere is marked exclusive
    pub fn has_only(&self) -> bool {
        self.suites.iter().any(|s| s.only) || self.runnables.iter().any(|r| r.only)
    }

    /// Tests in depth-first registration order
    pub fn tests(&self) -> Vec<RunnableId> {
        let mut out = Vec::new();
        self.collect_tests(self.root(), &mut out);
        out
    }

    pub(crate) fn collect_tests(&self, id: SuiteId, out: &mut Vec<RunnableId>) {
        let suite = self.suite(id);
        out.extend(suite.tests.iter().copied());
        for child in &suite.suites {
            self.collect_tests(*child, out);
        }
    }

    /// Nearest configured value walking from `id` to the root
    pub(crate) fn inherited<T: Copy>(
        &self,
        id: SuiteId,
        pick: impl Fn(&Suite) -> Option<T>,
    ) -> Option<T> {
        let mut current = Some(id);
        while let Some(s) = current {
            let suite = self.suite(s);
            if let Some(value) = pick(suite) {
                return Some(value);
            }
            current = suite.parent;
        }
        None
    }

    /// Record `path` as the origin of every suite that has none yet
    pub fn assign_file(&mut self, path: &str) {
        for suite in self.suites.iter_mut().filter(|s| s.file.is_none()) {
            suite.file = Some(path.to_string());
        }
    }

    /// File origin of the suite owning a runnable
    pub fn file_of(&self, id: RunnableId) -> Option<&str> {
        self.suite(self.runnable(id).parent).file()
    }

    pub(crate) fn reset_states(&mut self) {
        for runnable in &mut self.runnables {
            runnable.reset();
        }
    }
}

/// Mutable builder over one suite of a [`SuiteTree`]
pub struct SuiteScope<'a> {
    tree: &'a mut SuiteTree,
    id: SuiteId,
}

impl SuiteScope<'_> {
    pub fn id(&self) -> SuiteId {
        self.id
    }

    pub fn describe(
        &mut self,
        title: impl Into<String>,
        f: impl FnOnce(&mut SuiteScope<'_>),
    ) -> SuiteId {
        let child = self.tree.add_suite(self.id, title);
        f(&mut self.tree.scope(child));
        child
    }

    /// Exclusive child suite
    pub fn describe_only(
        &mut self,
        title: impl Into<String>,
        f: impl FnOnce(&mut SuiteScope<'_>),
    ) -> SuiteId {
        let child = self.describe(title, f);
        self.tree.suite_mut(child).only = true;
        child
    }

    /// Pending child suite; nothing inside runs
    pub fn describe_skip(
        &mut self,
        title: impl Into<String>,
        f: impl FnOnce(&mut SuiteScope<'_>),
    ) -> SuiteId {
        let child = self.describe(title, f);
        self.tree.suite_mut(child).pending = true;
        child
    }

    pub fn it(&mut self, title: impl Into<String>, body: Body) -> &mut Runnable {
        let id = self.tree.add_test(self.id, title, Some(body));
        self.tree.runnable_mut(id)
    }

    /// Pending test without a body
    pub fn xit(&mut self, title: impl Into<String>) -> &mut Runnable {
        let id = self.tree.add_test(self.id, title, None);
        self.tree.runnable_mut(id)
    }

    pub fn before_all(&mut self, body: Body) -> &mut Runnable {
        self.hook(HookKind::BeforeAll, None, body)
    }

    pub fn after_all(&mut self, body: Body) -> &mut Runnable {
        self.hook(HookKind::AfterAll, None, body)
    }

    pub fn before_each(&mut self, body: Body) -> &mut Runnable {
        self.hook(HookKind::BeforeEach, None, body)
    }

    pub fn after_each(&mut self, body: Body) -> &mut Runnable {
        self.hook(HookKind::AfterEach, None, body)
    }

    pub fn hook(&mut self, kind: HookKind, name: Option<&str>, body: Body) -> &mut Runnable {
        let id = self.tree.add_hook(self.id, kind, name, body);
        self.tree.runnable_mut(id)
    }

    pub fn only(&mut self) -> &mut Self {
        self.tree.suite_mut(self.id).only = true;
        self
    }

    pub fn skip(&mut self) -> &mut Self {
        self.tree.suite_mut(self.id).pending = true;
        self
    }

    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.tree.suite_mut(self.id).timeout = Some(timeout);
        self
    }

    pub fn slow(&mut self, slow: Duration) -> &mut Self {
        self.tree.suite_mut(self.id).slow = Some(slow);
        self
    }

    pub fn retries(&mut self, retries: u32) -> &mut Self {
        self.tree.suite_mut(self.id).retries = Some(retries);
        self
    }

    /// Record the file this suite was loaded from; children inherit it
    pub fn file(&mut self, path: impl Into<String>) -> &mut Self {
        self.tree.suite_mut(self.id).file = Some(path.into());
        self
    }
}
