//! Lifecycle events published by the runner
//!
//! Events carry owned snapshots so they can cross a worker boundary as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::TestError;
use super::runnable::{RunnableId, RunnableKind, Speed, State};
use super::suite::{SuiteId, SuiteTree};

/// Identity and result snapshot of a test or hook
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnableInfo {
    pub id: usize,
    pub kind: RunnableKind,
    pub title: String,
    pub full_title: String,
    pub file: Option<String>,
    pub state: State,
    pub duration_ms: Option<u64>,
    pub speed: Option<Speed>,
    pub current_retry: u32,
}

impl RunnableInfo {
    pub fn snapshot(tree: &SuiteTree, id: RunnableId) -> Self {
        let runnable = tree.runnable(id);
        Self {
            id: id.index(),
            kind: runnable.kind(),
            title: runnable.title().to_string(),
            full_title: tree.full_title(id),
            file: tree.file_of(id).map(str::to_string),
            state: runnable.state(),
            duration_ms: runnable.duration().map(|d| d.as_millis() as u64),
            speed: runnable.speed(),
            current_retry: runnable.current_retry(),
        }
    }

    /// Snapshot of a hook, retitled for the test it runs around
    pub(crate) fn hook_snapshot(
        tree: &SuiteTree,
        id: RunnableId,
        title: String,
        full_title: String,
    ) -> Self {
        let mut info = Self::snapshot(tree, id);
        info.title = title;
        info.full_title = full_title;
        info
    }

    /// Placeholder for failures with no real runnable behind them
    pub fn synthetic(title: impl Into<String>, file: Option<String>) -> Self {
        let title = title.into();
        Self {
            id: usize::MAX,
            kind: RunnableKind::Hook(super::runnable::HookKind::BeforeAll),
            full_title: title.clone(),
            title,
            file,
            state: State::Failed,
            duration_ms: None,
            speed: None,
            current_retry: 0,
        }
    }
}

impl fmt::Display for RunnableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.state.symbol(), self.full_title)?;
        if let Some(ms) = self.duration_ms {
            write!(f, " [{ms}ms]")?;
        }
        Ok(())
    }
}

/// Identity snapshot of a suite
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteInfo {
    pub id: usize,
    pub title: String,
    pub full_title: String,
    pub file: Option<String>,
    pub root: bool,
    pub total: usize,
}

impl SuiteInfo {
    pub fn snapshot(tree: &SuiteTree, id: SuiteId) -> Self {
        let suite = tree.suite(id);
        Self {
            id: id.index(),
            title: suite.title().to_string(),
            full_title: tree.suite_full_title(id),
            file: suite.file().map(str::to_string),
            root: suite.is_root(),
            total: tree.total_tests(id),
        }
    }
}

/// Lifecycle event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// First event of a run; `total` is unknown when tests are spread over workers
    Start { total: Option<usize> },
    SuiteBegin { suite: SuiteInfo },
    SuiteEnd { suite: SuiteInfo },
    HookBegin { hook: RunnableInfo },
    HookEnd { hook: RunnableInfo },
    TestBegin { test: RunnableInfo },
    TestEnd { test: RunnableInfo },
    Pass { test: RunnableInfo },
    Fail { runnable: RunnableInfo, error: TestError },
    Pending { test: RunnableInfo },
    Retry { test: RunnableInfo, error: TestError },
    /// Last event of a run, emitted exactly once
    End { failures: usize },
}

/// Discriminant of an [`Event`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    SuiteBegin,
    SuiteEnd,
    HookBegin,
    HookEnd,
    TestBegin,
    TestEnd,
    Pass,
    Fail,
    Pending,
    Retry,
    End,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Start { .. } => EventKind::Start,
            Event::SuiteBegin { .. } => EventKind::SuiteBegin,
            Event::SuiteEnd { .. } => EventKind::SuiteEnd,
            Event::HookBegin { .. } => EventKind::HookBegin,
            Event::HookEnd { .. } => EventKind::HookEnd,
            Event::TestBegin { .. } => EventKind::TestBegin,
            Event::TestEnd { .. } => EventKind::TestEnd,
            Event::Pass { .. } => EventKind::Pass,
            Event::Fail { .. } => EventKind::Fail,
            Event::Pending { .. } => EventKind::Pending,
            Event::Retry { .. } => EventKind::Retry,
            Event::End { .. } => EventKind::End,
        }
    }

    /// Title of the suite or runnable the event is about
    pub fn subject(&self) -> Option<&str> {
        match self {
            Event::SuiteBegin { suite } | Event::SuiteEnd { suite } => Some(&suite.full_title),
            Event::HookBegin { hook } | Event::HookEnd { hook } => Some(&hook.full_title),
            Event::TestBegin { test }
            | Event::TestEnd { test }
            | Event::Pass { test }
            | Event::Pending { test }
            | Event::Retry { test, .. } => Some(&test.full_title),
            Event::Fail { runnable, .. } => Some(&runnable.full_title),
            Event::Start { .. } | Event::End { .. } => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Start => "start",
            EventKind::SuiteBegin => "suite",
            EventKind::SuiteEnd => "suite end",
            EventKind::HookBegin => "hook",
            EventKind::HookEnd => "hook end",
            EventKind::TestBegin => "test",
            EventKind::TestEnd => "test end",
            EventKind::Pass => "pass",
            EventKind::Fail => "fail",
            EventKind::Pending => "pending",
            EventKind::Retry => "retry",
            EventKind::End => "end",
        };
        f.write_str(name)
    }
}
