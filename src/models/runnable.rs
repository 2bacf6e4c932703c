//! Runnable models: tests and hooks
//!
//! Defines runnable kinds, execution states and speed classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::error::TestError;
use super::suite::SuiteId;
use crate::executor::Body;

/// Index of a runnable inside its [`SuiteTree`](super::SuiteTree)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnableId(pub(crate) usize);

impl RunnableId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Hook position relative to the tests of its suite
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookKind {
    pub fn label(&self) -> &'static str {
        match self {
            HookKind::BeforeAll => "before all",
            HookKind::AfterAll => "after all",
            HookKind::BeforeEach => "before each",
            HookKind::AfterEach => "after each",
        }
    }

    pub fn is_each(&self) -> bool {
        matches!(self, HookKind::BeforeEach | HookKind::AfterEach)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" hook", self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnableKind {
    Test,
    Hook(HookKind),
}

impl RunnableKind {
    pub fn is_test(&self) -> bool {
        matches!(self, RunnableKind::Test)
    }

    pub fn hook(&self) -> Option<HookKind> {
        match self {
            RunnableKind::Hook(kind) => Some(*kind),
            RunnableKind::Test => None,
        }
    }
}

/// Execution state of a runnable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    NotRun,
    Running,
    Passed,
    Failed,
    Pending,
}

impl State {
    pub fn symbol(&self) -> &'static str {
        match self {
            State::NotRun => " ",
            State::Running => "…",
            State::Passed => "✓",
            State::Failed => "✗",
            State::Pending => "○",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Passed | State::Failed | State::Pending)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::NotRun => write!(f, "NOT RUN"),
            State::Running => write!(f, "RUNNING"),
            State::Passed => write!(f, "PASS"),
            State::Failed => write!(f, "FAIL"),
            State::Pending => write!(f, "PENDING"),
        }
    }
}

/// Duration classification against the slow threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    Fast,
    Normal,
    Slow,
}

impl Speed {
    /// `Fast` below half the threshold, `Slow` at or above it
    pub fn classify(duration: Duration, slow: Duration) -> Self {
        if duration >= slow {
            Speed::Slow
        } else if duration >= slow / 2 {
            Speed::Normal
        } else {
            Speed::Fast
        }
    }
}

/// A test or hook registered in a suite
#[derive(Clone)]
pub struct Runnable {
    pub(crate) kind: RunnableKind,
    pub(crate) title: String,
    pub(crate) parent: SuiteId,
    pub(crate) body: Option<Body>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) slow: Option<Duration>,
    pub(crate) retries: Option<u32>,
    pub(crate) only: bool,
    pub(crate) pending: bool,

    pub(crate) state: State,
    pub(crate) duration: Option<Duration>,
    pub(crate) speed: Option<Speed>,
    pub(crate) current_retry: u32,
    pub(crate) error: Option<TestError>,
}

impl Runnable {
    pub(crate) fn new(
        kind: RunnableKind,
        title: impl Into<String>,
        parent: SuiteId,
        body: Option<Body>,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            parent,
            body,
            timeout: None,
            slow: None,
            retries: None,
            only: false,
            pending: false,
            state: State::NotRun,
            duration: None,
            speed: None,
            current_retry: 0,
            error: None,
        }
    }

    /// Mark as exclusive
    pub fn only(&mut self) -> &mut Self {
        self.only = true;
        self
    }

    /// Mark as pending; the body will not run
    pub fn skip(&mut self) -> &mut Self {
        self.pending = true;
        self
    }

    /// Override the timeout; `Duration::ZERO` disables it
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn slow(&mut self, slow: Duration) -> &mut Self {
        self.slow = Some(slow);
        self
    }

    /// Override the retry budget (tests only; hooks are never retried)
    pub fn retries(&mut self, retries: u32) -> &mut Self {
        self.retries = Some(retries);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn kind(&self) -> RunnableKind {
        self.kind
    }

    pub fn parent(&self) -> SuiteId {
        self.parent
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn speed(&self) -> Option<Speed> {
        self.speed
    }

    pub fn current_retry(&self) -> u32 {
        self.current_retry
    }

    pub fn error(&self) -> Option<&TestError> {
        self.error.as_ref()
    }

    pub fn is_only(&self) -> bool {
        self.only
    }

    /// Explicitly skipped or registered without a body
    pub fn is_pending(&self) -> bool {
        self.pending || self.body.is_none()
    }

    pub(crate) fn reset(&mut self) {
        self.state = State::NotRun;
        self.duration = None;
        self.speed = None;
        self.current_retry = 0;
        self.error = None;
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runnable")
            .field("kind", &self.kind)
            .field("title", &self.title)
            .field("parent", &self.parent)
            .field("body", &self.body.as_ref().map(Body::style))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
