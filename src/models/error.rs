//! Failure payloads attached to runnables and events
//!
//! A [`TestError`] is the value a body fails with and the value reporters
//! receive in `Fail` events.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::time::Duration;
use thiserror::Error;

/// Classification of a runnable failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The body signalled failure itself
    Assertion,
    /// No completion arrived within the configured duration
    Timeout,
    /// Completion was signalled more than once for one attempt
    MultipleDone,
    /// A hook failed
    Hook,
    /// An error surfaced outside the body's own completion path
    Uncaught,
    /// The body panicked
    Panic,
    /// A parallel worker died before finishing its work
    WorkerCrash,
    /// `forbid_pending` / `forbid_only` violations
    Forbidden,
    /// Marker returned by `Context::skip`; never reported as a failure
    Skip,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Assertion => "assertion",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MultipleDone => "multiple-done",
            ErrorKind::Hook => "hook",
            ErrorKind::Uncaught => "uncaught",
            ErrorKind::Panic => "panic",
            ErrorKind::WorkerCrash => "worker-crash",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// Error value carried by a failed runnable
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct TestError {
    pub kind: ErrorKind,
    pub message: String,
    /// Rendered actual value, for diff output
    pub actual: Option<String>,
    /// Rendered expected value, for diff output
    pub expected: Option<String>,
    pub stack: String,
    /// Configured timeout, set on `Timeout` errors
    pub timeout_ms: Option<u64>,
}

impl TestError {
    /// Plain assertion failure, located at the caller
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Assertion, message)
    }

    #[track_caller]
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            kind,
            message: message.into(),
            actual: None,
            expected: None,
            stack: format!("at {}:{}:{}", location.file(), location.line(), location.column()),
            timeout_ms: None,
        }
    }

    /// Assertion failure carrying values for diff rendering
    #[track_caller]
    pub fn mismatch(
        message: impl Into<String>,
        actual: impl fmt::Debug,
        expected: impl fmt::Debug,
    ) -> Self {
        let mut err = Self::new(message);
        err.actual = Some(format!("{actual:?}"));
        err.expected = Some(format!("{expected:?}"));
        err
    }

    pub fn timeout(full_title: &str, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        let mut err = Self::with_kind(
            ErrorKind::Timeout,
            format!(
                "Timeout of {ms}ms exceeded for \"{full_title}\". For async tests and hooks, \
                 ensure \"done()\" is called; if returning a future, ensure it resolves."
            ),
        );
        err.timeout_ms = Some(ms);
        err
    }

    pub fn multiple_done(full_title: &str, extra: Option<&TestError>) -> Self {
        let message = match extra {
            Some(e) => format!(
                "done() called multiple times in \"{full_title}\"; \
                 in addition, done() received error: {}",
                e.message
            ),
            None => format!("done() called multiple times in \"{full_title}\""),
        };
        Self::with_kind(ErrorKind::MultipleDone, message)
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::with_kind(ErrorKind::Panic, message)
    }

    pub(crate) fn skip() -> Self {
        Self::with_kind(ErrorKind::Skip, "sync skip; aborting execution")
    }

    /// Re-tag an error raised by a hook, keeping its origin in the message
    pub fn into_hook_error(mut self, hook_title: &str) -> Self {
        if self.kind != ErrorKind::Timeout {
            self.message = format!("{hook_title}: {}", self.message);
        }
        self.kind = match self.kind {
            ErrorKind::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Hook,
        };
        self
    }

    pub fn is_skip(&self) -> bool {
        self.kind == ErrorKind::Skip
    }
}

impl From<anyhow::Error> for TestError {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        let mut converted = Self::new(format!("{err:#}"));
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        if !chain.is_empty() {
            let causes = chain.join("\ncaused by: ");
            converted.stack = format!("{}\ncaused by: {causes}", converted.stack);
        }
        converted
    }
}

impl From<&str> for TestError {
    #[track_caller]
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TestError {
    #[track_caller]
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Result of a runnable body
pub type Outcome = Result<(), TestError>;

/// Fail with a diffable assertion error when two values differ
#[macro_export]
macro_rules! ensure_eq {
    ($actual:expr, $expected:expr $(,)?) => {{
        let (actual, expected) = (&$actual, &$expected);
        if actual != expected {
            return Err($crate::TestError::mismatch(
                format!("expected {} to equal {}", stringify!($actual), stringify!($expected)),
                actual,
                expected,
            ));
        }
    }};
}
