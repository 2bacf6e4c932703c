//! Data models for suite execution
//!
//! Suites, runnables, failure payloads and the lifecycle events built from them.

mod error;
mod event;
mod runnable;
mod suite;

pub use error::{ErrorKind, Outcome, TestError};
pub use event::{Event, EventKind, RunnableInfo, SuiteInfo};
pub use runnable::{HookKind, Runnable, RunnableId, RunnableKind, Speed, State};
pub use suite::{Hooks, Suite, SuiteId, SuiteScope, SuiteTree};
