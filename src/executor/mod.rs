//! Test execution engine
//!
//! Provides per-attempt completion detection, sequential suite traversal and
//! parallel execution across worker tasks.

mod attempt;
mod filter;
mod parallel;
mod runner;

pub use attempt::{Body, CompletionStyle, Context, Done, UncaughtHandle};
pub use parallel::{ParallelCoordinator, ParallelError, ParallelReport, SuiteFile, WorkerMessage};
pub use runner::{AbortHandle, RunError, RunReport, Runner, UNCAUGHT_TITLE};
