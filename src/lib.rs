//! Suite Runner - hierarchical test suite execution engine
//!
//! Runs a tree of suites, tests and hooks in a well-defined order and
//! publishes a stream of lifecycle events to subscribed listeners.
//!
//! ## Features
//!
//! - Synchronous, callback (`done`) and deferred (future) test bodies
//! - `before all` / `after all` / `before each` / `after each` hooks
//! - Per-runnable timeouts, retries, slow thresholds and bail mode
//! - Exclusive (`only`) and pending markers, title filtering
//! - Parallel execution of suite files on worker tasks
//!
//! ## Usage
//!
//! ```no_run
//! use suite_runner::{ensure_eq, Body, Runner, RunnerConfig, SuiteTree};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut tree = SuiteTree::new();
//! tree.describe("Math", |s| {
//!     s.it("adds", Body::sync(|_| {
//!         ensure_eq!(1 + 1, 2);
//!         Ok(())
//!     }));
//! });
//!
//! let report = Runner::new(tree, RunnerConfig::default()).run().await?;
//! println!("{}", report.stats);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod executor;
pub mod models;
pub mod utils;

pub use config::{EnvConfig, ParallelConfig, RunnerConfig};
pub use events::{EventBus, Listener, ListenerError, Stats, StatsCollector};
pub use executor::{
    AbortHandle, Body, CompletionStyle, Context, Done, ParallelCoordinator, ParallelError,
    ParallelReport, RunError, RunReport, Runner, SuiteFile, UncaughtHandle,
};
pub use models::{
    ErrorKind, Event, EventKind, HookKind, Outcome, RunnableInfo, State, SuiteId, SuiteInfo,
    SuiteScope, SuiteTree, TestError,
};
