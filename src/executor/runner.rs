//! Suite traversal
//!
//! Walks a [`SuiteTree`] depth first, sequencing hooks and tests, applying
//! timeout, retry and bail policy, and publishing lifecycle events.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::attempt::{run_attempt, AttemptResult, AttemptSpec, Uncaught, UncaughtHandle};
use super::filter::Selection;
use crate::config::RunnerConfig;
use crate::events::{EventBus, Listener, ListenerError, Stats, StatsCollector};
use crate::models::{
    ErrorKind, Event, HookKind, RunnableId, RunnableInfo, Speed, State, SuiteId, SuiteInfo,
    SuiteTree, TestError,
};
use crate::utils::Timer;

/// Title of the synthetic failure for errors nobody owns
pub const UNCAUGHT_TITLE: &str = "Uncaught error outside test suite";

/// Errors that prevent a run from starting
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("this runner has already run; build a new runner from `into_tree()`")]
    AlreadyRan,

    #[error("exclusive markers found while `forbid_only` is set")]
    ForbiddenExclusivity,
}

/// Cooperative stop flag shared with the caller
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// No new runnable starts once this is observed
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Result of a completed run
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub failures: usize,
    pub stats: Stats,
    pub listener_errors: Vec<ListenerError>,
    pub aborted: bool,
    pub bailed: bool,
    /// Set when an uncaught error outside any runnable halted the run
    pub fatal: Option<TestError>,
    pub duration: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures == 0 && self.fatal.is_none()
    }
}

/// What the traversal does after a step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Skip the remaining work of this suite and of everything between it and the caller
    SkipSuite(SuiteId),
    Halt,
}

enum HookOutcome {
    Passed,
    Failed(TestError),
    Skipped,
    Halted,
}

/// Sequential executor for one suite tree
pub struct Runner {
    tree: SuiteTree,
    config: RunnerConfig,
    selection: Selection,
    bus: EventBus,
    stats: StatsCollector,
    uncaught: UncaughtHandle,
    uncaught_rx: mpsc::UnboundedReceiver<Uncaught>,
    abort: AbortHandle,
    failures: usize,
    halted: bool,
    bailed: bool,
    fatal: Option<TestError>,
    started: bool,
}

impl Runner {
    pub fn new(tree: SuiteTree, config: RunnerConfig) -> Self {
        let selection = Selection::compute(&tree, &config);
        let stats = StatsCollector::new();
        let mut bus = EventBus::new();
        bus.subscribe(stats.clone());
        let (uncaught, uncaught_rx) = UncaughtHandle::channel();

        Self {
            tree,
            config,
            selection,
            bus,
            stats,
            uncaught,
            uncaught_rx,
            abort: AbortHandle::default(),
            failures: 0,
            halted: false,
            bailed: false,
            fatal: None,
            started: false,
        }
    }

    /// Add a listener; listeners see events in subscription order
    pub fn subscribe(&mut self, listener: impl Listener + 'static) -> &mut Self {
        self.bus.subscribe(listener);
        self
    }

    pub fn subscribe_boxed(&mut self, listener: Box<dyn Listener>) -> &mut Self {
        self.bus.subscribe_boxed(listener);
        self
    }

    /// Live view of the statistics of this run
    pub fn stats(&self) -> StatsCollector {
        self.stats.clone()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Share an existing stop flag, e.g. one handle for several runners
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Handle for reporting errors raised outside any body
    pub fn uncaught_handle(&self) -> UncaughtHandle {
        self.uncaught.clone()
    }

    pub fn tree(&self) -> &SuiteTree {
        &self.tree
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Take the tree back, with the states of the last run
    pub fn into_tree(self) -> SuiteTree {
        self.tree
    }

    /// Run every suite and emit `End` exactly once
    pub async fn run(&mut self) -> Result<RunReport, RunError> {
        if self.started {
            return Err(RunError::AlreadyRan);
        }
        self.started = true;

        if self.config.forbid_only && self.tree.has_only() {
            warn!("refusing to run: exclusive markers are forbidden");
            return Err(RunError::ForbiddenExclusivity);
        }

        self.tree.reset_states();
        let root = self.tree.root();
        let total = self.selection.visible_in(root);
        info!(total, runnable = self.selection.runnable_in(root), "starting run");

        let timer = Timer::start("run");
        self.bus.emit(Event::Start { total: Some(total) });
        self.run_suite(root).await;
        self.drain_uncaught();
        self.bus.emit(Event::End {
            failures: self.failures,
        });
        let duration = timer.stop();

        let stats = self.stats.snapshot();
        info!(
            "Run completed in {}ms - {} ({:.1}% passed)",
            duration.as_millis(),
            stats,
            stats.pass_rate()
        );

        Ok(RunReport {
            failures: self.failures,
            stats,
            listener_errors: self.bus.take_errors(),
            aborted: self.abort.is_aborted(),
            bailed: self.bailed,
            fatal: self.fatal.clone(),
            duration,
        })
    }

    /// Run, then hand the failure count to `handler` after `End`
    pub async fn run_with<F>(&mut self, handler: F) -> Result<RunReport, RunError>
    where
        F: FnOnce(usize),
    {
        let report = self.run().await?;
        handler(report.failures);
        Ok(report)
    }

    fn should_stop(&self) -> bool {
        self.halted || self.abort.is_aborted()
    }

    fn run_suite(&mut self, id: SuiteId) -> BoxFuture<'_, Flow> {
        async move {
            if self.selection.visible_in(id) == 0 {
                return Flow::Continue;
            }
            self.drain_uncaught();
            if self.should_stop() {
                return Flow::Halt;
            }

            // Pending ancestors already zero the runnable count
            let pending = self.tree.suite(id).is_pending() || self.selection.runnable_in(id) == 0;
            if pending {
                self.report_pending_suite(id);
                return Flow::Continue;
            }

            debug!(suite = %self.tree.suite_full_title(id), "entering suite");
            self.emit_suite_begin(id);

            let flow = match self.run_hooks(id, HookKind::BeforeAll, None, false).await {
                HookOutcome::Passed => self.run_contents(id).await,
                HookOutcome::Skipped => {
                    self.report_pending_contents(id);
                    Flow::Continue
                }
                HookOutcome::Failed(_) => {
                    let suite = self.tree.suite_full_title(id);
                    debug!(%suite, "before all failed, skipping suite");
                    Flow::Continue
                }
                HookOutcome::Halted => Flow::Halt,
            };

            self.run_hooks(id, HookKind::AfterAll, None, true).await;
            self.emit_suite_end(id);

            if self.should_stop() {
                return Flow::Halt;
            }
            match flow {
                Flow::SkipSuite(target) if target == id => Flow::Continue,
                other => other,
            }
        }
        .boxed()
    }

    /// Tests of `id`, then its child suites
    async fn run_contents(&mut self, id: SuiteId) -> Flow {
        match self.run_tests(id).await {
            Flow::Continue => {}
            other => return other,
        }

        let children = self.tree.suite(id).suites().to_vec();
        for child in children {
            match self.run_suite(child).await {
                Flow::Continue => {}
                other => return other,
            }
        }
        Flow::Continue
    }

    async fn run_tests(&mut self, suite: SuiteId) -> Flow {
        let tests = self.tree.suite(suite).tests().to_vec();
        for test in tests {
            self.drain_uncaught();
            if self.should_stop() {
                return Flow::Halt;
            }
            if self.selection.is_hidden(test) {
                continue;
            }
            if !self.selection.is_selected(test) || self.tree.runnable(test).is_pending() {
                self.mark_pending(test);
                self.emit_test_end(test);
                continue;
            }

            match self.run_test(test).await {
                Flow::Continue => {}
                other => return other,
            }
        }
        Flow::Continue
    }

    async fn run_test(&mut self, test: RunnableId) -> Flow {
        let chain = self.tree.ancestors(self.tree.runnable(test).parent());
        self.tree.runnable_mut(test).state = State::Running;
        self.bus.emit(Event::TestBegin {
            test: RunnableInfo::snapshot(&self.tree, test),
        });

        // Index into `chain` of the outermost suite whose remaining tests are skipped
        let mut skip_from: Option<usize> = None;
        let mut entered = 0;
        let mut run_body = true;

        for (depth, suite) in chain.iter().enumerate() {
            entered = depth + 1;
            match self.run_hooks(*suite, HookKind::BeforeEach, Some(test), false).await {
                HookOutcome::Passed => continue,
                HookOutcome::Failed(error) => {
                    let runnable = self.tree.runnable_mut(test);
                    runnable.state = State::Failed;
                    runnable.error = Some(error);
                    skip_from = Some(depth);
                }
                HookOutcome::Skipped => self.mark_pending(test),
                HookOutcome::Halted => {
                    debug!(test = %self.tree.full_title(test), "halted before the test body");
                    self.mark_pending(test);
                }
            }
            run_body = false;
            break;
        }

        if run_body {
            self.run_body(test).await;
        }
        self.emit_test_end(test);

        for depth in (0..entered).rev() {
            let outcome = self
                .run_hooks(chain[depth], HookKind::AfterEach, Some(test), true)
                .await;
            if let HookOutcome::Failed(_) = outcome {
                skip_from = Some(skip_from.map_or(depth, |d| d.min(depth)));
            }
        }

        if self.should_stop() {
            return Flow::Halt;
        }
        match skip_from {
            Some(depth) => Flow::SkipSuite(chain[depth]),
            None => Flow::Continue,
        }
    }

    /// Body of `test`, retried within its budget; hooks are not re-run
    async fn run_body(&mut self, test: RunnableId) {
        let budget = self.retries_for(test);
        let full_title = self.tree.full_title(test);
        let title = self.tree.runnable(test).title().to_string();

        let mut attempt = 0;
        loop {
            {
                let runnable = self.tree.runnable_mut(test);
                runnable.current_retry = attempt;
                runnable.state = State::Running;
            }
            let result = self.execute(test, title.clone(), full_title.clone()).await;
            self.tree.runnable_mut(test).duration = Some(result.duration);

            match result.outcome {
                Ok(()) => {
                    let speed = Speed::classify(result.duration, self.slow_for(test));
                    let runnable = self.tree.runnable_mut(test);
                    runnable.state = State::Passed;
                    runnable.speed = Some(speed);
                    debug!(test = %full_title, ?speed, "passed");
                    self.bus.emit(Event::Pass {
                        test: RunnableInfo::snapshot(&self.tree, test),
                    });
                    return;
                }
                Err(err) if err.is_skip() => {
                    self.mark_pending(test);
                    return;
                }
                Err(err) if attempt < budget && !self.abort.is_aborted() => {
                    self.tree.runnable_mut(test).state = State::Failed;
                    info!(test = %full_title, attempt = attempt + 1, budget, "retrying: {err}");
                    self.bus.emit(Event::Retry {
                        test: RunnableInfo::snapshot(&self.tree, test),
                        error: err,
                    });
                    attempt += 1;
                }
                Err(err) => {
                    let runnable = self.tree.runnable_mut(test);
                    runnable.state = State::Failed;
                    runnable.error = Some(err.clone());
                    let info = RunnableInfo::snapshot(&self.tree, test);
                    self.record_failure(info, err);
                    return;
                }
            }
        }
    }

    /// Run the `kind` hooks of `suite` in registration order
    ///
    /// Stops at the first failing hook. Cleanup hooks run even when the run is
    /// halting.
    async fn run_hooks(
        &mut self,
        suite: SuiteId,
        kind: HookKind,
        test: Option<RunnableId>,
        cleanup: bool,
    ) -> HookOutcome {
        let hooks = self.tree.suite(suite).hooks().of(kind).to_vec();
        for hook in hooks {
            self.drain_uncaught();
            if !cleanup && self.should_stop() {
                return HookOutcome::Halted;
            }

            let (title, full_title) = self.hook_titles(hook, test);
            self.tree.runnable_mut(hook).state = State::Running;
            self.bus.emit(Event::HookBegin {
                hook: RunnableInfo::hook_snapshot(
                    &self.tree,
                    hook,
                    title.clone(),
                    full_title.clone(),
                ),
            });

            let result = self.execute(hook, title.clone(), full_title.clone()).await;
            self.tree.runnable_mut(hook).duration = Some(result.duration);

            let outcome = match result.outcome {
                Ok(()) => {
                    self.tree.runnable_mut(hook).state = State::Passed;
                    HookOutcome::Passed
                }
                Err(err) if err.is_skip() && !cleanup => {
                    debug!(hook = %full_title, "skipped from hook");
                    self.tree.runnable_mut(hook).state = State::Pending;
                    HookOutcome::Skipped
                }
                Err(err) if err.is_skip() => {
                    self.tree.runnable_mut(hook).state = State::Passed;
                    HookOutcome::Passed
                }
                Err(err) => {
                    let err = err.into_hook_error(&title);
                    let runnable = self.tree.runnable_mut(hook);
                    runnable.state = State::Failed;
                    runnable.error = Some(err.clone());
                    let info =
                        RunnableInfo::hook_snapshot(&self.tree, hook, title, full_title.clone());
                    warn!(hook = %full_title, "hook failed: {err}");
                    self.record_failure(info, err.clone());
                    HookOutcome::Failed(err)
                }
            };

            let (title, full_title) = self.hook_titles(hook, test);
            self.bus.emit(Event::HookEnd {
                hook: RunnableInfo::hook_snapshot(&self.tree, hook, title, full_title),
            });

            match outcome {
                HookOutcome::Passed => continue,
                other => return other,
            }
        }
        HookOutcome::Passed
    }

    fn hook_titles(&self, hook: RunnableId, test: Option<RunnableId>) -> (String, String) {
        let runnable = self.tree.runnable(hook);
        let title = match test {
            Some(test) if runnable.kind().hook().is_some_and(|k| k.is_each()) => {
                format!("{} for \"{}\"", runnable.title(), self.tree.runnable(test).title())
            }
            _ => runnable.title().to_string(),
        };
        let suite_title = self.tree.suite_full_title(runnable.parent());
        let full_title = if suite_title.is_empty() {
            title.clone()
        } else {
            format!("{suite_title} {title}")
        };
        (title, full_title)
    }

    async fn execute(
        &mut self,
        id: RunnableId,
        title: String,
        full_title: String,
    ) -> AttemptResult {
        let runnable = self.tree.runnable(id);
        let Some(body) = runnable.body.clone() else {
            return AttemptResult {
                outcome: Ok(()),
                duration: Duration::ZERO,
                stray: Vec::new(),
            };
        };
        let timeout = runnable
            .timeout
            .or_else(|| self.tree.inherited(runnable.parent(), |s| s.timeout))
            .unwrap_or_else(|| self.config.timeout());

        let spec = AttemptSpec {
            id,
            title,
            full_title,
            body,
            timeout,
        };
        let mut result = run_attempt(spec, &self.uncaught, &mut self.uncaught_rx).await;
        for uncaught in std::mem::take(&mut result.stray) {
            self.handle_uncaught(uncaught);
        }
        result
    }

    fn retries_for(&self, test: RunnableId) -> u32 {
        let runnable = self.tree.runnable(test);
        runnable
            .retries
            .or_else(|| self.tree.inherited(runnable.parent(), |s| s.retries))
            .unwrap_or(self.config.retries)
    }

    fn slow_for(&self, test: RunnableId) -> Duration {
        let runnable = self.tree.runnable(test);
        runnable
            .slow
            .or_else(|| self.tree.inherited(runnable.parent(), |s| s.slow))
            .unwrap_or_else(|| self.config.slow())
    }

    fn drain_uncaught(&mut self) {
        while let Ok(uncaught) = self.uncaught_rx.try_recv() {
            self.handle_uncaught(uncaught);
        }
    }

    /// Errors arriving while nothing of theirs is in flight
    fn handle_uncaught(&mut self, uncaught: Uncaught) {
        let Uncaught { mut error, origin } = uncaught;
        match origin {
            Some(id) => {
                let full_title = self.tree.full_title(id);
                if self.tree.runnable(id).state() == State::Failed {
                    debug!(runnable = %full_title, "already failed, late error ignored: {error}");
                    return;
                }
                warn!(runnable = %full_title, "failure reported after completion: {error}");
                let runnable = self.tree.runnable_mut(id);
                runnable.state = State::Failed;
                runnable.error = Some(error.clone());
                let info = RunnableInfo::snapshot(&self.tree, id);
                self.record_failure(info, error);
            }
            None => {
                error!("{UNCAUGHT_TITLE}: {error}");
                error.kind = ErrorKind::Uncaught;
                let file = self.tree.suite(self.tree.root()).file().map(str::to_string);
                self.record_failure(RunnableInfo::synthetic(UNCAUGHT_TITLE, file), error.clone());
                self.halted = true;
                self.fatal = Some(error);
            }
        }
    }

    fn record_failure(&mut self, runnable: RunnableInfo, error: TestError) {
        self.failures += 1;
        self.bus.emit(Event::Fail { runnable, error });
        if self.config.bail && !self.halted {
            info!("bail: halting after the first failure");
            self.halted = true;
            self.bailed = true;
        }
    }

    /// Pending, or a failure when pending tests are forbidden
    fn mark_pending(&mut self, test: RunnableId) {
        if self.config.forbid_pending {
            let error = TestError::with_kind(ErrorKind::Forbidden, "Pending test forbidden");
            let runnable = self.tree.runnable_mut(test);
            runnable.state = State::Failed;
            runnable.error = Some(error.clone());
            let info = RunnableInfo::snapshot(&self.tree, test);
            self.record_failure(info, error);
        } else {
            self.tree.runnable_mut(test).state = State::Pending;
            self.bus.emit(Event::Pending {
                test: RunnableInfo::snapshot(&self.tree, test),
            });
        }
    }

    fn report_pending_suite(&mut self, id: SuiteId) {
        if self.selection.visible_in(id) == 0 {
            return;
        }
        self.emit_suite_begin(id);
        self.report_pending_contents(id);
        self.emit_suite_end(id);
    }

    fn report_pending_contents(&mut self, id: SuiteId) {
        let tests = self.tree.suite(id).tests().to_vec();
        for test in tests {
            if self.selection.is_hidden(test) {
                continue;
            }
            self.mark_pending(test);
            self.emit_test_end(test);
        }
        let children = self.tree.suite(id).suites().to_vec();
        for child in children {
            self.report_pending_suite(child);
        }
    }

    fn emit_suite_begin(&mut self, id: SuiteId) {
        self.bus.emit(Event::SuiteBegin {
            suite: SuiteInfo::snapshot(&self.tree, id),
        });
    }

    fn emit_suite_end(&mut self, id: SuiteId) {
        self.bus.emit(Event::SuiteEnd {
            suite: SuiteInfo::snapshot(&self.tree, id),
        });
    }

    fn emit_test_end(&mut self, test: RunnableId) {
        self.bus.emit(Event::TestEnd {
            test: RunnableInfo::snapshot(&self.tree, test),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_eq;
    use crate::executor::Body;
    use crate::models::EventKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn noop() -> Body {
        Body::sync(|_| Ok(()))
    }

    fn failing(message: &'static str) -> Body {
        Body::sync(move |_| Err(TestError::new(message)))
    }

    fn counting(calls: &Arc<AtomicUsize>) -> Body {
        let calls = Arc::clone(calls);
        Body::sync(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn record(runner: &mut Runner) -> Arc<Mutex<Vec<Event>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        runner.subscribe(move |event: &Event| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        log
    }

    fn trace(log: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .map(|event| match event.subject() {
                Some(subject) if !subject.is_empty() => format!("{} {subject}", event.kind()),
                _ => event.kind().to_string(),
            })
            .collect()
    }

    fn count(log: &Arc<Mutex<Vec<Event>>>, kind: EventKind) -> usize {
        log.lock().unwrap().iter().filter(|e| e.kind() == kind).count()
    }

    #[tokio::test]
    async fn test_math_before_each_reruns() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let reset = Arc::clone(&counter);
        let (first, second) = (Arc::clone(&counter), Arc::clone(&counter));
        tree.describe("Math", move |s| {
            s.before_each(Body::sync(move |_| {
                reset.store(0, Ordering::SeqCst);
                reset.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            s.it(
                "adds",
                Body::sync(move |_| {
                    ensure_eq!(first.load(Ordering::SeqCst), 1);
                    Ok(())
                }),
            );
            s.it(
                "adds again",
                Body::sync(move |_| {
                    ensure_eq!(second.load(Ordering::SeqCst), 1);
                    Ok(())
                }),
            );
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 0);
        assert_eq!(report.stats.passes, 2);
        assert_eq!(
            trace(&log),
            vec![
                "start",
                "suite",
                "suite Math",
                "test Math adds",
                "hook Math \"before each\" hook for \"adds\"",
                "hook end Math \"before each\" hook for \"adds\"",
                "pass Math adds",
                "test end Math adds",
                "test Math adds again",
                "hook Math \"before each\" hook for \"adds again\"",
                "hook end Math \"before each\" hook for \"adds again\"",
                "pass Math adds again",
                "test end Math adds again",
                "suite end Math",
                "suite end",
                "end",
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_when_done_is_never_called() {
        let mut tree = SuiteTree::new();
        tree.describe("slow", |s| {
            s.it("never finishes", Body::callback(|_, _done| {}))
                .timeout(Duration::from_millis(50));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 1);
        let events = log.lock().unwrap();
        let error = events
            .iter()
            .find_map(|e| match e {
                Event::Fail { error, .. } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.timeout_ms, Some(50));
        assert!(report.duration < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bail_stops_after_first_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (r1, r2, c) = (Arc::clone(&ran), Arc::clone(&ran), Arc::clone(&cleaned));
        tree.describe("First", move |s| {
            s.after_all(counting(&c));
            s.it("fails", failing("boom"));
            s.it("never runs", counting(&r1));
        });
        tree.describe("Other", move |s| {
            s.it("also never runs", counting(&r2));
        });

        let config = RunnerConfig::default().with_bail(true);
        let mut runner = Runner::new(tree, config);
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 1);
        assert!(report.bailed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(!trace(&log).iter().any(|line| line.contains("Other")));
        assert_eq!(count(&log, EventKind::End), 1);
    }

    #[tokio::test]
    async fn test_bail_after_before_each_failure_still_cleans_up() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (r1, r2) = (Arc::clone(&ran), Arc::clone(&ran));
        let (c1, c2) = (Arc::clone(&cleaned), Arc::clone(&cleaned));
        tree.describe("Setup", move |s| {
            s.before_each(failing("no connection"));
            s.after_each(counting(&c1));
            s.after_all(counting(&c2));
            s.it("first", counting(&r1));
            s.it("second", counting(&r1));
        });
        tree.describe("Later", move |s| {
            s.it("never runs", counting(&r2));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default().with_bail(true));
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 1);
        assert!(report.bailed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
        assert!(!trace(&log).iter().any(|line| line.contains("Later")));
        assert_eq!(count(&log, EventKind::TestBegin), 1);
        assert_eq!(count(&log, EventKind::End), 1);
    }

    #[tokio::test]
    async fn test_bail_after_before_all_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (r1, r2, c) = (Arc::clone(&ran), Arc::clone(&ran), Arc::clone(&cleaned));
        tree.describe("Setup", move |s| {
            s.before_all(failing("fixture missing"));
            s.after_all(counting(&c));
            s.it("skipped", counting(&r1));
        });
        tree.describe("Later", move |s| {
            s.it("never runs", counting(&r2));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default().with_bail(true));
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 1);
        assert!(report.bailed);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(!trace(&log).iter().any(|line| line.contains("Later")));
        assert_eq!(count(&log, EventKind::End), 1);
    }

    #[tokio::test]
    async fn test_only_me_runs_alone() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let calls = Arc::clone(&ran);
        tree.describe("suite", move |s| {
            s.it("one", counting(&calls));
            s.it("only-me", counting(&calls)).only();
            s.it("two", counting(&calls));
            s.it("three", counting(&calls));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let report = runner.run().await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(report.stats.passes, 1);
        assert_eq!(report.stats.pending, 3);
        assert_eq!(report.stats.tests, 4);
    }

    #[tokio::test]
    async fn test_before_all_failure_skips_subtree_but_runs_after_all_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (r, c) = (Arc::clone(&ran), Arc::clone(&cleaned));
        tree.describe("db", move |s| {
            s.before_all(failing("no connection"));
            s.after_all(counting(&c));
            s.it("reads", counting(&r));
            s.describe("nested", |n| {
                n.it("writes", counting(&r));
            });
        });
        let sibling = Arc::new(AtomicUsize::new(0));
        let sib = Arc::clone(&sibling);
        tree.describe("sibling", move |s| {
            s.it("still runs", counting(&sib));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(sibling.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures, 1);

        let events = log.lock().unwrap();
        let failure = events
            .iter()
            .find_map(|e| match e {
                Event::Fail { runnable, error } => Some((runnable.clone(), error.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure.0.full_title, "db \"before all\" hook");
        assert_eq!(failure.1.kind, ErrorKind::Hook);
        assert!(!events.iter().any(|e| e.subject() == Some("db nested")));
    }

    #[tokio::test]
    async fn test_retries_attempt_count() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (a, h) = (Arc::clone(&attempts), Arc::clone(&hooks));
        tree.describe("flaky", move |s| {
            s.before_each(counting(&h));
            s.it(
                "always fails",
                Body::sync(move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::new("still broken"))
                }),
            )
            .retries(2);
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert_eq!(count(&log, EventKind::Retry), 2);
        assert_eq!(report.failures, 1);

        let tree = runner.into_tree();
        let test = tree.tests()[0];
        assert_eq!(tree.runnable(test).current_retry(), 2);
        assert_eq!(tree.runnable(test).state(), State::Failed);
    }

    #[tokio::test]
    async fn test_retry_then_pass() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let a = Arc::clone(&attempts);
        tree.scope(tree.root()).retries(3).describe("eventually", move |s| {
            s.it(
                "passes on the second try",
                Body::sync(move |_| {
                    if a.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TestError::new("first try"))
                    } else {
                        Ok(())
                    }
                }),
            );
        });

        let report = Runner::new(tree, RunnerConfig::default()).run().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(report.failures, 0);
        assert_eq!(report.stats.passes, 1);
    }

    #[tokio::test]
    async fn test_double_done_fails_the_test() {
        let mut tree = SuiteTree::new();
        tree.describe("callbacks", |s| {
            s.it(
                "calls done twice",
                Body::callback(|_, done| {
                    done.ok();
                    done.ok();
                }),
            );
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 1);
        assert_eq!(count(&log, EventKind::Pass), 0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let build = || {
            let mut tree = SuiteTree::new();
            tree.describe("A", |s| {
                s.it("passes", noop());
                s.it("fails", failing("nope"));
                s.xit("todo");
            });
            tree
        };

        let mut first = Runner::new(build(), RunnerConfig::default());
        let first_log = record(&mut first);
        first.run().await.unwrap();
        assert_eq!(first.run().await.unwrap_err(), RunError::AlreadyRan);

        let mut second = Runner::new(first.into_tree(), RunnerConfig::default());
        let second_log = record(&mut second);
        second.run().await.unwrap();

        assert_eq!(trace(&first_log), trace(&second_log));
    }

    #[tokio::test]
    async fn test_before_each_failure_skips_rest_of_owning_suite() {
        let ran = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (r, a, r2) = (Arc::clone(&ran), Arc::clone(&after), Arc::clone(&ran));
        tree.describe("outer", move |s| {
            s.after_each(counting(&a));
            s.it("first", counting(&r));
            s.describe("inner", move |i| {
                i.before_each(failing("setup broke"));
                i.it("a", counting(&r2));
                i.it("b", counting(&r2));
            });
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 2);
        assert_eq!(report.failures, 1);

        let lines = trace(&log);
        assert!(lines.contains(&"test end outer inner a".to_string()));
        assert!(!lines.iter().any(|l| l.contains("inner b")));

        let tree = runner.into_tree();
        let a_test = tree.tests()[1];
        assert_eq!(tree.runnable(a_test).state(), State::Failed);
        assert_eq!(tree.runnable(a_test).error().map(|e| e.kind), Some(ErrorKind::Hook));
    }

    #[tokio::test]
    async fn test_uncaught_outside_runnable_is_fatal() {
        let mut tree = SuiteTree::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        tree.describe("A", move |s| {
            s.it("one", noop());
            s.it("two", counting(&r));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        runner
            .uncaught_handle()
            .report(TestError::new("stray background failure"));
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(report.fatal.is_some());
        assert_eq!(report.failures, 1);
        assert!(trace(&log).contains(&format!("fail {UNCAUGHT_TITLE}")));
        assert_eq!(count(&log, EventKind::End), 1);
    }

    #[tokio::test]
    async fn test_listener_error_does_not_affect_run() {
        let mut tree = SuiteTree::new();
        tree.describe("A", |s| {
            s.it("passes", noop());
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        runner.subscribe(|event: &Event| -> anyhow::Result<()> {
            if event.kind() == EventKind::Pass {
                anyhow::bail!("reporter broke");
            }
            Ok(())
        });
        let mut seen = None;
        let report = runner.run_with(|failures| seen = Some(failures)).await.unwrap();

        assert_eq!(seen, Some(0));
        assert_eq!(report.failures, 0);
        assert_eq!(report.listener_errors.len(), 1);
        assert_eq!(report.listener_errors[0].event, EventKind::Pass);
    }

    #[tokio::test]
    async fn test_abort_stops_new_runnables_and_runs_cleanup() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut tree = SuiteTree::new();
        let (c, r) = (Arc::clone(&cleaned), Arc::clone(&ran));
        let abort = AbortHandle::default();
        let trigger = abort.clone();
        tree.describe("A", move |s| {
            s.after_all(counting(&c));
            s.it(
                "stops the run",
                Body::sync(move |_| {
                    trigger.abort();
                    Ok(())
                }),
            );
            s.it("not started", counting(&r));
        });

        let mut runner = Runner::new(tree, RunnerConfig::default()).with_abort_handle(abort);
        let report = runner.run().await.unwrap();

        assert!(report.aborted);
        assert!(runner.abort_handle().is_aborted());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        let tree = runner.into_tree();
        assert!(tree
            .tests()
            .into_iter()
            .all(|id| tree.runnable(id).state() != State::Running));
    }

    #[tokio::test]
    async fn test_forbid_only_and_forbid_pending() {
        let mut tree = SuiteTree::new();
        tree.describe("A", |s| {
            s.it("focused", noop()).only();
        });
        let config = RunnerConfig {
            forbid_only: true,
            ..Default::default()
        };
        let mut runner = Runner::new(tree, config);
        let log = record(&mut runner);
        assert_eq!(runner.run().await.unwrap_err(), RunError::ForbiddenExclusivity);
        assert!(log.lock().unwrap().is_empty());

        let mut tree = SuiteTree::new();
        tree.describe("B", |s| {
            s.it("done", noop());
            s.xit("todo");
        });
        let config = RunnerConfig {
            forbid_pending: true,
            ..Default::default()
        };
        let report = Runner::new(tree, config).run().await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.stats.pending, 0);
    }

    #[tokio::test]
    async fn test_runtime_skip_and_grep() {
        let mut tree = SuiteTree::new();
        tree.describe("feature", |s| {
            s.it("skips itself", Body::sync(|ctx| Err(ctx.skip())));
            s.it("runs", noop());
        });
        tree.describe("unrelated", |s| {
            s.it("filtered out", failing("should not run"));
        });

        let config = RunnerConfig::default().with_grep("feature", false);
        let mut runner = Runner::new(tree, config);
        let log = record(&mut runner);
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 0);
        assert_eq!(report.stats.pending, 1);
        assert_eq!(report.stats.passes, 1);
        assert_eq!(
            log.lock().unwrap().first(),
            Some(&Event::Start { total: Some(2) })
        );
        assert!(!trace(&log).iter().any(|l| l.contains("unrelated")));
    }

    #[tokio::test]
    async fn test_late_failure_after_pass() {
        let mut tree = SuiteTree::new();
        tree.describe("A", |s| {
            s.it(
                "reports later",
                Body::sync(|ctx| {
                    ctx.report_uncaught(TestError::new("background check failed"));
                    Ok(())
                }),
            );
            s.it("next", noop());
        });

        let mut runner = Runner::new(tree, RunnerConfig::default());
        let report = runner.run().await.unwrap();

        assert_eq!(report.failures, 1);
        assert!(report.fatal.is_none());
        let tree = runner.into_tree();
        assert_eq!(tree.runnable(tree.tests()[0]).state(), State::Failed);
        assert_eq!(tree.runnable(tree.tests()[1]).state(), State::Passed);
    }
}
