//! Runnable execution
//!
//! Runs one attempt of a test or hook body and resolves it to an [`Outcome`],
//! whichever completion style the body uses. Every attempt owns a single
//! resolution channel; the first settlement wins and any further one is a
//! multiple-completion failure.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::models::{ErrorKind, Outcome, RunnableId, TestError};
use crate::utils::Timer;

type SyncFn = dyn Fn(&Context) -> Outcome + Send + Sync;
type CallbackFn = dyn Fn(Context, Done) + Send + Sync;
type DeferredFn = dyn Fn(Context) -> BoxFuture<'static, Outcome> + Send + Sync;
type OverspecifiedFn = dyn Fn(Context, Done) -> BoxFuture<'static, Outcome> + Send + Sync;

/// How a body signals completion, fixed when the body is built
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStyle {
    Sync,
    Callback,
    Deferred,
    /// Takes a [`Done`] and also returns a future; the callback wins
    CallbackDeferred,
}

/// User code behind a test or hook
#[derive(Clone)]
pub enum Body {
    Sync(Arc<SyncFn>),
    Callback(Arc<CallbackFn>),
    Deferred(Arc<DeferredFn>),
    CallbackDeferred(Arc<OverspecifiedFn>),
}

impl Body {
    /// Completes when the closure returns
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Context) -> Outcome + Send + Sync + 'static,
    {
        Body::Sync(Arc::new(f))
    }

    /// Completes when the closure invokes its [`Done`] handle
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Context, Done) + Send + Sync + 'static,
    {
        Body::Callback(Arc::new(f))
    }

    /// Completes when the returned future settles
    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Body::Deferred(Arc::new(move |ctx| f(ctx).boxed()))
    }

    /// Takes a [`Done`] and returns a future. Only `Done` decides the outcome.
    pub fn callback_deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Done) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Body::CallbackDeferred(Arc::new(move |ctx, done| f(ctx, done).boxed()))
    }

    pub fn style(&self) -> CompletionStyle {
        match self {
            Body::Sync(_) => CompletionStyle::Sync,
            Body::Callback(_) => CompletionStyle::Callback,
            Body::Deferred(_) => CompletionStyle::Deferred,
            Body::CallbackDeferred(_) => CompletionStyle::CallbackDeferred,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Body").field(&self.style()).finish()
    }
}

/// Error raised outside a body's own completion path
#[derive(Debug)]
pub(crate) struct Uncaught {
    pub error: TestError,
    /// Runnable the error came from, when known
    pub origin: Option<RunnableId>,
}

/// Sending half of the runner's out-of-band error channel
#[derive(Clone, Debug)]
pub struct UncaughtHandle {
    tx: mpsc::UnboundedSender<Uncaught>,
}

impl UncaughtHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Uncaught>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an error with no owning runnable
    ///
    /// It fails the in-flight runnable, or the whole run when nothing is in
    /// flight.
    pub fn report(&self, error: TestError) {
        self.send(error, None);
    }

    pub(crate) fn send(&self, error: TestError, origin: Option<RunnableId>) {
        if self.tx.send(Uncaught { error, origin }).is_err() {
            debug!("uncaught error after the run finished was dropped");
        }
    }
}

enum Signal {
    Settled(Outcome),
    /// Anything that arrives after the first settlement
    Late(TestError),
    ResetTimer,
    SetTimeout(Duration),
}

struct Resolver {
    id: RunnableId,
    full_title: String,
    calls: AtomicUsize,
    signals: mpsc::UnboundedSender<Signal>,
    uncaught: UncaughtHandle,
}

impl Resolver {
    fn resolve(&self, outcome: Outcome) {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            // The attempt may already have timed out; late settlement is discarded
            let _ = self.signals.send(Signal::Settled(outcome));
            return;
        }
        let err = TestError::multiple_done(&self.full_title, outcome.as_ref().err());
        self.late(err);
    }

    /// Failure that is not a completion signal, such as a panic in a callback body
    fn raise(&self, err: TestError) {
        if self.calls.load(Ordering::SeqCst) == 0 {
            self.resolve(Err(err));
        } else {
            self.late(err);
        }
    }

    fn late(&self, err: TestError) {
        // The attempt is over; fall back to the runner's uncaught channel
        if let Err(mpsc::error::SendError(Signal::Late(err))) =
            self.signals.send(Signal::Late(err))
        {
            self.uncaught.send(err, Some(self.id));
        }
    }
}

/// Completion handle given to callback-style bodies
///
/// Calling it more than once fails the attempt.
#[derive(Clone)]
pub struct Done {
    resolver: Arc<Resolver>,
}

impl Done {
    /// Signal success
    pub fn ok(&self) {
        self.call(None);
    }

    /// Signal failure
    pub fn fail(&self, err: impl Into<TestError>) {
        self.call(Some(err.into()));
    }

    /// `None` passes, `Some` fails
    pub fn call(&self, err: Option<TestError>) {
        self.resolver.resolve(match err {
            None => Ok(()),
            Some(err) => Err(err),
        });
    }

    /// Settle from a result, mapping any error into a failure
    pub fn settle<E: Into<TestError>>(&self, result: Result<(), E>) {
        self.call(result.err().map(Into::into));
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("runnable", &self.resolver.full_title)
            .field("calls", &self.resolver.calls.load(Ordering::SeqCst))
            .finish()
    }
}

struct ContextInner {
    id: RunnableId,
    title: String,
    full_title: String,
    timeout: Duration,
    signals: mpsc::UnboundedSender<Signal>,
    abort: watch::Receiver<bool>,
    uncaught: UncaughtHandle,
}

/// Per-attempt handle passed to every body
///
/// A timeout stops the runner from waiting, it does not stop the body. A
/// deferred body keeps running in the background after its attempt timed
/// out unless it watches [`Context::aborted`] and stops on its own.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn title(&self) -> &str {
        &self.inner.title
    }

    pub fn full_title(&self) -> &str {
        &self.inner.full_title
    }

    /// Configured timeout, `None` when enforcement is disabled
    pub fn timeout(&self) -> Option<Duration> {
        (!self.inner.timeout.is_zero()).then_some(self.inner.timeout)
    }

    /// Re-arm the timer for another full timeout period
    pub fn reset_timer(&self) {
        let _ = self.inner.signals.send(Signal::ResetTimer);
    }

    /// Replace the timeout for the rest of this attempt and re-arm it
    pub fn set_timeout(&self, timeout: Duration) {
        let _ = self.inner.signals.send(Signal::SetTimeout(timeout));
    }

    /// Marker error that turns the current runnable pending
    ///
    /// ```ignore
    /// Body::sync(|ctx| if !feature_enabled() { Err(ctx.skip()) } else { Ok(()) })
    /// ```
    pub fn skip(&self) -> TestError {
        TestError::skip()
    }

    /// Whether this attempt timed out
    pub fn is_aborted(&self) -> bool {
        *self.inner.abort.borrow()
    }

    /// Resolves once the attempt timed out or finished
    pub async fn aborted(&self) {
        let mut rx = self.inner.abort.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawn background work whose failure or panic is attributed to this runnable
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let uncaught = self.inner.uncaught.clone();
        let id = self.inner.id;
        tokio::spawn(async move {
            let result = AssertUnwindSafe(fut).catch_unwind().await;
            let err = match result {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err,
                Err(payload) => TestError::from_panic(payload),
            };
            uncaught.send(err, Some(id));
        })
    }

    /// Report an error that escaped the body's completion path
    pub fn report_uncaught(&self, err: TestError) {
        self.inner.uncaught.send(err, Some(self.inner.id));
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("full_title", &self.inner.full_title)
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

/// Everything needed to execute one attempt
pub(crate) struct AttemptSpec {
    pub id: RunnableId,
    pub title: String,
    pub full_title: String,
    pub body: Body,
    /// `Duration::ZERO` disables the timer
    pub timeout: Duration,
}

pub(crate) struct AttemptResult {
    pub outcome: Outcome,
    pub duration: Duration,
    /// Uncaught errors that belong to other runnables, received while waiting
    pub stray: Vec<Uncaught>,
}

fn arm(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

fn panicked(payload: Box<dyn std::any::Any + Send>) -> TestError {
    TestError::from_panic(payload)
}

/// Execute `spec` once and wait for its completion, timeout or an uncaught error
pub(crate) async fn run_attempt(
    spec: AttemptSpec,
    uncaught: &UncaughtHandle,
    uncaught_rx: &mut mpsc::UnboundedReceiver<Uncaught>,
) -> AttemptResult {
    let (signals, mut rx) = mpsc::unbounded_channel();
    let (abort_tx, abort_rx) = watch::channel(false);

    let ctx = Context {
        inner: Arc::new(ContextInner {
            id: spec.id,
            title: spec.title.clone(),
            full_title: spec.full_title.clone(),
            timeout: spec.timeout,
            signals: signals.clone(),
            abort: abort_rx,
            uncaught: uncaught.clone(),
        }),
    };
    let resolver = Arc::new(Resolver {
        id: spec.id,
        full_title: spec.full_title.clone(),
        calls: AtomicUsize::new(0),
        signals,
        uncaught: uncaught.clone(),
    });

    trace!(runnable = %spec.full_title, style = ?spec.body.style(), "starting attempt");
    let timer = Timer::start(spec.full_title.as_str());

    match &spec.body {
        Body::Sync(f) => {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| f(&ctx))).unwrap_or_else(|p| Err(panicked(p)));
            resolver.resolve(outcome);
        }
        Body::Callback(f) => {
            let done = Done {
                resolver: Arc::clone(&resolver),
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(ctx.clone(), done))) {
                resolver.raise(panicked(payload));
            }
        }
        Body::Deferred(f) => match catch_unwind(AssertUnwindSafe(|| f(ctx.clone()))) {
            Ok(fut) => {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|p| Err(panicked(p)));
                    resolver.resolve(outcome);
                });
            }
            Err(payload) => resolver.resolve(Err(panicked(payload))),
        },
        Body::CallbackDeferred(f) => {
            let done = Done {
                resolver: Arc::clone(&resolver),
            };
            match catch_unwind(AssertUnwindSafe(|| f(ctx.clone(), done))) {
                Ok(fut) => {
                    warn!(
                        runnable = %spec.full_title,
                        "body takes done() and returns a future; the future's result is ignored"
                    );
                    tokio::spawn(async move {
                        let _ = AssertUnwindSafe(fut).catch_unwind().await;
                    });
                }
                Err(payload) => resolver.raise(panicked(payload)),
            }
        }
    }

    let mut timeout = spec.timeout;
    let mut deadline = arm(timeout);
    let mut stray = Vec::new();
    let mut outcome = loop {
        let timer_fired = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            signal = rx.recv() => match signal {
                Some(Signal::Settled(outcome)) => break outcome,
                Some(Signal::Late(err)) => break Err(err),
                Some(Signal::ResetTimer) => deadline = arm(timeout),
                Some(Signal::SetTimeout(new_timeout)) => {
                    timeout = new_timeout;
                    deadline = arm(timeout);
                }
                None => break Err(TestError::new("completion channel closed")),
            },
            Some(uncaught) = uncaught_rx.recv() => match uncaught.origin {
                Some(origin) if origin != spec.id => stray.push(uncaught),
                _ => {
                    debug!(runnable = %spec.full_title, "uncaught error attributed to runnable");
                    break Err(uncaught.error);
                }
            },
            _ = timer_fired => {
                let _ = abort_tx.send(true);
                break Err(TestError::timeout(&spec.full_title, timeout));
            }
        }
    };
    let duration = timer.stop();

    // A blocking body cannot lose the race to the timer
    if outcome.is_ok()
        && spec.body.style() == CompletionStyle::Sync
        && !timeout.is_zero()
        && duration > timeout
    {
        let _ = abort_tx.send(true);
        outcome = Err(TestError::timeout(&spec.full_title, timeout));
    }

    // Give synchronous double-completion a chance to surface before finalizing
    tokio::task::yield_now().await;
    while let Ok(signal) = rx.try_recv() {
        if let Signal::Late(err) = signal {
            let timed_out = matches!(&outcome, Err(e) if e.kind == ErrorKind::Timeout);
            if !timed_out {
                outcome = Err(err);
            }
        }
    }

    AttemptResult {
        outcome,
        duration,
        stray,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(body: Body, timeout_ms: u64) -> AttemptSpec {
        AttemptSpec {
            id: RunnableId(0),
            title: "t".to_string(),
            full_title: "suite t".to_string(),
            body,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn run(body: Body, timeout_ms: u64) -> AttemptResult {
        let (handle, mut rx) = UncaughtHandle::channel();
        run_attempt(spec(body, timeout_ms), &handle, &mut rx).await
    }

    #[tokio::test]
    async fn test_sync_pass_and_fail() {
        assert!(run(Body::sync(|_| Ok(())), 100).await.outcome.is_ok());

        let failed = run(Body::sync(|_| Err("nope".into())), 100).await;
        assert_eq!(failed.outcome.unwrap_err().message, "nope");
    }

    #[tokio::test]
    async fn test_sync_panic_is_failure() {
        let result = run(Body::sync(|_| panic!("kaboom")), 100).await;
        let err = result.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Panic);
        assert_eq!(err.message, "kaboom");
    }

    #[tokio::test]
    async fn test_callback_async_completion() {
        let body = Body::callback(|_, done| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.ok();
            });
        });
        assert!(run(body, 200).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_callback_error_argument_fails() {
        let body = Body::callback(|_, done| done.fail("bad value"));
        assert_eq!(run(body, 100).await.outcome.unwrap_err().message, "bad value");
    }

    #[tokio::test]
    async fn test_double_done_fails_even_when_both_succeed() {
        let body = Body::callback(|_, done| {
            done.ok();
            done.ok();
        });
        let err = run(body, 100).await.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MultipleDone);
    }

    #[tokio::test]
    async fn test_double_done_after_failure_still_fails() {
        let body = Body::callback(|_, done| {
            done.fail("first");
            done.ok();
        });
        let err = run(body, 100).await.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MultipleDone);
    }

    #[tokio::test]
    async fn test_deferred_settlement() {
        let ok = Body::deferred(|_| async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        });
        assert!(run(ok, 100).await.outcome.is_ok());

        let failed = Body::deferred(|_| async { Err(TestError::new("rejected")) });
        assert_eq!(run(failed, 100).await.outcome.unwrap_err().message, "rejected");
    }

    #[tokio::test]
    async fn test_deferred_panic_is_failure() {
        let body = Body::deferred(|_| async { panic!("async boom") });
        assert_eq!(run(body, 100).await.outcome.unwrap_err().kind, ErrorKind::Panic);
    }

    #[tokio::test]
    async fn test_callback_wins_over_returned_future() {
        let body = Body::callback_deferred(|_, done| {
            done.ok();
            async { Err(TestError::new("ignored")) }
        });
        let result = run(body, 100).await;
        assert!(result.outcome.is_ok());
        let style = Body::callback_deferred(|_, _| async { Ok(()) }).style();
        assert_eq!(style, CompletionStyle::CallbackDeferred);
    }

    #[tokio::test]
    async fn test_timeout_when_done_never_called() {
        let body = Body::callback(|_, _done| {});
        let result = run(body, 50).await;
        let err = result.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.timeout_ms, Some(50));
        assert!(result.duration >= Duration::from_millis(50));
        assert!(result.duration < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_timeout_signals_abort() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&seen);
        let body = Body::callback(move |ctx, _done| {
            let observed = Arc::clone(&observed);
            tokio::spawn(async move {
                ctx.aborted().await;
                if ctx.is_aborted() {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            });
        });
        let result = run(body, 20).await;
        assert!(result.outcome.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_timer_extends_deadline() {
        let body = Body::callback(|ctx, done| {
            tokio::spawn(async move {
                for _ in 0..4 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ctx.reset_timer();
                }
                done.ok();
            });
        });
        assert!(run(body, 40).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_sync_overrun_times_out() {
        let body = Body::sync(|_| {
            std::thread::sleep(Duration::from_millis(80));
            Ok(())
        });
        let err = run(body, 20).await.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.timeout_ms, Some(20));

        let unlimited = Body::sync(|_| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(())
        });
        assert!(run(unlimited, 0).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_its_error_when_slow() {
        let body = Body::sync(|_| {
            std::thread::sleep(Duration::from_millis(40));
            Err("wrong answer".into())
        });
        assert_eq!(run(body, 10).await.outcome.unwrap_err().message, "wrong answer");
    }

    #[tokio::test]
    async fn test_set_timeout_extends_deadline() {
        let body = Body::deferred(|ctx| async move {
            ctx.set_timeout(Duration::from_millis(500));
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(())
        });
        assert!(run(body, 20).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_set_timeout_shortens_deadline() {
        let body = Body::callback(|ctx, _done| ctx.set_timeout(Duration::from_millis(15)));
        let result = run(body, 2_000).await;
        let err = result.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.timeout_ms, Some(15));
        assert!(result.duration < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_disabled_timeout_waits() {
        let body = Body::deferred(|ctx| async move {
            assert_eq!(ctx.timeout(), None);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        assert!(run(body, 0).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_spawned_panic_attributed_to_runnable() {
        let body = Body::callback(|ctx, _done| {
            ctx.spawn(async { panic!("background failure") });
        });
        let err = run(body, 500).await.outcome.unwrap_err();
        assert_eq!(err.message, "background failure");
    }

    #[tokio::test]
    async fn test_foreign_uncaught_is_handed_back() {
        let (handle, mut rx) = UncaughtHandle::channel();
        let reporter = handle.clone();
        let body = Body::callback(move |_, done| {
            reporter.send(TestError::new("late from earlier test"), Some(RunnableId(7)));
            done.ok();
        });
        let result = run_attempt(spec(body, 100), &handle, &mut rx).await;
        assert!(result.outcome.is_ok());
        let pending: usize = result.stray.len() + usize::from(rx.try_recv().is_ok());
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_skip_marker() {
        let body = Body::sync(|ctx| Err(ctx.skip()));
        assert!(run(body, 100).await.outcome.unwrap_err().is_skip());
    }
}
