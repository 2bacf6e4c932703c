//! Parallel suite execution
//!
//! Spreads suite files over worker tasks. Each worker builds its own tree and
//! runs its own [`Runner`]; events travel back as JSON lines and are replayed
//! to the master bus one file at a time, so reporters see each file's events
//! contiguously.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::runner::{AbortHandle, Runner};
use crate::config::RunnerConfig;
use crate::events::{EventBus, Listener, ListenerError, Stats, StatsCollector};
use crate::models::{ErrorKind, Event, RunnableInfo, SuiteTree, TestError};
use crate::utils::{Stopwatch, Timer};

type SuiteFactory = dyn Fn() -> SuiteTree + Send + Sync;

/// A unit of parallel work: a path and the factory that builds its suites
#[derive(Clone)]
pub struct SuiteFile {
    path: String,
    build: Arc<SuiteFactory>,
}

impl SuiteFile {
    pub fn new<F>(path: impl Into<String>, build: F) -> Self
    where
        F: Fn() -> SuiteTree + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            build: Arc::new(build),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for SuiteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteFile").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Line protocol from workers to the coordinator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    FileBegin {
        worker: usize,
        file: String,
    },
    Event {
        worker: usize,
        file: String,
        event: Event,
    },
    FileEnd {
        worker: usize,
        file: String,
        failures: usize,
    },
    Summary {
        worker: usize,
        files: usize,
        failures: usize,
    },
}

impl WorkerMessage {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

#[derive(Debug, Error)]
pub enum ParallelError {
    #[error("{crashed} worker(s) crashed, more than the {tolerance} tolerated")]
    CrashTolerance {
        crashed: usize,
        tolerance: usize,
        failures: usize,
    },
}

/// Outcome of a parallel run
#[derive(Clone, Debug, Serialize)]
pub struct ParallelReport {
    pub failures: usize,
    pub stats: Stats,
    pub listener_errors: Vec<ListenerError>,
    pub crashed_workers: usize,
    /// Completion time of each file, relative to the start of the run
    pub file_laps: Vec<(String, Duration)>,
    pub duration: Duration,
}

impl ParallelReport {
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }
}

/// Forwards a worker runner's events to the coordinator channel
struct Forwarder {
    worker: usize,
    file: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Listener for Forwarder {
    fn name(&self) -> String {
        format!("worker-{}", self.worker)
    }

    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        let line = WorkerMessage::Event {
            worker: self.worker,
            file: self.file.clone(),
            event: event.clone(),
        }
        .to_line()?;
        self.tx
            .send(line)
            .map_err(|_| anyhow::anyhow!("coordinator channel closed"))
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, message: &WorkerMessage) {
    match message.to_line() {
        Ok(line) => {
            if tx.send(line).is_err() {
                debug!("coordinator channel closed, message dropped");
            }
        }
        Err(err) => error!("Failed to serialize worker message: {}", err),
    }
}

async fn run_worker(
    worker: usize,
    files: Vec<SuiteFile>,
    config: RunnerConfig,
    tx: mpsc::UnboundedSender<String>,
    abort: AbortHandle,
) {
    let mut completed = 0;
    let mut failures = 0;

    for file in files {
        if abort.is_aborted() {
            debug!(worker, "aborted, not starting {}", file.path);
            break;
        }
        send(
            &tx,
            &WorkerMessage::FileBegin {
                worker,
                file: file.path.clone(),
            },
        );

        let mut tree = (file.build)();
        tree.assign_file(&file.path);
        let mut runner = Runner::new(tree, config.clone()).with_abort_handle(abort.clone());
        runner.subscribe(Forwarder {
            worker,
            file: file.path.clone(),
            tx: tx.clone(),
        });

        let file_failures = match runner.run().await {
            Ok(report) => report.failures,
            Err(err) => {
                warn!(worker, file = %file.path, "file refused to run: {err}");
                let event = Event::Fail {
                    runnable: RunnableInfo::synthetic(file.path.clone(), Some(file.path.clone())),
                    error: TestError::with_kind(ErrorKind::Forbidden, err.to_string()),
                };
                send(
                    &tx,
                    &WorkerMessage::Event {
                        worker,
                        file: file.path.clone(),
                        event,
                    },
                );
                1
            }
        };

        completed += 1;
        failures += file_failures;
        send(
            &tx,
            &WorkerMessage::FileEnd {
                worker,
                file: file.path,
                failures: file_failures,
            },
        );
    }

    send(
        &tx,
        &WorkerMessage::Summary {
            worker,
            files: completed,
            failures,
        },
    );
}

/// Coordinator-side view of one worker
#[derive(Debug, Default)]
struct WorkerState {
    assigned: Vec<String>,
    finished: usize,
}

/// Round-robin assignment of files to `jobs` workers
fn partition(files: Vec<SuiteFile>, jobs: usize) -> Vec<Vec<SuiteFile>> {
    let jobs = jobs.max(1).min(files.len().max(1));
    let mut buckets: Vec<Vec<SuiteFile>> = (0..jobs).map(|_| Vec::new()).collect();
    for (i, file) in files.into_iter().enumerate() {
        buckets[i % jobs].push(file);
    }
    buckets
}

/// Runs suite files on parallel workers and merges their event streams
///
/// Workers are tokio tasks in the coordinator's own process. A panic that
/// escapes a worker counts as a crash against `worker_crash_tolerance`, but
/// a fault that takes down the process (an abort, a stack overflow) ends
/// the coordinator too and is never reported as a worker crash.
pub struct ParallelCoordinator {
    config: RunnerConfig,
    bus: EventBus,
    stats: StatsCollector,
    abort: AbortHandle,
    workers: Vec<WorkerState>,
    buffers: HashMap<(usize, String), Vec<Event>>,
    failures: usize,
    stopwatch: Stopwatch,
}

impl ParallelCoordinator {
    pub fn new(config: RunnerConfig) -> Self {
        let stats = StatsCollector::new();
        let mut bus = EventBus::new();
        bus.subscribe(stats.clone());
        Self {
            config,
            bus,
            stats,
            abort: AbortHandle::default(),
            workers: Vec::new(),
            buffers: HashMap::new(),
            failures: 0,
            stopwatch: Stopwatch::new(),
        }
    }

    pub fn subscribe(&mut self, listener: impl Listener + 'static) -> &mut Self {
        self.bus.subscribe(listener);
        self
    }

    pub fn stats(&self) -> StatsCollector {
        self.stats.clone()
    }

    /// Stops every worker cooperatively
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run `files` across the configured number of workers
    pub async fn run(mut self, files: Vec<SuiteFile>) -> Result<ParallelReport, ParallelError> {
        let timer = Timer::start("parallel run");
        let assignments = partition(files, self.config.parallel.jobs);
        let tolerance = self.config.parallel.worker_crash_tolerance;
        info!(
            "Running {} files on {} workers",
            assignments.iter().map(Vec::len).sum::<usize>(),
            assignments.len()
        );

        self.bus.emit(Event::Start { total: None });

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut joins = FuturesUnordered::new();
        let mut tasks = Vec::new();
        for (worker, files) in assignments.into_iter().enumerate() {
            self.workers.push(WorkerState {
                assigned: files.iter().map(|f| f.path.clone()).collect(),
                ..Default::default()
            });
            let handle = tokio::spawn(run_worker(
                worker,
                files,
                self.config.clone(),
                tx.clone(),
                self.abort.clone(),
            ));
            tasks.push(handle.abort_handle());
            joins.push(async move { (worker, handle.await) });
        }
        drop(tx);

        let mut crashed = 0;
        loop {
            tokio::select! {
                biased;
                Some(line) = rx.recv() => self.handle_line(&line),
                Some((worker, result)) = joins.next() => {
                    // Everything a finished worker sent is already queued
                    while let Ok(line) = rx.try_recv() {
                        self.handle_line(&line);
                    }
                    if let Err(err) = result {
                        crashed += 1;
                        self.worker_crashed(worker, err);
                        if crashed > tolerance {
                            error!(crashed, tolerance, "too many worker crashes, stopping");
                            self.abort.abort();
                            for task in &tasks {
                                task.abort();
                            }
                            self.bus.emit(Event::End { failures: self.failures });
                            return Err(ParallelError::CrashTolerance {
                                crashed,
                                tolerance,
                                failures: self.failures,
                            });
                        }
                    }
                }
                else => break,
            }
        }

        self.bus.emit(Event::End {
            failures: self.failures,
        });
        let duration = timer.stop();
        let stats = self.stats.snapshot();
        info!(
            "Parallel run completed in {}ms - {}",
            duration.as_millis(),
            stats
        );

        Ok(ParallelReport {
            failures: self.failures,
            stats,
            listener_errors: self.bus.take_errors(),
            crashed_workers: crashed,
            file_laps: self.stopwatch.into_laps(),
            duration,
        })
    }

    fn handle_line(&mut self, line: &str) {
        let message = match WorkerMessage::from_line(line) {
            Ok(message) => message,
            Err(err) => {
                warn!("Discarding malformed worker message: {}", err);
                return;
            }
        };

        match message {
            WorkerMessage::FileBegin { worker, file } => {
                debug!(worker, %file, "file started");
                self.buffers.insert((worker, file), Vec::new());
            }
            WorkerMessage::Event {
                event: Event::Start { .. } | Event::End { .. },
                ..
            } => {}
            WorkerMessage::Event {
                worker,
                file,
                event,
            } => self.buffers.entry((worker, file)).or_default().push(event),
            WorkerMessage::FileEnd {
                worker,
                file,
                failures,
            } => {
                let events = self.buffers.remove(&(worker, file.clone())).unwrap_or_default();
                debug!(worker, %file, failures, events = events.len(), "replaying file");
                for event in events {
                    if let Event::Fail { .. } = event {
                        self.failures += 1;
                    }
                    self.bus.emit(event);
                }
                if let Some(state) = self.workers.get_mut(worker) {
                    state.finished += 1;
                }
                let at = self.stopwatch.lap(&file);
                debug!(worker, %file, at_ms = at.as_millis() as u64, "file complete");
            }
            WorkerMessage::Summary {
                worker,
                files,
                failures,
            } => debug!(worker, files, failures, "worker finished"),
        }
    }

    /// One synthetic failure per file the worker did not finish
    fn worker_crashed(&mut self, worker: usize, err: JoinError) {
        let reason = if err.is_panic() {
            TestError::from_panic(err.into_panic()).message
        } else {
            "worker task was cancelled".to_string()
        };
        warn!(worker, "worker crashed: {reason}");

        let Some(state) = self.workers.get_mut(worker) else {
            return;
        };
        let unfinished: Vec<String> = state.assigned.iter().skip(state.finished).cloned().collect();

        for file in unfinished {
            self.buffers.remove(&(worker, file.clone()));
            let error = TestError::with_kind(
                ErrorKind::WorkerCrash,
                format!("worker {worker} crashed before finishing {file}: {reason}"),
            );
            let runnable = RunnableInfo::synthetic(format!("{file} (worker crash)"), Some(file));
            self.failures += 1;
            self.bus.emit(Event::Fail { runnable, error });
        }
    }
}
