//! Run statistics aggregated from the event stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::bus::Listener;
use crate::models::Event;

/// Counts and timing of one run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub suites: usize,
    pub tests: usize,
    pub passes: usize,
    pub pending: usize,
    pub failures: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl Stats {
    pub fn pass_rate(&self) -> f64 {
        let ran = self.passes + self.failures;
        if ran == 0 {
            0.0
        } else {
            (self.passes as f64 / ran as f64) * 100.0
        }
    }

    pub fn is_all_passed(&self) -> bool {
        self.failures == 0
    }

    fn record(&mut self, event: &Event) {
        match event {
            Event::Start { .. } => self.start = Some(Utc::now()),
            Event::SuiteBegin { suite } if !suite.root => self.suites += 1,
            Event::TestEnd { .. } => self.tests += 1,
            Event::Pass { .. } => self.passes += 1,
            Event::Pending { .. } => self.pending += 1,
            Event::Fail { .. } => self.failures += 1,
            Event::End { .. } => {
                let end = Utc::now();
                self.end = Some(end);
                self.duration_ms = self
                    .start
                    .map(|start| (end - start).num_milliseconds().max(0) as u64);
            }
            _ => {}
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Suites: {} | Tests: {} | Pass: {} | Fail: {} | Pending: {}",
            self.suites, self.tests, self.passes, self.failures, self.pending
        )?;
        if let Some(ms) = self.duration_ms {
            write!(f, " | Duration: {ms}ms")?;
        }
        Ok(())
    }
}

/// Listener that keeps a shared [`Stats`]; clones observe the same counters
#[derive(Clone, Debug, Default)]
pub struct StatsCollector {
    stats: Arc<Mutex<Stats>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Stats {
        self.lock().clone()
    }
}

impl Listener for StatsCollector {
    fn name(&self) -> String {
        "stats".to_string()
    }

    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        self.lock().record(event);
        Ok(())
    }
}
