//! Timing for attempts, runs and per-file laps

use std::time::{Duration, Instant};

/// Measures one labelled span; the label is traced when it stops
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        tracing::trace!(label = %self.label, elapsed_ms, "timer stopped");
        elapsed
    }
}

/// Completion offsets of labelled units, measured from one shared start
#[derive(Debug)]
pub struct Stopwatch {
    start: Instant,
    laps: Vec<(String, Duration)>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            laps: Vec::new(),
        }
    }

    /// Record `label` as finished now and return its offset
    pub fn lap(&mut self, label: impl Into<String>) -> Duration {
        let at = self.start.elapsed();
        self.laps.push((label.into(), at));
        at
    }

    pub fn into_laps(self) -> Vec<(String, Duration)> {
        self.laps
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}
