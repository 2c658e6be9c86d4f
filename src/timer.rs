//! Wall-clock phase timing for render stats.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Records the duration of named phases of a render.
///
/// `start` followed by `end` records the elapsed wall-clock time under the
/// label; starting the same label again restarts it, and ending a label
/// that was never started is a no-op.
#[derive(Debug, Default)]
pub struct Timer {
    pending: HashMap<String, Instant>,
    times: HashMap<String, Duration>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, label: &str) {
        self.pending.insert(label.to_string(), Instant::now());
    }

    pub fn end(&mut self, label: &str) {
        if let Some(started) = self.pending.remove(label) {
            self.times.insert(label.to_string(), started.elapsed());
        }
    }

    /// Consumes the timer, yielding the recorded phase durations.
    pub fn into_times(self) -> HashMap<String, Duration> {
        self.times
    }
}
