//! Run progress and time-remaining estimates.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Number of recent per-patch durations the estimate averages over.
pub const HISTORY_LIMIT: usize = 32;

/// Estimated time remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    /// Nothing has been measured yet.
    Indeterminate,
    Remaining(Duration),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Indeterminate => write!(f, "calculating..."),
            Eta::Remaining(remaining) => write!(f, "{}", format_duration(*remaining)),
        }
    }
}

/// Format as `42s` or `3m 7s`.
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    total: usize,
    current: usize,
    history: VecDeque<Duration>,
}

impl ProgressState {
    pub fn new(total: usize) -> Self {
        ProgressState {
            total,
            current: 0,
            history: VecDeque::with_capacity(HISTORY_LIMIT.min(total)),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current += 1;
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(elapsed);
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }

    /// Rolling average of recorded durations times the patches left.
    pub fn eta(&self) -> Eta {
        if self.history.is_empty() {
            return Eta::Indeterminate;
        }
        let sum: Duration = self.history.iter().sum();
        let average = sum / self.history.len() as u32;
        let remaining = self.total.saturating_sub(self.current) as u32;
        Eta::Remaining(average * remaining)
    }
}

/// What a renderer gets to see on each update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressView<'a> {
    pub current: usize,
    pub total: usize,
    /// The patch that was just processed, if any.
    pub item: Option<&'a str>,
    pub eta: Eta,
}

impl ProgressView<'_> {
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            (self.current * 100 / self.total).min(100)
        }
    }
}

/// A projection of progress onto some display.
pub trait ProgressSink {
    fn render(&mut self, view: ProgressView<'_>);

    /// Called once after the last update.
    fn finish(&mut self) {}
}

/// Renders nothing. Used headless and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn render(&mut self, _view: ProgressView<'_>) {}
}
