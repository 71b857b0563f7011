//! Readiness detection
//!
//! Backends do not signal readiness on their own; the only evidence is their
//! log output. A [`ReadinessWatcher`] polls the line stream of a freshly
//! spawned process for success and failure markers, bounded by a
//! [`PollPolicy`].

use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::debug;

/// Substrings that decide a backend's fate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Markers {
    /// Any of these means the backend is ready
    pub started: &'static [&'static str],
    /// Any of these means the backend gave up
    pub failed: &'static [&'static str],
}

impl Markers {
    pub const fn new(started: &'static [&'static str], failed: &'static [&'static str]) -> Self {
        Self { started, failed }
    }

    /// Outcome decided by a single line, if any
    pub fn classify(&self, line: &str) -> Option<Readiness> {
        if self.started.iter().any(|marker| line.contains(marker)) {
            Some(Readiness::Ready)
        } else if self.failed.iter().any(|marker| line.contains(marker)) {
            Some(Readiness::Failed(line.to_string()))
        } else {
            None
        }
    }
}

/// Fixed-interval, bounded polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    /// Upper bound of a watch
    pub fn budget(&self) -> Duration {
        self.interval
            .checked_mul(self.max_polls)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 200)
    }
}

/// Result of watching a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// A started marker was seen
    Ready,
    /// A failure marker was seen; holds the offending line
    Failed(String),
    /// Output ended before any marker, the process is gone
    Exited,
    /// The poll budget ran out
    TimedOut,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Watches one process' output for readiness markers
#[derive(Debug, Clone)]
pub struct ReadinessWatcher {
    markers: Markers,
    policy: PollPolicy,
}

impl ReadinessWatcher {
    pub fn new(markers: Markers, policy: PollPolicy) -> Self {
        Self { markers, policy }
    }

    /// Poll `lines` until a marker decides the outcome or the budget runs out
    pub async fn watch(&self, lines: &mut mpsc::UnboundedReceiver<String>) -> Readiness {
        for _ in 0..self.policy.max_polls {
            if let Some(outcome) = self.drain(lines) {
                return outcome;
            }
            tokio::time::sleep(self.policy.interval).await;
        }

        self.drain(lines).unwrap_or(Readiness::TimedOut)
    }

    fn drain(&self, lines: &mut mpsc::UnboundedReceiver<String>) -> Option<Readiness> {
        loop {
            match lines.try_recv() {
                Ok(line) => {
                    if let Some(outcome) = self.markers.classify(&line) {
                        debug!("Readiness decided by {:?}: {:?}", line, outcome);
                        return Some(outcome);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(Readiness::Exited),
            }
        }
    }
}
