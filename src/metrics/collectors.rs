//! Recording helpers over the raw Prometheus metrics.

use std::time::Duration;

use super::prometheus::{
    ACQUIRE_WAIT, ALIVE_WORKERS, DISPATCH_TOTAL, RESPAWNS_TOTAL, WORKER_DEATHS_TOTAL,
};

/// How a split was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// No tokens, no worker call.
    Empty,
    /// No pool: source tokens copied.
    Passthrough,
    /// No pool: top suggestion copied.
    Suggestion,
    /// Perfect match, alignment-only call.
    Align,
    /// Translate with suggestion hints.
    Hinted,
    /// Translate without hints.
    Plain,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Empty => "empty",
            DispatchMode::Passthrough => "passthrough",
            DispatchMode::Suggestion => "suggestion",
            DispatchMode::Align => "align",
            DispatchMode::Hinted => "hinted",
            DispatchMode::Plain => "plain",
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one relaunch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnOutcome {
    Success,
    Failure,
    /// All attempts used up; the slot stays empty.
    Exhausted,
}

impl RespawnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RespawnOutcome::Success => "success",
            RespawnOutcome::Failure => "failure",
            RespawnOutcome::Exhausted => "exhausted",
        }
    }
}

/// Metrics collector for pool and scheduler events.
///
/// Every method is a no-op before `init_metrics()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn set_alive_workers(&self, alive: usize) {
        if let Some(gauge) = ALIVE_WORKERS.get() {
            gauge.set(alive as f64);
        }
    }

    pub fn record_worker_death(&self) {
        if let Some(counter) = WORKER_DEATHS_TOTAL.get() {
            counter.inc();
        }
    }

    pub fn record_respawn(&self, outcome: RespawnOutcome) {
        if let Some(counter) = RESPAWNS_TOTAL.get() {
            counter.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    pub fn record_dispatch(&self, mode: DispatchMode) {
        if let Some(counter) = DISPATCH_TOTAL.get() {
            counter.with_label_values(&[mode.as_str()]).inc();
        }
        tracing::trace!(mode = mode.as_str(), "Recorded dispatch metric");
    }

    pub fn record_acquire_wait(&self, wait: Duration) {
        if let Some(histogram) = ACQUIRE_WAIT.get() {
            histogram.observe(wait.as_secs_f64());
        }
    }
}
