//! In-memory run state shared by the poll loop and dispatched jobs.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Built, not started.
    Idle,
    /// Running reconciliation passes before the first poll.
    Starting,
    Running,
    /// Stop requested; no new claims, waiting for in-flight jobs.
    Stopping,
    /// In-flight jobs finished or the drain timed out.
    Drained,
    Stopped,
}

/// Counters for one worker lifetime.
#[derive(Debug, Default)]
pub struct RunState {
    /// Consecutive cycles that claimed nothing.
    pub idle_count: AtomicU64,
    pub poll_count: AtomicU64,
    pub dispatched: AtomicU64,
    pub resolved: AtomicU64,
    /// Consecutive poll-loop faults; reset by any clean cycle.
    pub consecutive_faults: AtomicU32,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the cycle counter and return the new value.
    pub(crate) fn next_poll(&self) -> u64 {
        self.poll_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record an empty cycle and return the idle streak length.
    pub(crate) fn record_idle(&self) -> u64 {
        self.idle_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_dispatch(&self) {
        self.idle_count.store(0, Ordering::Relaxed);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resolution(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) -> u32 {
        self.consecutive_faults.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn clear_faults(&self) {
        self.consecutive_faults.store(0, Ordering::Release);
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub state: WorkerState,
    pub active_jobs: usize,
    pub idle_count: u64,
    pub poll_count: u64,
    pub dispatched: u64,
    pub resolved: u64,
    pub consecutive_faults: u32,
}

impl WorkerStats {
    pub(crate) fn capture(state: WorkerState, active_jobs: usize, run: &RunState) -> Self {
        Self {
            state,
            active_jobs,
            idle_count: run.idle_count.load(Ordering::Relaxed),
            poll_count: run.poll_count.load(Ordering::Relaxed),
            dispatched: run.dispatched.load(Ordering::Relaxed),
            resolved: run.resolved.load(Ordering::Relaxed),
            consecutive_faults: run.consecutive_faults.load(Ordering::Acquire),
        }
    }
}
