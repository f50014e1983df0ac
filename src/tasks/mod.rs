//! Worker pool plumbing and progress reporting shared by both phases.

pub mod pool;

use std::time::Instant;
use tracing::info;

use crate::db::RunPhase;

pub use pool::{Command, Job, PoolSettings, Worker, WorkerEvent, WorkerPool};

/// Progress snapshot for a running phase.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub phase: RunPhase,
    pub current: usize,
    pub total: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TaskProgress {
    pub fn new(phase: RunPhase, total: usize) -> Self {
        Self {
            phase,
            current: 0,
            total,
            failed: 0,
            skipped: 0,
        }
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

/// Receives progress snapshots. Called from the coordinating thread only.
pub trait ProgressReporter {
    fn report(&mut self, _progress: &TaskProgress) {}

    fn finished(&mut self, _progress: &TaskProgress) {}
}

/// Discards every update.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// Logs at `info` whenever progress crosses another `step` percent.
#[derive(Debug)]
pub struct LogProgress {
    step: u8,
    last: Option<u8>,
    started: Instant,
}

impl LogProgress {
    pub fn new(step: u8) -> Self {
        Self {
            step: step.max(1),
            last: None,
            started: Instant::now(),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressReporter for LogProgress {
    fn report(&mut self, progress: &TaskProgress) {
        let bucket = progress.percent() / self.step * self.step;
        if self.last.map_or(true, |last| bucket > last) {
            self.last = Some(bucket);
            info!(
                phase = progress.phase.as_str(),
                current = progress.current,
                total = progress.total,
                failed = progress.failed,
                skipped = progress.skipped,
                "{}% done",
                bucket
            );
        }
    }

    fn finished(&mut self, progress: &TaskProgress) {
        info!(
            phase = progress.phase.as_str(),
            current = progress.current,
            total = progress.total,
            failed = progress.failed,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Phase finished"
        );
    }
}
