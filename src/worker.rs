//! Scheduler: runs ticks one after another until stopped.
//!
//! - `Once` runs a single tick and stops, whatever the outcome
//! - `Continuous` sleeps a fixed interval after every tick
//! - Cancellation interrupts the sleep and abandons an in-flight tick
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::pipeline::{Pipeline, TickOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Continuous { poll_interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Ticking,
    Stopped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: usize,
    pub last_outcome: Option<TickOutcome>,
}

#[derive(Debug)]
pub struct Worker {
    mode: RunMode,
    state: WorkerState,
}

impl Worker {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Drive the pipeline. A new tick only starts after the previous one,
    /// including its cursor write, has completed. Returns an error only for a
    /// stale cursor write, which means another writer shares the store.
    pub async fn run(
        &mut self,
        pipeline: &Pipeline,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        info!(mode = ?self.mode, "worker started");
        let mut summary = RunSummary::default();

        while !shutdown.is_cancelled() {
            self.state = WorkerState::Ticking;
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, abandoning in-flight tick");
                    None
                }
                result = pipeline.tick() => Some(result),
            };
            match result {
                None => break,
                Some(Ok(report)) => {
                    summary.ticks += 1;
                    summary.last_outcome = Some(report.outcome);
                }
                Some(Err(err)) => {
                    self.state = WorkerState::Stopped;
                    return Err(err);
                }
            }

            let poll_interval = match self.mode {
                RunMode::Once => break,
                RunMode::Continuous { poll_interval } => poll_interval,
            };
            self.state = WorkerState::Idle;
            debug!(?poll_interval, "sleeping until next tick");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        self.state = WorkerState::Stopped;
        info!(ticks = summary.ticks, "worker stopped");
        Ok(summary)
    }
}
