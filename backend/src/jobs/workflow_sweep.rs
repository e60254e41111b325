// Workflow Sweep Job - Periodic resumption of suspended workflow steps

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use super::scheduler::JobResult;
use crate::workflows::{SchedulerSweep, SweepReport, WorkflowEngine};

pub struct WorkflowSweepJob {
    sweep: SchedulerSweep,
    running: AtomicBool,
}

/// Clears the running flag however the sweep ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WorkflowSweepJob {
    pub const NAME: &'static str = "workflow_sweep";

    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self {
            sweep: SchedulerSweep::new(engine),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep. Returns `None` if another run is still in progress.
    pub async fn run(&self) -> JobResult<Option<SweepReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Previous workflow sweep still running; skipping this tick");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        info!("Running workflow sweep job");
        let report = self.sweep.run_once().await?;
        Ok(Some(report))
    }
}
