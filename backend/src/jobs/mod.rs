// Background Jobs Service
//
// Scheduled background work for the ledger. Jobs are registered with
// tokio-cron-scheduler and run on a fixed cadence.

pub mod scheduler;
pub mod workflow_sweep;

pub use scheduler::{JobConfig, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
pub use workflow_sweep::WorkflowSweepJob;
