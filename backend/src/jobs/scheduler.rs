// Job Scheduler - Central scheduler for all background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::WorkflowSweepJob;
use crate::workflows::{SweepReport, WorkflowEngine, WorkflowError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Workflow error: {0}")]
    WorkflowError(#[from] WorkflowError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Job already running: {0}")]
    AlreadyRunning(String),
}

pub type JobResult<T> = Result<T, JobError>;

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub workflow_sweep_enabled: bool,
    pub workflow_sweep_interval_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workflow_sweep_enabled: true,
            workflow_sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

impl JobExecutionLog {
    fn from_sweep(job_name: &str, started_at: DateTime<Utc>, outcome: &JobResult<SweepReport>) -> Self {
        let completed_at = Utc::now();
        let (status, items_processed, errors) = match outcome {
            Ok(report) => (
                if report.is_clean() { JobStatus::Completed } else { JobStatus::PartialFailure },
                (report.resumed + report.escalated + report.recovered) as i32,
                report.errors.clone(),
            ),
            Err(e) => (JobStatus::Failed, 0, vec![e.to_string()]),
        };

        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at,
            completed_at: Some(completed_at),
            status,
            items_processed,
            errors,
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
        }
    }
}

/// Six-field cron expression (seconds first) that fires every `secs` seconds.
/// The interval has to divide evenly into a minute, an hour or a day.
pub fn cron_for_interval(secs: u64) -> JobResult<String> {
    let invalid = || JobError::ConfigError(format!("unsupported sweep interval of {} seconds", secs));

    match secs {
        0 => Err(invalid()),
        s if s < 60 && 60 % s == 0 => Ok(format!("*/{} * * * * *", s)),
        s if s % 60 == 0 && s < 3600 && 60 % (s / 60) == 0 => Ok(format!("0 */{} * * * *", s / 60)),
        s if s % 3600 == 0 && s < 86_400 && 24 % (s / 3600) == 0 => Ok(format!("0 0 */{} * * *", s / 3600)),
        86_400 => Ok("0 0 0 * * *".to_string()),
        _ => Err(invalid()),
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    sweep_job: Arc<WorkflowSweepJob>,
    config: JobConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub async fn new(engine: Arc<WorkflowEngine>, config: JobConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            sweep_job: Arc::new(WorkflowSweepJob::new(engine)),
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_workflow_sweep().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_workflow_sweep(&self) -> JobResult<()> {
        if !self.config.workflow_sweep_enabled {
            info!("Workflow sweep is disabled, skipping");
            return Ok(());
        }

        let interval = self.config.workflow_sweep_interval_secs;
        let cron_expr = cron_for_interval(interval)?;

        let sweep_job = self.sweep_job.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let sweep_job = sweep_job.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let started_at = Utc::now();

                let outcome = match sweep_job.run().await {
                    Ok(Some(report)) => Ok(report),
                    Ok(None) => return,
                    Err(e) => Err(e),
                };

                if let Err(e) = &outcome {
                    error!("Workflow sweep failed: {}", e);
                }

                let log = JobExecutionLog::from_sweep(WorkflowSweepJob::NAME, started_at, &outcome);
                record_log(&logs, log).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled workflow sweep to run every {} seconds", interval);

        Ok(())
    }

    /// The sweep job shared by scheduled ticks and manual runs.
    pub fn sweep_job(&self) -> Arc<WorkflowSweepJob> {
        self.sweep_job.clone()
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        match job_name {
            WorkflowSweepJob::NAME => {
                let started_at = Utc::now();
                let outcome = match self.sweep_job.run().await {
                    Ok(Some(report)) => Ok(report),
                    Ok(None) => return Err(JobError::AlreadyRunning(job_name.to_string())),
                    Err(e) => Err(e),
                };
                let log = JobExecutionLog::from_sweep(job_name, started_at, &outcome);
                record_log(&self.execution_logs, log).await;
                outcome?;
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }

        Ok(())
    }
}

async fn record_log(logs: &RwLock<Vec<JobExecutionLog>>, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > MAX_EXECUTION_LOGS {
        logs.remove(0);
    }
}
