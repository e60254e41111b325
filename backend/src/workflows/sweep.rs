// Scheduler Sweep - Resumes due scheduled steps and escalates expired approvals

use chrono::Duration;
use ledgerflow_shared::{StepRecord, StepStatus, TaskCategory, TaskPriority};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::engine::{StepProgress, WorkflowEngine};
use super::error::{WorkflowError, WorkflowResult};
use super::services::NewTask;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Scheduled steps claimed and executed
    pub resumed: usize,
    /// Approval steps moved to `timed_out` with an escalation task
    pub escalated: usize,
    /// Running instances advanced past a completed step they had stalled on
    pub recovered: usize,
    /// Rows another actor had already handled
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// How long a completed step may sit as the latest step of a running
/// instance before the sweep advances the instance itself.
pub const STALL_GRACE_MINUTES: i64 = 5;

pub struct SchedulerSweep {
    engine: Arc<WorkflowEngine>,
}

impl SchedulerSweep {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// One pass over both queues. Each row is handled on its own; a failing
    /// row is recorded in the report and the batch continues. Only a failure
    /// to query a queue is returned as an error.
    pub async fn run_once(&self) -> WorkflowResult<SweepReport> {
        let mut report = SweepReport::default();
        let batch_size = self.engine.config().sweep_batch_size;

        let now = self.engine.clock().now();
        let due = self.engine.store().due_scheduled_steps(now, batch_size).await?;
        for step in &due {
            match self.resume_scheduled_step(step).await {
                Ok(true) => report.resumed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(step_id = %step.id, instance_id = %step.instance_id, error = %e, "Failed to resume scheduled step");
                    report.errors.push(format!("step {}: {}", step.id, e));
                }
            }
        }

        let now = self.engine.clock().now();
        let expired = self.engine.store().timed_out_steps(now, batch_size).await?;
        for step in &expired {
            match self.escalate_timed_out_step(step).await {
                Ok(true) => report.escalated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(step_id = %step.id, instance_id = %step.instance_id, error = %e, "Failed to escalate timed-out step");
                    report.errors.push(format!("step {}: {}", step.id, e));
                }
            }
        }

        let cutoff = self.engine.clock().now() - Duration::minutes(STALL_GRACE_MINUTES);
        let stalled = self.engine.store().stalled_steps(cutoff, batch_size).await?;
        for step in &stalled {
            warn!(step_id = %step.id, instance_id = %step.instance_id, "Instance stalled after a completed step; advancing");
            match self.engine.continue_after(step).await {
                Ok(()) => report.recovered += 1,
                Err(e) => {
                    error!(step_id = %step.id, instance_id = %step.instance_id, error = %e, "Failed to advance stalled instance");
                    report.errors.push(format!("step {}: {}", step.id, e));
                }
            }
        }

        info!(
            resumed = report.resumed,
            escalated = report.escalated,
            recovered = report.recovered,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Workflow sweep finished"
        );
        Ok(report)
    }

    /// Claim a due step (`scheduled -> pending`), run it again and advance.
    async fn resume_scheduled_step(&self, step: &StepRecord) -> WorkflowResult<bool> {
        let engine = &self.engine;
        let instance = engine
            .store()
            .get_instance(step.instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(step.instance_id))?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        let Some(definition) = engine.catalog().get(&instance.workflow_id) else {
            let reason = format!("workflow definition '{}' is no longer in the catalog", instance.workflow_id);
            engine.fail_instance(instance.id, &reason).await?;
            return Ok(false);
        };

        let index = step.step_index as usize;
        let step_definition = match definition.steps.get(index) {
            Some(found) if found.kind.name() == step.kind => found,
            _ => {
                let reason = format!(
                    "step {} ('{}') no longer matches workflow definition '{}'",
                    index, step.name, definition.id
                );
                engine.fail_instance(instance.id, &reason).await?;
                return Ok(false);
            }
        };

        let claimed = engine
            .store()
            .update_step_status(step.id, StepStatus::Scheduled, StepStatus::Pending, engine.clock().now())
            .await?;
        if !claimed {
            return Ok(false);
        }

        let record = StepRecord {
            status: StepStatus::Pending,
            scheduled_at: None,
            ..step.clone()
        };

        let progress = match engine.run_step(&instance, step_definition, &record, true).await {
            Ok(progress) => progress,
            Err(e) => {
                self.release_claim(step).await;
                return Err(e);
            }
        };
        if progress == StepProgress::Continue {
            engine.advance(&instance, &definition, index + 1).await?;
        }
        Ok(true)
    }

    /// Hand a claimed step that is still `pending` back to the due queue.
    async fn release_claim(&self, step: &StepRecord) {
        let engine = &self.engine;
        let now = engine.clock().now();
        match engine
            .store()
            .update_step_status(step.id, StepStatus::Pending, StepStatus::Scheduled, now)
            .await
        {
            Ok(true) => info!(step_id = %step.id, "Released claim on step; it will be retried"),
            Ok(false) => {}
            Err(e) => error!(step_id = %step.id, error = %e, "Failed to release claim on step"),
        }
    }

    /// Move an expired approval to `timed_out` and open an urgent escalation task.
    /// The instance is left running. If the task cannot be created the step
    /// goes back to `pending`.
    async fn escalate_timed_out_step(&self, step: &StepRecord) -> WorkflowResult<bool> {
        let engine = &self.engine;
        let now = engine.clock().now();

        let timed_out = engine
            .store()
            .update_step_status(step.id, StepStatus::Pending, StepStatus::TimedOut, now)
            .await?;
        if !timed_out {
            return Ok(false);
        }

        let instance = engine.store().get_instance(step.instance_id).await?;
        let workflow = instance.as_ref().map(|i| i.workflow_id.as_str()).unwrap_or("unknown");

        warn!(
            step_id = %step.id,
            instance_id = %step.instance_id,
            workflow,
            step = %step.name,
            "Workflow approval step timed out"
        );

        let role = engine.config().escalation_role.as_str();
        let assignee_id = match engine.roles().find_active_user_by_role(role).await {
            Ok(assignee) => assignee,
            Err(e) => {
                error!(%role, error = %e, "Escalation role lookup failed");
                None
            }
        };
        if assignee_id.is_none() {
            error!(%role, step_id = %step.id, "No active user holds the escalation role; task left unassigned");
        }

        let mut description = format!(
            "Step '{}' of workflow '{}' (instance {}) passed its deadline without a decision.",
            step.name, workflow, step.instance_id
        );
        if let Some(task_id) = step.related_task_id {
            description.push_str(&format!("\nOriginal approval task: {}", task_id));
        }

        let created = engine
            .tasks()
            .create_task(NewTask {
                title: format!("Workflow Step Timed Out: {}", step.name),
                description,
                priority: TaskPriority::Urgent,
                assignee_id,
                category: TaskCategory::Escalation,
                created_by: engine.config().system_user_id,
                workflow_instance_id: Some(step.instance_id),
            })
            .await;

        let task_id = match created {
            Ok(task_id) => task_id,
            Err(e) => {
                // Back to pending so the next tick escalates again
                if let Err(revert) = engine
                    .store()
                    .update_step_status(step.id, StepStatus::TimedOut, StepStatus::Pending, now)
                    .await
                {
                    error!(step_id = %step.id, error = %revert, "Failed to reopen step after escalation failure");
                }
                return Err(e.into());
            }
        };

        info!(step_id = %step.id, %task_id, "Escalation task created");
        Ok(true)
    }
}
