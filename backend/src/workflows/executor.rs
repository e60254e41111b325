// Workflow Executor - Runs one step of a workflow instance
//
// Executors decide what a step does and report it as a StepOutcome. They never
// touch the workflow store; the engine persists the outcome.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ledgerflow_shared::{StepRecord, TaskCategory, TaskPriority, WorkflowInstance};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::{ActionKind, ActionResult, describe_payload, render_template};
use super::catalog::{ActionConfig, ApprovalConfig, DelayConfig, StepKind};
use super::conditions;
use super::error::ExecutorError;
use super::services::{ActionRequest, BusinessActions, NewTask, RoleDirectory, ServiceResult, TaskService};

/// What the engine should do with the step after an executor ran.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step is done; advance to the next one.
    CompletedNow,
    /// The step waits for an out-of-band decision.
    PendingExternal {
        task_id: Option<Uuid>,
        timeout_at: Option<DateTime<Utc>>,
    },
    /// The step is parked until the sweep resumes it at the given time.
    ScheduledFor(DateTime<Utc>),
}

/// Everything an executor may read about the step it runs
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub step: &'a StepRecord,
    pub now: DateTime<Utc>,
    /// True when the sweep resumes a previously scheduled step
    pub resumed: bool,
    /// Recorded as the creator of any task the step opens
    pub acting_user_id: Option<Uuid>,
}

impl ExecutionContext<'_> {
    pub fn payload(&self) -> &Value {
        &self.instance.trigger_payload
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    type Config: Send + Sync;

    async fn execute(&self, config: &Self::Config, ctx: &ExecutionContext<'_>) -> Result<StepOutcome, ExecutorError>;
}

fn offset(now: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, ExecutorError> {
    now.checked_add_signed(by)
        .ok_or_else(|| ExecutorError::InvalidConfig(format!("{:?} past {} is out of range", by, now)))
}

pub struct ApprovalExecutor {
    tasks: Arc<dyn TaskService>,
    roles: Arc<dyn RoleDirectory>,
}

impl ApprovalExecutor {
    pub fn new(tasks: Arc<dyn TaskService>, roles: Arc<dyn RoleDirectory>) -> Self {
        Self { tasks, roles }
    }
}

#[async_trait]
impl StepExecutor for ApprovalExecutor {
    type Config = ApprovalConfig;

    async fn execute(&self, config: &ApprovalConfig, ctx: &ExecutionContext<'_>) -> Result<StepOutcome, ExecutorError> {
        // The deadline is armed even without a task so the sweep escalates the step
        let timeout_at = match config.timeout_hours {
            Some(hours) => Some(offset(ctx.now, Duration::hours(i64::from(hours)))?),
            None => None,
        };

        let assignee = match self.roles.find_active_user_by_role(&config.assignee_role).await {
            Ok(assignee) => assignee,
            Err(e) => {
                error!(role = %config.assignee_role, error = %e, "Role lookup failed");
                None
            }
        };

        let Some(assignee_id) = assignee else {
            error!(
                instance_id = %ctx.instance.id,
                step_id = %ctx.step.id,
                role = %config.assignee_role,
                "No active user holds the approval role; step left pending without a task"
            );
            return Ok(StepOutcome::PendingExternal { task_id: None, timeout_at });
        };

        let title = match &config.title {
            Some(template) => render_template(template, ctx.payload()),
            None => format!("Approval Required: {}", ctx.step.name),
        };
        let description = format!(
            "Workflow '{}' is waiting for approval of step '{}'.\n\n{}",
            ctx.instance.workflow_id,
            ctx.step.name,
            describe_payload(ctx.payload())
        );

        let task = NewTask {
            title,
            description,
            priority: TaskPriority::High,
            assignee_id: Some(assignee_id),
            category: TaskCategory::Approval,
            created_by: ctx.acting_user_id,
            workflow_instance_id: Some(ctx.instance.id),
        };

        match self.tasks.create_task(task).await {
            Ok(task_id) => {
                info!(
                    instance_id = %ctx.instance.id,
                    step_id = %ctx.step.id,
                    %task_id,
                    %assignee_id,
                    "Approval task created"
                );
                Ok(StepOutcome::PendingExternal { task_id: Some(task_id), timeout_at })
            }
            Err(e) => {
                error!(
                    instance_id = %ctx.instance.id,
                    step_id = %ctx.step.id,
                    error = %e,
                    "Failed to create approval task; step left pending without a task"
                );
                Ok(StepOutcome::PendingExternal { task_id: None, timeout_at })
            }
        }
    }
}

pub struct ActionExecutor {
    tasks: Arc<dyn TaskService>,
    roles: Arc<dyn RoleDirectory>,
    actions: Arc<dyn BusinessActions>,
}

impl ActionExecutor {
    pub fn new(tasks: Arc<dyn TaskService>, roles: Arc<dyn RoleDirectory>, actions: Arc<dyn BusinessActions>) -> Self {
        Self { tasks, roles, actions }
    }

    /// Run the side effect now, ignoring any configured delay.
    pub async fn run_action(&self, config: &ActionConfig, ctx: &ExecutionContext<'_>) -> ServiceResult<ActionResult> {
        if !conditions::evaluate(&config.conditions, ctx.payload()) {
            info!(
                instance_id = %ctx.instance.id,
                step = %ctx.step.name,
                action = %config.action,
                "Action conditions not met; skipping"
            );
            return Ok(ActionResult::skipped(&config.action, "conditions not met"));
        }

        let Some(kind) = ActionKind::from_name(&config.action) else {
            warn!(
                instance_id = %ctx.instance.id,
                step = %ctx.step.name,
                action = %config.action,
                "Unknown workflow action; treating as no-op"
            );
            return Ok(ActionResult::skipped(&config.action, "unknown action"));
        };

        let start = Instant::now();
        let request = ActionRequest {
            instance: ctx.instance,
            step_name: &ctx.step.name,
            acting_user_id: ctx.acting_user_id,
        };

        let output = match kind {
            ActionKind::CreateTask => self.create_task(config, ctx).await?,
            ActionKind::SchedulePayment => self.actions.schedule_payment(&request).await?,
            ActionKind::SendPortalInvite => self.actions.send_portal_invite(&request).await?,
            ActionKind::RequireApproval => self.actions.require_approval(&request).await?,
        };

        Ok(ActionResult::success(kind.as_str(), Some(output)).with_duration(start.elapsed().as_millis() as i64))
    }

    async fn create_task(&self, config: &ActionConfig, ctx: &ExecutionContext<'_>) -> ServiceResult<Value> {
        let assignee_id = match &config.assignee_role {
            Some(role) => self.roles.find_active_user_by_role(role).await?,
            None => None,
        };

        let title = match &config.task_title {
            Some(template) => render_template(template, ctx.payload()),
            None => format!("Workflow Task: {}", ctx.step.name),
        };

        let task_id = self
            .tasks
            .create_task(NewTask {
                title,
                description: describe_payload(ctx.payload()),
                priority: config.task_priority.unwrap_or_default(),
                assignee_id,
                category: TaskCategory::Workflow,
                created_by: ctx.acting_user_id,
                workflow_instance_id: Some(ctx.instance.id),
            })
            .await?;

        Ok(serde_json::json!({ "task_id": task_id, "assignee_id": assignee_id }))
    }
}

#[async_trait]
impl StepExecutor for ActionExecutor {
    type Config = ActionConfig;

    async fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext<'_>) -> Result<StepOutcome, ExecutorError> {
        if config.delay_days > 0 && !ctx.resumed {
            let at = offset(ctx.now, Duration::days(i64::from(config.delay_days)))?;
            return Ok(StepOutcome::ScheduledFor(at));
        }

        let result = self
            .run_action(config, ctx)
            .await
            .map_err(|source| ExecutorError::Action {
                action: config.action.clone(),
                source,
            })?;

        debug!(
            instance_id = %ctx.instance.id,
            step = %ctx.step.name,
            action = %result.action,
            skipped = result.skipped,
            duration_ms = result.duration_ms,
            "Workflow action executed"
        );
        Ok(StepOutcome::CompletedNow)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DelayExecutor;

#[async_trait]
impl StepExecutor for DelayExecutor {
    type Config = DelayConfig;

    async fn execute(&self, config: &DelayConfig, ctx: &ExecutionContext<'_>) -> Result<StepOutcome, ExecutorError> {
        if ctx.resumed {
            return Ok(StepOutcome::CompletedNow);
        }
        let at = offset(ctx.now, Duration::days(i64::from(config.delay_days)))?;
        Ok(StepOutcome::ScheduledFor(at))
    }
}

/// Dispatches a step to the executor for its kind.
pub struct WorkflowExecutor {
    approval: ApprovalExecutor,
    action: ActionExecutor,
    delay: DelayExecutor,
}

impl WorkflowExecutor {
    pub fn new(tasks: Arc<dyn TaskService>, roles: Arc<dyn RoleDirectory>, actions: Arc<dyn BusinessActions>) -> Self {
        Self {
            approval: ApprovalExecutor::new(tasks.clone(), roles.clone()),
            action: ActionExecutor::new(tasks, roles, actions),
            delay: DelayExecutor,
        }
    }

    pub async fn execute(&self, kind: &StepKind, ctx: &ExecutionContext<'_>) -> Result<StepOutcome, ExecutorError> {
        match kind {
            StepKind::Approval(config) => self.approval.execute(config, ctx).await,
            StepKind::Action(config) => self.action.execute(config, ctx).await,
            StepKind::Delay(config) => self.delay.execute(config, ctx).await,
        }
    }
}
