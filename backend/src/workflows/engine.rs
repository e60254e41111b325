// Workflow Engine - Dispatches events into instances and advances them step by step

use ledgerflow_shared::{
    ApprovalDecision, InstanceDetail, InstanceStatus, InstanceSummary, StepKindName, StepRecord,
    StepStatus, WorkflowInstance, WorkflowStats,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::{FailurePolicy, StepDefinition, StepKind, WorkflowCatalog, WorkflowDefinition};
use super::clock::Clock;
use super::conditions;
use super::error::{ExecutorError, WorkflowError, WorkflowResult};
use super::executor::{ExecutionContext, StepOutcome, WorkflowExecutor};
use super::services::{BusinessActions, RoleDirectory, TaskService};
use super::store::{NewStepRecord, NewWorkflowInstance, WorkflowStore};
use super::triggers::TriggerEvent;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Role that receives escalation tasks for timed-out approvals
    pub escalation_role: String,
    /// Creator of engine-made tasks when the triggering event had no acting user
    pub system_user_id: Option<Uuid>,
    pub default_failure_policy: FailurePolicy,
    pub sweep_batch_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            escalation_role: "admin".to_string(),
            system_user_id: None,
            default_failure_policy: FailurePolicy::FailOpen,
            sweep_batch_size: 100,
        }
    }
}

/// External systems the engine calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: Arc<dyn TaskService>,
    pub roles: Arc<dyn RoleDirectory>,
    pub actions: Arc<dyn BusinessActions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub event_type: String,
    /// Definitions listening for the event type
    pub matched: usize,
    /// Instances created, in catalog order
    pub instances: Vec<Uuid>,
    /// Definitions whose conditions did not hold
    pub skipped: Vec<String>,
    /// Definitions that could not be started
    pub failed: Vec<String>,
}

/// Whether the caller should move on to the next step index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StepProgress {
    Continue,
    Halt,
}

pub struct WorkflowEngine {
    catalog: Arc<WorkflowCatalog>,
    store: Arc<dyn WorkflowStore>,
    executor: WorkflowExecutor,
    tasks: Arc<dyn TaskService>,
    roles: Arc<dyn RoleDirectory>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        catalog: Arc<WorkflowCatalog>,
        store: Arc<dyn WorkflowStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let executor = WorkflowExecutor::new(
            collaborators.tasks.clone(),
            collaborators.roles.clone(),
            collaborators.actions,
        );

        Self {
            catalog,
            store,
            executor,
            tasks: collaborators.tasks,
            roles: collaborators.roles,
            clock,
            config,
        }
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(super) fn store(&self) -> &dyn WorkflowStore {
        self.store.as_ref()
    }

    pub(super) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Start every matching workflow for an event fired without an acting user.
    pub async fn dispatch(&self, event_type: &str, payload: Value) -> WorkflowResult<DispatchReport> {
        self.dispatch_as(event_type, payload, None).await
    }

    pub async fn dispatch_event(&self, event: TriggerEvent) -> WorkflowResult<DispatchReport> {
        let acting_user = event.source.acting_user();
        self.dispatch_as(&event.event_type, event.payload, acting_user).await
    }

    /// Start every definition whose trigger and conditions match.
    ///
    /// Definitions are isolated from one another: a failure starting one is
    /// logged and the rest still run. If any of them failed the first error is
    /// returned once all have been attempted.
    pub async fn dispatch_as(
        &self,
        event_type: &str,
        payload: Value,
        acting_user: Option<Uuid>,
    ) -> WorkflowResult<DispatchReport> {
        let (report, first_error) = self.run_dispatch(event_type, &payload, acting_user).await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Dispatch for callers that treat workflow automation as best-effort:
    /// errors are logged and never reach the business action that fired the
    /// event. Definitions that could not be started are listed in `failed`.
    pub async fn dispatch_best_effort(&self, event: TriggerEvent) -> DispatchReport {
        let acting_user = event.source.acting_user();
        let (report, first_error) = self.run_dispatch(&event.event_type, &event.payload, acting_user).await;
        if let Some(e) = first_error {
            error!(event_type = %event.event_type, error = %e, "Workflow dispatch failed; continuing without automation");
        }
        report
    }

    async fn run_dispatch(
        &self,
        event_type: &str,
        payload: &Value,
        acting_user: Option<Uuid>,
    ) -> (DispatchReport, Option<WorkflowError>) {
        let definitions = self.catalog.match_event(event_type);
        let mut report = DispatchReport {
            event_type: event_type.to_string(),
            matched: definitions.len(),
            ..Default::default()
        };
        let mut first_error = None;

        for definition in definitions {
            if !conditions::evaluate(&definition.conditions, payload) {
                debug!(workflow = %definition.id, event_type, "Workflow conditions not met");
                report.skipped.push(definition.id.clone());
                continue;
            }

            match self.start_instance(definition, event_type, payload, acting_user).await {
                Ok(instance_id) => report.instances.push(instance_id),
                Err(e) => {
                    error!(workflow = %definition.id, event_type, error = %e, "Failed to start workflow");
                    report.failed.push(definition.id.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            event_type,
            matched = report.matched,
            started = report.instances.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Workflow event dispatched"
        );

        (report, first_error)
    }

    async fn start_instance(
        &self,
        definition: &WorkflowDefinition,
        event_type: &str,
        payload: &Value,
        acting_user: Option<Uuid>,
    ) -> WorkflowResult<Uuid> {
        let instance = self
            .store
            .insert_instance(
                NewWorkflowInstance {
                    workflow_id: definition.id.clone(),
                    event_type: event_type.to_string(),
                    trigger_payload: payload.clone(),
                    created_by: acting_user,
                },
                self.clock.now(),
            )
            .await?;

        info!(instance_id = %instance.id, workflow = %definition.id, "Workflow instance started");

        self.advance(&instance, definition, 0).await?;
        Ok(instance.id)
    }

    /// Run steps from `start_index` until one suspends or the definition is exhausted.
    pub(super) async fn advance(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        start_index: usize,
    ) -> WorkflowResult<()> {
        for (index, step_definition) in definition.steps.iter().enumerate().skip(start_index) {
            let record = self
                .store
                .insert_step(
                    NewStepRecord {
                        instance_id: instance.id,
                        step_index: index as i32,
                        name: step_definition.name.clone(),
                        kind: step_definition.kind.name(),
                    },
                    self.clock.now(),
                )
                .await?;

            let Some(record) = record else {
                warn!(
                    instance_id = %instance.id,
                    step_index = index,
                    "Step record already exists; instance was advanced elsewhere"
                );
                return Ok(());
            };

            if self.run_step(instance, step_definition, &record, false).await? == StepProgress::Halt {
                return Ok(());
            }
        }

        let now = self.clock.now();
        if self
            .store
            .update_instance_status(instance.id, InstanceStatus::Running, InstanceStatus::Completed, None, now)
            .await?
        {
            info!(instance_id = %instance.id, workflow = %definition.id, "Workflow instance completed");
        }
        Ok(())
    }

    /// Execute a `pending` step and persist what the executor decided.
    pub(super) async fn run_step(
        &self,
        instance: &WorkflowInstance,
        step_definition: &StepDefinition,
        record: &StepRecord,
        resumed: bool,
    ) -> WorkflowResult<StepProgress> {
        let ctx = ExecutionContext {
            instance,
            step: record,
            now: self.clock.now(),
            resumed,
            acting_user_id: instance.created_by.or(self.config.system_user_id),
        };

        let outcome = match self.executor.execute(&step_definition.kind, &ctx).await {
            Ok(outcome) => outcome,
            Err(ExecutorError::InvalidConfig(reason)) => {
                error!(instance_id = %instance.id, step_id = %record.id, %reason, "Unrecoverable step configuration");
                self.fail_instance(instance.id, &reason).await?;
                return Ok(StepProgress::Halt);
            }
            Err(err) => match self.failure_policy(step_definition) {
                FailurePolicy::FailOpen => {
                    error!(
                        instance_id = %instance.id,
                        step_id = %record.id,
                        error = %err,
                        "Workflow action failed; completing step under fail-open policy"
                    );
                    StepOutcome::CompletedNow
                }
                FailurePolicy::FailClosed => {
                    error!(
                        instance_id = %instance.id,
                        step_id = %record.id,
                        error = %err,
                        "Workflow action failed; failing instance under fail-closed policy"
                    );
                    self.fail_instance(instance.id, &err.to_string()).await?;
                    return Ok(StepProgress::Halt);
                }
            },
        };

        self.apply_outcome(record, outcome).await
    }

    fn failure_policy(&self, step_definition: &StepDefinition) -> FailurePolicy {
        match &step_definition.kind {
            StepKind::Action(config) => config.on_error.unwrap_or(self.config.default_failure_policy),
            _ => self.config.default_failure_policy,
        }
    }

    async fn apply_outcome(&self, record: &StepRecord, outcome: StepOutcome) -> WorkflowResult<StepProgress> {
        match outcome {
            StepOutcome::CompletedNow => {
                let completed = self
                    .store
                    .update_step_status(record.id, StepStatus::Pending, StepStatus::Completed, self.clock.now())
                    .await?;
                if completed {
                    Ok(StepProgress::Continue)
                } else {
                    debug!(step_id = %record.id, "Step was transitioned by another actor");
                    Ok(StepProgress::Halt)
                }
            }
            StepOutcome::PendingExternal { task_id, timeout_at } => {
                self.store.attach_approval(record.id, task_id, timeout_at).await?;
                Ok(StepProgress::Halt)
            }
            StepOutcome::ScheduledFor(at) => {
                self.store
                    .update_step_status(record.id, StepStatus::Pending, StepStatus::Scheduled, at)
                    .await?;
                debug!(step_id = %record.id, scheduled_at = %at, "Step scheduled");
                Ok(StepProgress::Halt)
            }
        }
    }

    pub(super) async fn fail_instance(&self, instance_id: Uuid, reason: &str) -> WorkflowResult<()> {
        let failed = self
            .store
            .update_instance_status(
                instance_id,
                InstanceStatus::Running,
                InstanceStatus::Failed,
                Some(reason),
                self.clock.now(),
            )
            .await?;
        if failed {
            warn!(%instance_id, %reason, "Workflow instance failed");
        }
        Ok(())
    }

    /// Record a human decision on a pending approval step and move the instance on.
    ///
    /// Returns `false` when the step had already been resolved or timed out;
    /// the decision is then ignored. Both decisions advance the instance.
    pub async fn resolve_approval(&self, step_id: Uuid, decision: ApprovalDecision) -> WorkflowResult<bool> {
        let step = self
            .store
            .get_step(step_id)
            .await?
            .ok_or(WorkflowError::StepNotFound(step_id))?;

        if step.kind != StepKindName::Approval {
            return Err(WorkflowError::NotAnApproval(step_id));
        }

        let resolved = self
            .store
            .complete_approval(step_id, decision, self.clock.now())
            .await?;
        if !resolved {
            info!(%step_id, status = %step.status, "Approval already settled; ignoring decision");
            self.catch_up_after_approval(&step).await?;
            return Ok(false);
        }

        info!(%step_id, instance_id = %step.instance_id, decision = %decision.as_str(), "Approval resolved");
        self.continue_after(&step).await?;
        Ok(true)
    }

    /// A completed approval whose instance never got past it is advanced again.
    /// Timed-out approvals stay where they are.
    async fn catch_up_after_approval(&self, step: &StepRecord) -> WorkflowResult<()> {
        let Some(current) = self.store.get_step(step.id).await? else {
            return Ok(());
        };
        if current.status != StepStatus::Completed {
            return Ok(());
        }

        let running = self
            .store
            .get_instance(step.instance_id)
            .await?
            .is_some_and(|i| i.status == InstanceStatus::Running);
        if !running {
            return Ok(());
        }

        let steps = self.store.list_steps(step.instance_id).await?;
        if steps.iter().any(|s| s.step_index > step.step_index) {
            return Ok(());
        }

        warn!(step_id = %step.id, instance_id = %step.instance_id, "Approval completed but instance never advanced; resuming");
        self.continue_after(&current).await
    }

    /// Advance a running instance past an already completed step.
    pub(super) async fn continue_after(&self, step: &StepRecord) -> WorkflowResult<()> {
        let instance = self
            .store
            .get_instance(step.instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(step.instance_id))?;

        if instance.status != InstanceStatus::Running {
            info!(instance_id = %instance.id, status = %instance.status, "Instance no longer running; not advancing");
            return Ok(());
        }

        let Some(definition) = self.catalog.get(&instance.workflow_id) else {
            let reason = format!("workflow definition '{}' is no longer in the catalog", instance.workflow_id);
            return self.fail_instance(instance.id, &reason).await;
        };

        self.advance(&instance, &definition, step.step_index as usize + 1).await
    }

    /// Mark a running instance failed. In-flight step records are left as they are.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> WorkflowResult<bool> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(instance_id))?;

        let cancelled = self
            .store
            .update_instance_status(
                instance.id,
                InstanceStatus::Running,
                InstanceStatus::Failed,
                Some("cancelled"),
                self.clock.now(),
            )
            .await?;

        if cancelled {
            info!(%instance_id, workflow = %instance.workflow_id, "Workflow instance cancelled");
        }
        Ok(cancelled)
    }

    pub async fn stats(&self) -> WorkflowResult<WorkflowStats> {
        Ok(self.store.stats().await?)
    }

    pub async fn list_instances(&self, limit: i64, offset: i64) -> WorkflowResult<Vec<InstanceSummary>> {
        Ok(self.store.list_instances(limit, offset).await?)
    }

    pub async fn instance_with_steps(&self, instance_id: Uuid) -> WorkflowResult<InstanceDetail> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(instance_id))?;
        let steps = self.store.list_steps(instance_id).await?;

        Ok(InstanceDetail { instance, steps })
    }

    pub(super) fn tasks(&self) -> &dyn TaskService {
        self.tasks.as_ref()
    }

    pub(super) fn roles(&self) -> &dyn RoleDirectory {
        self.roles.as_ref()
    }
}
