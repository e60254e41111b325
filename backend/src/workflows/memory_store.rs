// In-Memory Workflow Store - Process-local implementation of WorkflowStore
//
// Used by the integration tests and by deployments that run without a
// database. Conditional updates are serialized by the write lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_shared::{
    ApprovalDecision, InstanceStatus, InstanceSummary, StepKindName, StepRecord, StepStatus,
    WorkflowInstance, WorkflowStats,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{NewStepRecord, NewWorkflowInstance, StoreError, StoreResult, WorkflowStore};

#[derive(Debug, Default)]
struct State {
    instances: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<Uuid, StepRecord>,
    /// (instance_id, step_index) -> step id
    step_keys: HashMap<(Uuid, i32), Uuid>,
}

impl State {
    fn is_running(&self, instance_id: Uuid) -> bool {
        self.instances
            .get(&instance_id)
            .is_some_and(|i| i.status == InstanceStatus::Running)
    }
}

#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    state: RwLock<State>,
    unavailable: RwLock<Option<String>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable` until cleared.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write().await = reason.map(str::to_string);
    }

    async fn ensure_available(&self) -> StoreResult<()> {
        match self.unavailable.read().await.as_ref() {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    pub async fn instance_count(&self) -> usize {
        self.state.read().await.instances.len()
    }

    pub async fn all_instances(&self) -> Vec<WorkflowInstance> {
        let state = self.state.read().await;
        let mut instances: Vec<_> = state.instances.values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        instances
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert_instance(&self, instance: NewWorkflowInstance, now: DateTime<Utc>) -> StoreResult<WorkflowInstance> {
        self.ensure_available().await?;

        let record = WorkflowInstance {
            id: Uuid::new_v4(),
            workflow_id: instance.workflow_id,
            event_type: instance.event_type,
            trigger_payload: instance.trigger_payload,
            status: InstanceStatus::Running,
            created_by: instance.created_by,
            error_message: None,
            created_at: now,
            completed_at: None,
        };

        self.state.write().await.instances.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_instance(&self, instance_id: Uuid) -> StoreResult<Option<WorkflowInstance>> {
        self.ensure_available().await?;
        Ok(self.state.read().await.instances.get(&instance_id).cloned())
    }

    async fn update_instance_status(
        &self,
        instance_id: Uuid,
        expected: InstanceStatus,
        new_status: InstanceStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_available().await?;

        let mut state = self.state.write().await;
        match state.instances.get_mut(&instance_id) {
            Some(instance) if instance.status == expected => {
                instance.status = new_status;
                if let Some(message) = error_message {
                    instance.error_message = Some(message.to_string());
                }
                instance.completed_at = new_status.is_terminal().then_some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_step(&self, step: NewStepRecord, now: DateTime<Utc>) -> StoreResult<Option<StepRecord>> {
        self.ensure_available().await?;

        let mut state = self.state.write().await;
        let key = (step.instance_id, step.step_index);
        if state.step_keys.contains_key(&key) {
            return Ok(None);
        }

        let record = StepRecord {
            id: Uuid::new_v4(),
            instance_id: step.instance_id,
            step_index: step.step_index,
            name: step.name,
            kind: step.kind,
            status: StepStatus::Pending,
            scheduled_at: None,
            timeout_at: None,
            related_task_id: None,
            decision: None,
            created_at: now,
            completed_at: None,
        };

        state.step_keys.insert(key, record.id);
        state.steps.insert(record.id, record.clone());
        Ok(Some(record))
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>> {
        self.ensure_available().await?;
        Ok(self.state.read().await.steps.get(&step_id).cloned())
    }

    async fn list_steps(&self, instance_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        self.ensure_available().await?;

        let state = self.state.read().await;
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn update_step_status(
        &self,
        step_id: Uuid,
        expected: StepStatus,
        new_status: StepStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_available().await?;

        let mut state = self.state.write().await;
        let Some(step) = state.steps.get_mut(&step_id) else {
            return Ok(false);
        };
        if step.status != expected {
            return Ok(false);
        }

        step.status = new_status;
        match new_status {
            StepStatus::Scheduled => step.scheduled_at = Some(at),
            StepStatus::Pending => {
                step.scheduled_at = None;
                step.completed_at = None;
            }
            StepStatus::Completed | StepStatus::TimedOut => {
                step.scheduled_at = None;
                step.completed_at = Some(at);
            }
        }
        Ok(true)
    }

    async fn attach_approval(
        &self,
        step_id: Uuid,
        related_task_id: Option<Uuid>,
        timeout_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.ensure_available().await?;

        if let Some(step) = self.state.write().await.steps.get_mut(&step_id) {
            step.related_task_id = related_task_id;
            step.timeout_at = timeout_at;
        }
        Ok(())
    }

    async fn complete_approval(&self, step_id: Uuid, decision: ApprovalDecision, at: DateTime<Utc>) -> StoreResult<bool> {
        self.ensure_available().await?;

        let mut state = self.state.write().await;
        match state.steps.get_mut(&step_id) {
            Some(step) if step.status == StepStatus::Pending && step.kind == StepKindName::Approval => {
                step.status = StepStatus::Completed;
                step.decision = Some(decision);
                step.completed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn due_scheduled_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.ensure_available().await?;

        let state = self.state.read().await;
        let mut due: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Scheduled && s.scheduled_at.is_some_and(|t| t <= now))
            .filter(|s| state.is_running(s.instance_id))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn timed_out_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.ensure_available().await?;

        let state = self.state.read().await;
        let mut expired: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Pending && s.timeout_at.is_some_and(|t| t <= now))
            .filter(|s| state.is_running(s.instance_id))
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.timeout_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn stalled_steps(&self, completed_before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.ensure_available().await?;

        let state = self.state.read().await;
        let mut latest: HashMap<Uuid, &StepRecord> = HashMap::new();
        for step in state.steps.values().filter(|s| state.is_running(s.instance_id)) {
            let entry = latest.entry(step.instance_id).or_insert(step);
            if step.step_index > entry.step_index {
                *entry = step;
            }
        }

        let mut stalled: Vec<_> = latest
            .into_values()
            .filter(|s| s.status == StepStatus::Completed && s.completed_at.is_some_and(|t| t <= completed_before))
            .cloned()
            .collect();
        stalled.sort_by_key(|s| s.completed_at);
        stalled.truncate(limit.max(0) as usize);
        Ok(stalled)
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> StoreResult<Vec<InstanceSummary>> {
        self.ensure_available().await?;

        let state = self.state.read().await;
        let mut instances: Vec<_> = state.instances.values().collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let summaries = instances
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|instance| {
                let steps = state.steps.values().filter(|s| s.instance_id == instance.id);
                let (total, completed) = steps.fold((0, 0), |(total, completed), s| {
                    (total + 1, completed + i64::from(s.status == StepStatus::Completed))
                });
                InstanceSummary {
                    instance: instance.clone(),
                    total_steps: total,
                    completed_steps: completed,
                }
            })
            .collect();

        Ok(summaries)
    }

    async fn stats(&self) -> StoreResult<WorkflowStats> {
        self.ensure_available().await?;

        let state = self.state.read().await;
        let mut stats = WorkflowStats::default();

        for instance in state.instances.values() {
            stats.total_instances += 1;
            match instance.status {
                InstanceStatus::Running => stats.running_instances += 1,
                InstanceStatus::Completed => stats.completed_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
            }
        }

        for step in state.steps.values() {
            stats.total_steps += 1;
            match step.status {
                StepStatus::Pending => stats.pending_steps += 1,
                StepStatus::Scheduled => stats.scheduled_steps += 1,
                StepStatus::Completed => stats.completed_steps += 1,
                StepStatus::TimedOut => stats.timed_out_steps += 1,
            }
        }

        Ok(stats)
    }
}
