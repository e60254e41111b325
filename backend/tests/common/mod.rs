// Common test utilities that are shared across integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fake::Fake;
use fake::faker::company::en::CompanyName;
use fake::faker::internet::en::SafeEmail;
use ledgerflow_backend::workflows::{
    ActionRequest, BusinessActions, Clock, Collaborators, EngineConfig, ManualClock,
    MemoryWorkflowStore, NewTask, RoleDirectory, ServiceError, TaskService, WorkflowCatalog,
    WorkflowEngine,
};
use ledgerflow_backend::workflows::store::{
    NewStepRecord, NewWorkflowInstance, StoreError, StoreResult, WorkflowStore,
};
use ledgerflow_shared::{
    ApprovalDecision, InstanceStatus, InstanceSummary, StepRecord, StepStatus, WorkflowInstance,
    WorkflowStats,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init()
            .ok();
    });
}

pub fn start_of_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Task service that keeps every task it was asked to create.
#[derive(Default)]
pub struct RecordingTasks {
    created: Mutex<Vec<(Uuid, NewTask)>>,
    failing: Mutex<bool>,
    gate: Arc<RwLock<()>>,
}

impl RecordingTasks {
    /// Block every `create_task` call until the returned guard is dropped.
    pub async fn hold(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().write_owned().await
    }

    pub fn created(&self) -> Vec<(Uuid, NewTask)> {
        self.created.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.created().into_iter().map(|(_, task)| task.title).collect()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl TaskService for RecordingTasks {
    async fn create_task(&self, task: NewTask) -> Result<Uuid, ServiceError> {
        let _open = self.gate.read().await;
        if *self.failing.lock().unwrap() {
            return Err(ServiceError::external("tasks", "task store offline"));
        }
        let id = Uuid::new_v4();
        self.created.lock().unwrap().push((id, task));
        Ok(id)
    }
}

/// Fixed role -> user table.
#[derive(Default)]
pub struct StaticRoles {
    holders: HashMap<String, Uuid>,
}

impl StaticRoles {
    pub fn with(mut self, role: &str, user_id: Uuid) -> Self {
        self.holders.insert(role.to_string(), user_id);
        self
    }
}

#[async_trait]
impl RoleDirectory for StaticRoles {
    async fn find_active_user_by_role(&self, role: &str) -> Result<Option<Uuid>, ServiceError> {
        Ok(self.holders.get(role).copied())
    }
}

/// Business actions that record (action, instance) pairs and can be told to fail.
#[derive(Default)]
pub struct RecordingActions {
    calls: Mutex<Vec<(String, Uuid)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingActions {
    pub fn calls(&self) -> Vec<(String, Uuid)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls().iter().filter(|(name, _)| name == action).count()
    }

    pub fn fail(&self, action: &str) {
        self.failing.lock().unwrap().insert(action.to_string());
    }

    fn record(&self, action: &str, request: &ActionRequest<'_>) -> Result<Value, ServiceError> {
        if self.failing.lock().unwrap().contains(action) {
            return Err(ServiceError::external(action, "ledger rejected the request"));
        }
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), request.instance.id));
        Ok(json!({ "ok": true }))
    }
}

#[async_trait]
impl BusinessActions for RecordingActions {
    async fn schedule_payment(&self, request: &ActionRequest<'_>) -> Result<Value, ServiceError> {
        self.record("schedule_payment", request)
    }

    async fn send_portal_invite(&self, request: &ActionRequest<'_>) -> Result<Value, ServiceError> {
        self.record("send_portal_invite", request)
    }

    async fn require_approval(&self, request: &ActionRequest<'_>) -> Result<Value, ServiceError> {
        self.record("require_approval", request)
    }
}

/// Wraps the in-memory store and fails chosen calls on request.
pub struct FaultyStore {
    inner: Arc<MemoryWorkflowStore>,
    /// Per operation, outcomes of the upcoming calls: `false` fails the call
    plans: Mutex<HashMap<&'static str, VecDeque<bool>>>,
    rejected_workflows: Mutex<HashSet<String>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryWorkflowStore>) -> Self {
        Self {
            inner,
            plans: Mutex::new(HashMap::new()),
            rejected_workflows: Mutex::new(HashSet::new()),
        }
    }

    /// Fail only the next call to `operation`.
    pub fn fail_next(&self, operation: &'static str) {
        self.fail_nth(operation, 1);
    }

    /// Let `nth - 1` calls to `operation` through, then fail one.
    pub fn fail_nth(&self, operation: &'static str, nth: usize) {
        let mut plan: VecDeque<bool> = std::iter::repeat_n(true, nth.saturating_sub(1)).collect();
        plan.push_back(false);
        self.plans.lock().unwrap().insert(operation, plan);
    }

    /// Refuse to create instances of one workflow.
    pub fn reject_workflow(&self, workflow_id: &str) {
        self.rejected_workflows.lock().unwrap().insert(workflow_id.to_string());
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        let mut plans = self.plans.lock().unwrap();
        let proceed = plans
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or(true);
        if proceed {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("{} interrupted", operation)))
        }
    }
}

#[async_trait]
impl WorkflowStore for FaultyStore {
    async fn insert_instance(&self, instance: NewWorkflowInstance, now: DateTime<Utc>) -> StoreResult<WorkflowInstance> {
        if self.rejected_workflows.lock().unwrap().contains(&instance.workflow_id) {
            return Err(StoreError::Unavailable(format!("{} rejected", instance.workflow_id)));
        }
        self.check("insert_instance")?;
        self.inner.insert_instance(instance, now).await
    }

    async fn get_instance(&self, instance_id: Uuid) -> StoreResult<Option<WorkflowInstance>> {
        self.check("get_instance")?;
        self.inner.get_instance(instance_id).await
    }

    async fn update_instance_status(
        &self,
        instance_id: Uuid,
        expected: InstanceStatus,
        new_status: InstanceStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check("update_instance_status")?;
        self.inner
            .update_instance_status(instance_id, expected, new_status, error_message, now)
            .await
    }

    async fn insert_step(&self, step: NewStepRecord, now: DateTime<Utc>) -> StoreResult<Option<StepRecord>> {
        self.check("insert_step")?;
        self.inner.insert_step(step, now).await
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>> {
        self.check("get_step")?;
        self.inner.get_step(step_id).await
    }

    async fn list_steps(&self, instance_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        self.check("list_steps")?;
        self.inner.list_steps(instance_id).await
    }

    async fn update_step_status(
        &self,
        step_id: Uuid,
        expected: StepStatus,
        new_status: StepStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check("update_step_status")?;
        self.inner.update_step_status(step_id, expected, new_status, at).await
    }

    async fn attach_approval(
        &self,
        step_id: Uuid,
        related_task_id: Option<Uuid>,
        timeout_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.check("attach_approval")?;
        self.inner.attach_approval(step_id, related_task_id, timeout_at).await
    }

    async fn complete_approval(&self, step_id: Uuid, decision: ApprovalDecision, at: DateTime<Utc>) -> StoreResult<bool> {
        self.check("complete_approval")?;
        self.inner.complete_approval(step_id, decision, at).await
    }

    async fn due_scheduled_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.check("due_scheduled_steps")?;
        self.inner.due_scheduled_steps(now, limit).await
    }

    async fn timed_out_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.check("timed_out_steps")?;
        self.inner.timed_out_steps(now, limit).await
    }

    async fn stalled_steps(&self, completed_before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.check("stalled_steps")?;
        self.inner.stalled_steps(completed_before, limit).await
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> StoreResult<Vec<InstanceSummary>> {
        self.check("list_instances")?;
        self.inner.list_instances(limit, offset).await
    }

    async fn stats(&self) -> StoreResult<WorkflowStats> {
        self.check("stats")?;
        self.inner.stats().await
    }
}

/// Engine wired to the in-memory store, a manual clock and recording collaborators.
pub struct TestHarness {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<MemoryWorkflowStore>,
    /// What the engine actually talks to; wraps `store`
    pub faults: Arc<FaultyStore>,
    pub clock: ManualClock,
    pub tasks: Arc<RecordingTasks>,
    pub actions: Arc<RecordingActions>,
    pub admin_id: Uuid,
}

impl TestHarness {
    pub fn new(catalog: WorkflowCatalog) -> Self {
        Self::with_config(catalog, EngineConfig::default())
    }

    pub fn with_config(catalog: WorkflowCatalog, config: EngineConfig) -> Self {
        let admin_id = Uuid::new_v4();
        Self::build(catalog, config, StaticRoles::default().with("admin", admin_id), admin_id)
    }

    /// Nobody holds any role.
    pub fn without_roles(catalog: WorkflowCatalog) -> Self {
        Self::build(catalog, EngineConfig::default(), StaticRoles::default(), Uuid::new_v4())
    }

    fn build(catalog: WorkflowCatalog, config: EngineConfig, roles: StaticRoles, admin_id: Uuid) -> Self {
        init_test_logging();

        let store = Arc::new(MemoryWorkflowStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let clock = ManualClock::new(start_of_day());
        let tasks = Arc::new(RecordingTasks::default());
        let actions = Arc::new(RecordingActions::default());

        let collaborators = Collaborators {
            tasks: tasks.clone(),
            roles: Arc::new(roles),
            actions: actions.clone(),
        };
        let engine_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(catalog),
            faults.clone(),
            collaborators,
            engine_clock,
            config,
        ));

        Self {
            engine,
            store,
            faults,
            clock,
            tasks,
            actions,
            admin_id,
        }
    }

    pub async fn instance(&self, instance_id: Uuid) -> WorkflowInstance {
        self.engine.instance_with_steps(instance_id).await.unwrap().instance
    }

    pub async fn steps(&self, instance_id: Uuid) -> Vec<StepRecord> {
        self.engine.instance_with_steps(instance_id).await.unwrap().steps
    }
}

/// Build a catalog from literal JSON definitions.
pub fn catalog(definitions: Value) -> WorkflowCatalog {
    WorkflowCatalog::from_json_str(&definitions.to_string()).unwrap()
}

pub fn invoice_payload(total_amount: i64) -> Value {
    json!({
        "invoice_id": Uuid::new_v4(),
        "invoice_number": format!("INV-{}", (1000..9999).fake::<u32>()),
        "customer_name": CompanyName().fake::<String>(),
        "customer_email": SafeEmail().fake::<String>(),
        "total_amount": total_amount
    })
}
